//! Engine error types

use orb_core::{ErrorCode, OrbError};
use orb_file::FileError;
use orb_spatial::SpatialError;
use thiserror::Error;

use crate::TrackId;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Track not found: {0}")]
    TrackNotFound(TrackId),

    #[error("Already recording to {0}")]
    AlreadyRecording(String),

    #[error("Not recording")]
    NotRecording,

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Spatial(#[from] SpatialError),

    #[error(transparent)]
    Core(#[from] OrbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidConfig(_) | Self::InvalidArg(_) | Self::Config(_) => ErrorCode::InvalidArg,
            Self::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Self::TrackNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyRecording(_) => ErrorCode::Busy,
            Self::NotRecording => ErrorCode::InvalidArg,
            Self::File(e) => e.code(),
            Self::Spatial(e) => e.code(),
            Self::Core(e) => e.code(),
            Self::Io(_) => ErrorCode::IoError,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Collapse a result into the host error code
pub fn engine_code<T>(result: &EngineResult<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}
