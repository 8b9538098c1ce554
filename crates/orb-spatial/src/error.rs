//! Error types for spatial audio processing

use orb_core::{ErrorCode, OrbError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpatialError {
    /// Channel count has no matching layout
    #[error("Unsupported channel count: {0}")]
    UnsupportedLayout(usize),

    #[error("Invalid channel count: expected {expected}, got {got}")]
    InvalidChannelCount { expected: usize, got: usize },

    #[error("Buffer size mismatch: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },

    #[error("Invalid HRTF data: {0}")]
    InvalidHrtf(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SpatialError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnsupportedLayout(_) | Self::InvalidHrtf(_) => ErrorCode::UnsupportedFormat,
            Self::InvalidChannelCount { .. }
            | Self::BufferSizeMismatch { .. }
            | Self::InvalidParameter(_) => ErrorCode::InvalidArg,
            Self::Io(_) => ErrorCode::IoError,
        }
    }
}

pub type SpatialResult<T> = Result<T, SpatialError>;

impl From<SpatialError> for OrbError {
    fn from(err: SpatialError) -> Self {
        match err {
            SpatialError::Io(e) => OrbError::Io(e),
            other => match other.code() {
                ErrorCode::UnsupportedFormat => OrbError::UnsupportedFormat(other.to_string()),
                _ => OrbError::InvalidArg(other.to_string()),
            },
        }
    }
}
