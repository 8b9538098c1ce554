//! File I/O error types

use orb_core::{ErrorCode, OrbError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid file: {0}")]
    InvalidFile(String),

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("WAV error: {0}")]
    WavError(String),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Writer error: {0}")]
    WriterError(String),
}

impl FileError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Io(_) | Self::WavError(_) | Self::WriterError(_) => ErrorCode::IoError,
            Self::UnsupportedFormat(_) | Self::InvalidFile(_) | Self::DecodeError(_) => {
                ErrorCode::UnsupportedFormat
            }
            Self::InvalidArg(_) => ErrorCode::InvalidArg,
        }
    }
}

pub type FileResult<T> = Result<T, FileError>;

impl From<hound::Error> for FileError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => FileError::Io(e),
            hound::Error::FormatError(msg) => FileError::InvalidFile(msg.to_string()),
            hound::Error::Unsupported => {
                FileError::UnsupportedFormat("unsupported WAV encoding".to_string())
            }
            other => FileError::WavError(other.to_string()),
        }
    }
}

impl From<symphonia::core::errors::Error> for FileError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error;
        match err {
            Error::IoError(e) => FileError::Io(e),
            Error::Unsupported(what) => FileError::UnsupportedFormat(what.to_string()),
            other => FileError::DecodeError(other.to_string()),
        }
    }
}

impl From<FileError> for OrbError {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound(path) => OrbError::NotFound(path),
            FileError::Io(e) => OrbError::Io(e),
            FileError::InvalidArg(msg) => OrbError::InvalidArg(msg),
            other => match other.code() {
                ErrorCode::UnsupportedFormat => OrbError::UnsupportedFormat(other.to_string()),
                _ => OrbError::Io(std::io::Error::other(other.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(FileError::NotFound("x".into()).code(), ErrorCode::NotFound);
        assert_eq!(FileError::DecodeError("x".into()).code(), ErrorCode::UnsupportedFormat);
        assert_eq!(FileError::WriterError("x".into()).code(), ErrorCode::IoError);
    }

    #[test]
    fn test_into_orb_error_keeps_code() {
        for err in [
            FileError::NotFound("a.wav".into()),
            FileError::InvalidFile("bad header".into()),
            FileError::WavError("broken".into()),
            FileError::InvalidArg("channels".into()),
        ] {
            let code = err.code();
            assert_eq!(OrbError::from(err).code(), code);
        }
    }
}
