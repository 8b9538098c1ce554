//! Error types and host-facing error codes

use thiserror::Error;

/// Value-typed result code exposed to hosts.
///
/// Discriminants are stable and may cross an FFI boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArg = -1,
    NotFound = -2,
    IoError = -3,
    NoMemory = -4,
    UnsupportedFormat = -5,
    Busy = -6,
    Timeout = -7,
    EndOfData = -8,
    Partial = -9,
}

impl ErrorCode {
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidArg => "INVALID_ARG",
            Self::NotFound => "NOT_FOUND",
            Self::IoError => "IO_ERROR",
            Self::NoMemory => "NO_MEMORY",
            Self::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            Self::Busy => "BUSY",
            Self::Timeout => "TIMEOUT",
            Self::EndOfData => "END_OF_DATA",
            Self::Partial => "PARTIAL",
        }
    }
}

impl From<i32> for ErrorCode {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            -1 => Self::InvalidArg,
            -2 => Self::NotFound,
            -3 => Self::IoError,
            -4 => Self::NoMemory,
            -5 => Self::UnsupportedFormat,
            -6 => Self::Busy,
            -7 => Self::Timeout,
            -8 => Self::EndOfData,
            _ => Self::Partial,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Error, Debug)]
pub enum OrbError {
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("End of data")]
    EndOfData,

    #[error("Partial transfer: {done} of {requested}")]
    Partial { done: usize, requested: usize },
}

impl OrbError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArg(_) => ErrorCode::InvalidArg,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Io(_) => ErrorCode::IoError,
            Self::NoMemory(_) => ErrorCode::NoMemory,
            Self::UnsupportedFormat(_) => ErrorCode::UnsupportedFormat,
            Self::Busy(_) => ErrorCode::Busy,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::EndOfData => ErrorCode::EndOfData,
            Self::Partial { .. } => ErrorCode::Partial,
        }
    }
}

pub type OrbResult<T> = Result<T, OrbError>;

/// Collapse a result into the host error code
pub fn result_code<T>(result: &OrbResult<T>) -> ErrorCode {
    match result {
        Ok(_) => ErrorCode::Ok,
        Err(e) => e.code(),
    }
}
