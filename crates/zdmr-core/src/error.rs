//! Error types for the Z-DMR engine.

use thiserror::Error;
use uuid::Uuid;
use zdmr_types::ErrorCode;

/// Errors that can occur anywhere in the engine. `code()` maps each
/// variant onto the stable taxonomy clients and the persistence layer
/// rely on.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("download not found: {0}")]
    NotFound(Uuid),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server responded {status}: {message}")]
    Http { status: u16, message: String },

    #[error("remote file changed since last attempt")]
    RemoteChanged,

    #[error("server does not support byte ranges")]
    RangeUnsupported,

    #[error("disk is full")]
    DiskFull,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("operation timed out")]
    Timeout,

    #[error("download was cancelled")]
    Cancelled,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("unknown error: {0}")]
    Unknown(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::Network(e) => {
                if e.is_timeout() {
                    ErrorCode::Timeout
                } else if e.is_connect() {
                    ErrorCode::ConnectFail
                } else {
                    ErrorCode::Unknown
                }
            }
            EngineError::Io(_) => ErrorCode::Unknown,
            EngineError::Store(_) => ErrorCode::Unknown,
            EngineError::NotFound(_) => ErrorCode::Unknown,
            EngineError::InvalidUrl(_) => ErrorCode::InvalidUrl,
            EngineError::Http { status, .. } if *status >= 500 => ErrorCode::Http5xx,
            EngineError::Http { .. } => ErrorCode::Http4xx,
            EngineError::RemoteChanged => ErrorCode::RemoteChanged,
            EngineError::RangeUnsupported => ErrorCode::RangeUnsupported,
            EngineError::DiskFull => ErrorCode::DiskFull,
            EngineError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            EngineError::Timeout => ErrorCode::Timeout,
            EngineError::Cancelled => ErrorCode::Cancelled,
            EngineError::InvalidOperation(_) => ErrorCode::Unknown,
            EngineError::Unknown(_) => ErrorCode::Unknown,
        }
    }

    pub fn is_auto_retryable(&self) -> bool {
        self.code().is_auto_retryable()
    }
}

impl From<EngineError> for String {
    fn from(error: EngineError) -> Self {
        error.to_string()
    }
}
