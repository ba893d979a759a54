//! Stable error codes shared between the engine, its persisted records,
//! and anyone consuming the control API.

use serde::{Deserialize, Serialize};

/// Closed set of error classifications a download can end in. The
/// `Display` strings are the stable wire/storage representation — do
/// not reorder or rename variants without keeping these strings fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DnsFail,
    ConnectFail,
    TlsFail,
    Http4xx,
    Http5xx,
    Timeout,
    RangeUnsupported,
    DiskFull,
    RemoteChanged,
    PermissionDenied,
    Cancelled,
    InvalidUrl,
    Unknown,
}

impl ErrorCode {
    /// Whether a fetch ending in this error should ever be retried
    /// automatically (by the stall watchdog / mirror fallback), as
    /// opposed to only via an explicit user-triggered retry.
    pub fn is_auto_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::DnsFail
                | ErrorCode::ConnectFail
                | ErrorCode::TlsFail
                | ErrorCode::Http5xx
                | ErrorCode::Timeout
                | ErrorCode::Unknown
        )
    }

    pub fn retry_kind(self) -> RetryKind {
        match self {
            ErrorCode::DnsFail | ErrorCode::ConnectFail | ErrorCode::TlsFail | ErrorCode::Http5xx => {
                RetryKind::MirrorThenBackoff
            }
            ErrorCode::Timeout | ErrorCode::Unknown => RetryKind::Backoff,
            _ => RetryKind::None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::DnsFail => "DNS_FAIL",
            ErrorCode::ConnectFail => "CONNECT_FAIL",
            ErrorCode::TlsFail => "TLS_FAIL",
            ErrorCode::Http4xx => "HTTP_4XX",
            ErrorCode::Http5xx => "HTTP_5XX",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RangeUnsupported => "RANGE_UNSUPPORTED",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::RemoteChanged => "REMOTE_CHANGED",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// How the engine should react to a retryable error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Try a mirror first (if any are configured); fall back to backoff
    /// on the original host if none apply or all are exhausted.
    MirrorThenBackoff,
    /// Retry the same host after an exponential backoff delay.
    Backoff,
    /// Do not retry automatically.
    None,
}
