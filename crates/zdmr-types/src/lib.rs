//! Shared types for Z-DMR
//!
//! This crate contains the data structures shared between the download
//! engine, the control API, and any client of it (CLI, or a future GUI
//! shell talking over the loopback API). It has no I/O of its own.

mod error;

pub use error::{ErrorCode, RetryKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Download Types
// ============================================================================

/// A single download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Download {
    pub id: Uuid,
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub destination: PathBuf,
    pub size: Option<u64>,
    pub downloaded: u64,
    pub status: DownloadStatus,
    pub supports_ranges: SupportsRanges,
    pub segments: Vec<Segment>,
    pub batch_id: Option<Uuid>,
    pub speed_limit: Option<u64>,
    /// Host currently in use, which may differ from the original URL's
    /// host after a mirror fallback.
    pub mirror_used: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Download {
    pub fn new(url: String, destination: PathBuf, batch_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url,
            final_url: None,
            filename: String::new(),
            destination,
            size: None,
            downloaded: 0,
            status: DownloadStatus::Queued,
            supports_ranges: SupportsRanges::Unknown,
            segments: Vec::new(),
            batch_id,
            speed_limit: None,
            mirror_used: None,
            etag: None,
            last_modified: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn progress(&self) -> f64 {
        match self.size {
            Some(size) if size > 0 => (self.downloaded as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Lifecycle state of a download. Exactly the five states a download can
/// be persisted in; "cancelled" is a transient in-flight signal, not a
/// status, and deletion removes the row rather than marking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadStatus::Queued => "QUEUED",
            DownloadStatus::Downloading => "DOWNLOADING",
            DownloadStatus::Paused => "PAUSED",
            DownloadStatus::Completed => "COMPLETED",
            DownloadStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Whether the remote server has been observed to honor byte-range
/// requests for a given download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupportsRanges {
    Unknown,
    Yes,
    No,
}

/// A contiguous byte range of a multi-part download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    pub end: u64,
    pub downloaded: u64,
    pub complete: bool,
}

impl Segment {
    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            downloaded: 0,
            complete: false,
        }
    }

    /// Total byte length of this segment (inclusive range).
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn progress(&self) -> f64 {
        (self.downloaded as f64 / self.size() as f64) * 100.0
    }
}

// ============================================================================
// Batch Types
// ============================================================================

/// A group of downloads added together. Unlike the old notion of a
/// "queue", a batch carries no scheduling or concurrency limits of its
/// own — admission control is global (see `Settings::max_concurrent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: Uuid,
    pub name: String,
    pub destination: PathBuf,
    pub force_proxy: bool,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(name: String, destination: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            destination,
            force_proxy: false,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Rule Types
// ============================================================================

/// A hostname-pattern-matched policy entry consulted by the rule engine.
/// Ties between matching rules break by ascending `id` — the order they
/// were created in, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: i64,
    pub host_pattern: String,
    pub enabled: bool,
    pub kind: RuleKind,
}

/// Whether a header rule always wins, or only fills a gap the request
/// doesn't already set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HeaderMode {
    Override,
    AddIfMissing,
}

/// What a rule contributes once it matches a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleKind {
    Proxy { proxy_url: String, use_proxy: bool },
    Header { name: String, value: String, mode: HeaderMode },
    /// Ordered fallback base URLs to retry against, tried in list order.
    Mirror { mirror_hosts: Vec<String> },
}

// ============================================================================
// Settings Types
// ============================================================================

/// Global application settings, persisted as key/value pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub default_download_path: PathBuf,
    pub max_concurrent_downloads: u32,
    pub default_segments: u32,
    pub global_speed_limit: Option<u64>,
    /// Whether `default_proxy_url` is applied to hosts with no matching
    /// proxy rule. Per-host proxy rules are still consulted even when
    /// this is `false`.
    pub global_proxy_enabled: bool,
    pub default_proxy_url: Option<String>,
    pub max_retries: u32,
    pub control_api_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_download_path: directories::UserDirs::new()
                .and_then(|d| d.download_dir().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent_downloads: 4,
            default_segments: 8,
            global_speed_limit: None,
            global_proxy_enabled: false,
            default_proxy_url: None,
            max_retries: 5,
            control_api_port: 7899,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine, fanned out over the progress bus and the
/// control API's SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoreEvent {
    /// Batched per-download progress, emitted on a single shared cadence.
    ProgressBatch { items: Vec<DownloadProgress> },
    /// A download's status, as opposed to its byte progress, changed.
    DownloadStatusChanged {
        id: Uuid,
        status: DownloadStatus,
        error_code: Option<ErrorCode>,
        error_message: Option<String>,
    },
    /// Structural change: a download or batch was added or removed.
    DownloadsChanged,
}

/// One download's progress snapshot within a `ProgressBatch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub id: Uuid,
    pub downloaded: u64,
    pub total: Option<u64>,
    /// Bytes/sec, EWMA-smoothed.
    pub speed: f64,
    pub eta_seconds: Option<u64>,
}

// ============================================================================
// Control API request/response Types
// ============================================================================

/// Body of `POST /downloads`. Accepts one or more URLs in a single call;
/// each becomes its own `Download` sharing `destination`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDownloadRequest {
    pub urls: Vec<String>,
    pub dest_dir: Option<PathBuf>,
}

/// Body of `POST /batches`. `urls` and `raw_url_list` (whitespace
/// separated, filtered to http/https) may both be present; the engine
/// merges them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBatchRequest {
    pub name: Option<String>,
    pub dest_dir: PathBuf,
    pub raw_url_list: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    pub download_through_proxy: Option<bool>,
}

/// Information about a URL obtained via a HEAD/ranged-GET probe, returned
/// to a client before a download is actually created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub supports_ranges: SupportsRanges,
}
