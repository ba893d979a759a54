//! Segmented fetcher: probe, resume validation, segment planning, the
//! actual ranged fetch of one segment, and the final merge.
//!
//! One `SegmentWorker` per segment, each writing to its own temp file in
//! the engine's temp directory; the scheduler (`engine.rs`) fans these
//! out and joins them. This module has no notion of retries, mirrors, or
//! the overall download state machine — that's the scheduler's job.

use crate::error::EngineError;
use crate::rate_limiter::RateLimiter;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;
use zdmr_types::Segment;

const MIN_SEGMENT_SIZE_FOR_SPLIT: u64 = 2 * 1024 * 1024;
const SEGMENT_TARGET_SIZE: u64 = 4 * 1024 * 1024;
const MAX_SEGMENTS: u32 = 8;
const SEGMENT_PROGRESS_CHECKPOINT: std::time::Duration = std::time::Duration::from_millis(500);

/// Everything learned about a remote resource from a HEAD/ranged-GET probe.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub final_url: String,
    pub size: Option<u64>,
    pub supports_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
}

/// HEAD first; if that doesn't yield a size, fall back to a ranged GET
/// for `bytes=0-0` — some CDNs omit `Content-Length` on HEAD but honor
/// it on GET.
pub async fn probe(client: &Client, url: &str) -> Result<ProbeResult, EngineError> {
    let response = client.head(url).send().await?;
    let final_url = response.url().to_string();

    let mut size = content_length(&response);
    let mut supports_ranges = accepts_ranges(&response);
    let etag = header_str(&response, reqwest::header::ETAG);
    let last_modified = header_str(&response, reqwest::header::LAST_MODIFIED);
    let content_disposition = header_str(&response, reqwest::header::CONTENT_DISPOSITION);
    let content_type = header_str(&response, reqwest::header::CONTENT_TYPE);

    if size.is_none() {
        info!("HEAD for {} returned no Content-Length, trying ranged GET", url);
        let ranged = client
            .get(&final_url)
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await?;

        match ranged.status() {
            StatusCode::PARTIAL_CONTENT => {
                supports_ranges = true;
                if let Some(total) = content_range_total(&ranged) {
                    size = Some(total);
                }
            }
            StatusCode::OK => {
                size = content_length(&ranged);
                supports_ranges = false;
            }
            other => warn!("ranged probe GET for {} returned {}", url, other),
        }
    }

    Ok(ProbeResult {
        final_url,
        size,
        supports_ranges,
        etag,
        last_modified,
        content_disposition,
        content_type,
    })
}

/// Abort a resume if the remote file has changed since we last probed
/// it. Only compares validators we actually have on both sides — a
/// download started before the remote ever sent an ETag has nothing to
/// validate against and is allowed to resume.
pub fn validate_resume(
    prior_etag: Option<&str>,
    prior_last_modified: Option<&str>,
    probe: &ProbeResult,
) -> Result<(), EngineError> {
    if let (Some(prior), Some(current)) = (prior_etag, probe.etag.as_deref()) {
        if prior != current {
            return Err(EngineError::RemoteChanged);
        }
    }
    if let (Some(prior), Some(current)) = (prior_last_modified, probe.last_modified.as_deref()) {
        if prior != current {
            return Err(EngineError::RemoteChanged);
        }
    }
    Ok(())
}

/// Plan the segment layout for a resource of `size` bytes. Files under
/// `MIN_SEGMENT_SIZE_FOR_SPLIT`, or a server that doesn't honor ranges,
/// get a single segment (the single-stream downgrade path).
pub fn plan_segments(size: Option<u64>, supports_ranges: bool) -> Vec<Segment> {
    let Some(size) = size else {
        return vec![Segment::new(0, 0, u64::MAX)];
    };
    if !supports_ranges || size < MIN_SEGMENT_SIZE_FOR_SPLIT || size == 0 {
        return vec![Segment::new(0, 0, size.saturating_sub(1))];
    }

    let count = ((size + SEGMENT_TARGET_SIZE - 1) / SEGMENT_TARGET_SIZE)
        .clamp(1, MAX_SEGMENTS as u64) as u32;
    let segment_size = size / count as u64;

    (0..count)
        .map(|i| {
            let start = i as u64 * segment_size;
            let end = if i == count - 1 {
                size - 1
            } else {
                (i as u64 + 1) * segment_size - 1
            };
            Segment::new(i, start, end)
        })
        .collect()
}

/// Where a segment's working data lives while the download is in flight.
pub fn segment_temp_path(temp_dir: &Path, download_id: Uuid, segment_index: u32) -> PathBuf {
    temp_dir.join(format!("{download_id}_segment_{segment_index}.part"))
}

/// Outcome of fetching a single segment to completion (or being
/// interrupted by pause/cancel).
pub struct SegmentOutcome {
    pub discovered_size: Option<u64>,
}

/// Callbacks a segment fetch reports progress and periodic checkpoints
/// through, kept generic so `fetcher` stays decoupled from the store
/// and progress-bus types.
pub struct SegmentFetchContext<'a> {
    pub client: &'a Client,
    pub url: &'a str,
    pub download_id: Uuid,
    pub temp_dir: &'a Path,
    pub rate_limiter: &'a RateLimiter,
    pub paused: &'a AtomicBool,
    pub cancelled: &'a AtomicBool,
    pub total_downloaded: &'a AtomicU64,
    /// How many segments the current plan has in total — needed to tell
    /// a legitimate whole-file `200` (single segment, starting at byte 0)
    /// apart from a server silently ignoring our `Range` header midway
    /// through a multi-segment plan.
    pub total_segments: usize,
    pub on_checkpoint: &'a (dyn Fn(u32, u64, bool) + Sync),
}

/// Fetch one segment's byte range into its temp file, resuming from
/// whatever bytes are already on disk. Returns once the segment is
/// complete, or a `Cancelled`/Io error if pause/cancel was observed
/// mid-stream (pause is surfaced as `Cancelled` too — the scheduler
/// tells the two apart by checking the flags it already holds).
pub async fn fetch_segment(
    ctx: &SegmentFetchContext<'_>,
    segment: &mut Segment,
) -> Result<SegmentOutcome, EngineError> {
    if segment.complete {
        return Ok(SegmentOutcome { discovered_size: None });
    }

    let temp_path = segment_temp_path(ctx.temp_dir, ctx.download_id, segment.index);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .read(true)
        .open(&temp_path)
        .await?;

    let existing = file.metadata().await?.len();
    let unknown_size = segment.end == u64::MAX;
    if existing > 0 && (unknown_size || existing <= segment.size()) {
        segment.downloaded = existing;
        file.seek(std::io::SeekFrom::Start(existing)).await?;
    }

    let start_byte = segment.start + segment.downloaded;
    if !unknown_size && start_byte > segment.end {
        segment.complete = true;
        (ctx.on_checkpoint)(segment.index, segment.downloaded, true);
        return Ok(SegmentOutcome { discovered_size: None });
    }

    let request = if unknown_size && start_byte == 0 {
        ctx.client.get(ctx.url)
    } else if unknown_size {
        ctx.client
            .get(ctx.url)
            .header(reqwest::header::RANGE, format!("bytes={start_byte}-"))
    } else {
        ctx.client
            .get(ctx.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{}", start_byte, segment.end))
    };

    let sent_range_header = !(unknown_size && start_byte == 0);

    let response = request.send().await?;
    let status = response.status();

    if status == StatusCode::OK && sent_range_header && (start_byte > 0 || ctx.total_segments > 1) {
        warn!(
            "server returned 200 for a ranged request on segment {} (expected 206), range unsupported",
            segment.index
        );
        return Err(EngineError::RangeUnsupported);
    }

    if !status.is_success() && status != StatusCode::PARTIAL_CONTENT {
        return Err(EngineError::Http {
            status: status.as_u16(),
            message: format!("segment {} fetch failed", segment.index),
        });
    }

    let mut discovered_size = None;
    if unknown_size {
        if let Some(total) = content_range_total(&response) {
            segment.end = total.saturating_sub(1);
            discovered_size = Some(total);
        } else if let Some(len) = content_length(&response) {
            let total = if start_byte > 0 { start_byte + len } else { len };
            segment.end = total.saturating_sub(1);
            discovered_size = Some(total);
        }
    }

    let mut stream = response.bytes_stream();
    let mut last_checkpoint = tokio::time::Instant::now();

    while let Some(chunk) = stream.next().await {
        if ctx.cancelled.load(Ordering::Acquire) || ctx.paused.load(Ordering::Acquire) {
            (ctx.on_checkpoint)(segment.index, segment.downloaded, false);
            return Err(EngineError::Cancelled);
        }

        let chunk = chunk?;
        let len = chunk.len() as u64;
        ctx.rate_limiter.acquire(len).await;

        file.write_all(&chunk).await?;
        segment.downloaded += len;
        ctx.total_downloaded.fetch_add(len, Ordering::AcqRel);

        if last_checkpoint.elapsed() >= SEGMENT_PROGRESS_CHECKPOINT {
            (ctx.on_checkpoint)(segment.index, segment.downloaded, false);
            last_checkpoint = tokio::time::Instant::now();
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    segment.complete = true;
    (ctx.on_checkpoint)(segment.index, segment.downloaded, true);

    Ok(SegmentOutcome { discovered_size })
}

/// Concatenate every segment's temp file (in index order) into a
/// `.zdmr.part` file in the destination directory, then atomically
/// rename it into place — a crash mid-merge leaves a stray `.zdmr.part`
/// behind, never a half-written file under the final name. Deletes the
/// segment temp files once the merge succeeds.
pub async fn merge_segments(
    segments: &[Segment],
    download_id: Uuid,
    temp_dir: &Path,
    destination: &Path,
    final_filename: &str,
) -> Result<(), EngineError> {
    tokio::fs::create_dir_all(destination).await?;

    let merged_temp_path = destination.join(format!("{final_filename}.zdmr.part"));
    let final_path = destination.join(final_filename);

    {
        let mut output = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&merged_temp_path)
            .await?;

        let mut buffer = vec![0u8; 1024 * 1024];
        let mut ordered = segments.to_vec();
        ordered.sort_by_key(|s| s.index);

        for segment in &ordered {
            let temp_path = segment_temp_path(temp_dir, download_id, segment.index);
            let mut input = tokio::fs::File::open(&temp_path).await?;
            loop {
                let n = input.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                output.write_all(&buffer[..n]).await?;
            }
        }
        output.flush().await?;
        output.sync_all().await?;
    }

    tokio::fs::rename(&merged_temp_path, &final_path).await?;

    for segment in segments {
        let temp_path = segment_temp_path(temp_dir, download_id, segment.index);
        let _ = tokio::fs::remove_file(&temp_path).await;
    }

    Ok(())
}

fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn accepts_ranges(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "bytes")
        .unwrap_or(false)
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(reqwest::header::CONTENT_RANGE)?;
    let value = value.to_str().ok()?;
    let total = value.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_file_gets_a_single_segment() {
        let segments = plan_segments(Some(1024), true);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, 1023);
    }

    #[test]
    fn range_unsupported_forces_single_segment() {
        let segments = plan_segments(Some(50 * 1024 * 1024), false);
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn large_file_splits_into_at_most_eight_segments() {
        let segments = plan_segments(Some(100 * 1024 * 1024), true);
        assert_eq!(segments.len(), 8);
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments.last().unwrap().end, 100 * 1024 * 1024 - 1);
    }

    #[test]
    fn unknown_size_gets_single_open_ended_segment() {
        let segments = plan_segments(None, true);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].end, u64::MAX);
    }

    #[test]
    fn resume_validator_rejects_changed_etag() {
        let probe = ProbeResult {
            etag: Some("v2".into()),
            ..Default::default()
        };
        let result = validate_resume(Some("v1"), None, &probe);
        assert!(matches!(result, Err(EngineError::RemoteChanged)));
    }

    #[test]
    fn resume_validator_allows_matching_etag() {
        let probe = ProbeResult {
            etag: Some("v1".into()),
            ..Default::default()
        };
        assert!(validate_resume(Some("v1"), None, &probe).is_ok());
    }

    #[test]
    fn resume_validator_allows_missing_prior_validators() {
        let probe = ProbeResult {
            etag: Some("v1".into()),
            ..Default::default()
        };
        assert!(validate_resume(None, None, &probe).is_ok());
    }
}
