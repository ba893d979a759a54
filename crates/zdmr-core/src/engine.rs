//! L7 scheduler: admission control, the retry/backoff/mirror policy, and
//! the stall watchdog. One global concurrency cap admits queued
//! downloads FIFO — there is no per-batch or clock-based scheduling.

use crate::error::EngineError;
use crate::fetcher::{self, SegmentFetchContext};
use crate::filename::{self, FilenameHints};
use crate::rate_limiter::RateLimiter;
use crate::rules::RulesSnapshot;
use crate::store::Store;
use crate::transport::{self, TransportPolicy};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;
use zdmr_types::{
    CoreEvent, Download, DownloadStatus, ErrorCode, RetryKind, Rule, RuleKind, Settings, SupportsRanges,
};

/// No-throughput window that counts as one stall strike.
const STALL_WINDOW: Duration = Duration::from_secs(15);
/// Consecutive stalls before a download is failed with `Timeout`.
const STALL_STRIKES_BEFORE_TIMEOUT: u32 = 6;
/// Exponential backoff schedule in seconds, capped at the last entry.
const BACKOFF_SCHEDULE_SECS: [u64; 6] = [1, 2, 4, 8, 16, 30];

fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt as usize).min(BACKOFF_SCHEDULE_SECS.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE_SECS[idx])
}

/// Cooperative control flags and byte counter shared between a running
/// download's segment tasks and the rest of the engine.
struct ActiveDownload {
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    total_downloaded: Arc<AtomicU64>,
}

pub struct Engine {
    store: Arc<Store>,
    rate_limiter: RateLimiter,
    settings: RwLock<Settings>,
    temp_dir: PathBuf,
    events: broadcast::Sender<CoreEvent>,
    active: RwLock<HashMap<Uuid, ActiveDownload>>,
    admission: Arc<Semaphore>,
}

impl Engine {
    pub fn new(store: Arc<Store>, settings: Settings, temp_dir: PathBuf) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let admission = Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1) as usize));
        let rate_limiter = RateLimiter::new(settings.global_speed_limit.unwrap_or(0));
        Arc::new(Self {
            store,
            rate_limiter,
            settings: RwLock::new(settings),
            temp_dir,
            events,
            active: RwLock::new(HashMap::new()),
            admission,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Emit an event onto the shared bus (used by the progress bus to
    /// publish its batched ticks alongside the engine's own status
    /// events).
    pub fn emit(&self, event: CoreEvent) {
        self.events.send(event).ok();
    }

    /// Live `(id, downloaded_bytes)` for every download currently
    /// running, read straight from each one's atomic counter rather than
    /// its last DB checkpoint.
    pub async fn progress_snapshot(&self) -> Vec<(Uuid, u64)> {
        self.active
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.total_downloaded.load(Ordering::Acquire)))
            .collect()
    }

    /// Total size (if known) for every currently active download, keyed
    /// by id — used by the progress bus to compute ETAs.
    pub async fn active_sizes(&self) -> HashMap<Uuid, Option<u64>> {
        let ids: Vec<Uuid> = self.active.read().await.keys().copied().collect();
        let mut sizes = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Ok(Some(download)) = self.store.load_download(id).await {
                sizes.insert(id, download.size);
            }
        }
        sizes
    }

    pub async fn update_speed_limit(&self, bytes_per_second: Option<u64>) {
        self.settings.write().await.global_speed_limit = bytes_per_second;
        self.rate_limiter.set_limit(bytes_per_second).await;
    }

    /// Downloads left in `Downloading` across a restart were mid-flight
    /// when the process died; requeue them and try to admit whatever the
    /// concurrency cap allows.
    pub async fn restore(self: &Arc<Self>) -> Result<(), EngineError> {
        for download in self.store.load_all_downloads().await? {
            if download.status == DownloadStatus::Downloading {
                self.store
                    .update_status(download.id, DownloadStatus::Queued, None, None)
                    .await?;
            }
        }
        self.try_admit_queued().await
    }

    /// Enqueue a single URL. One `Download` per call; the control API's
    /// `/downloads` and `/batches` endpoints loop over their URL lists
    /// against this.
    pub async fn enqueue(
        self: &Arc<Self>,
        url: String,
        destination: Option<PathBuf>,
        batch_id: Option<Uuid>,
    ) -> Result<Download, EngineError> {
        Url::parse(&url).map_err(|_| EngineError::InvalidUrl(url.clone()))?;

        let default_destination = self.settings.read().await.default_download_path.clone();
        let destination = destination.unwrap_or(default_destination);
        let download = Download::new(url, destination, batch_id);

        self.store.upsert_download(&download).await?;
        self.events.send(CoreEvent::DownloadsChanged).ok();
        self.try_admit_queued().await?;
        Ok(download)
    }

    pub async fn pause(&self, id: Uuid) -> Result<(), EngineError> {
        if let Some(handle) = self.active.read().await.get(&id) {
            handle.paused.store(true, Ordering::Release);
            return Ok(());
        }

        let Some(download) = self.store.load_download(id).await? else {
            return Err(EngineError::NotFound(id));
        };
        if download.status != DownloadStatus::Queued {
            return Err(EngineError::InvalidOperation("download is not queued or running".into()));
        }
        self.store.update_status(id, DownloadStatus::Paused, None, None).await
    }

    pub async fn resume(self: &Arc<Self>, id: Uuid) -> Result<(), EngineError> {
        if let Some(handle) = self.active.read().await.get(&id) {
            handle.paused.store(false, Ordering::Release);
            return Ok(());
        }
        let Some(mut download) = self.store.load_download(id).await? else {
            return Err(EngineError::NotFound(id));
        };
        if download.status != DownloadStatus::Paused && download.status != DownloadStatus::Error {
            return Err(EngineError::InvalidOperation("download is not paused or errored".into()));
        }
        download.status = DownloadStatus::Queued;
        self.store.update_status(id, DownloadStatus::Queued, None, None).await?;
        self.try_admit_queued().await
    }

    pub async fn retry(self: &Arc<Self>, id: Uuid) -> Result<(), EngineError> {
        self.resume(id).await
    }

    /// Mark (or create) an enabled proxy rule for the host a download is
    /// currently failing against, then retry it. The rule persists past
    /// this one retry — it's a standing policy change, not a one-shot
    /// override.
    pub async fn add_host_to_proxy_and_retry(
        self: &Arc<Self>,
        id: Uuid,
        proxy_url: String,
    ) -> Result<(), EngineError> {
        let Some(download) = self.store.load_download(id).await? else {
            return Err(EngineError::NotFound(id));
        };

        let target = download.final_url.as_deref().unwrap_or(download.url.as_str());
        let host = Url::parse(target)
            .ok()
            .and_then(|u| u.host_str().map(String::from))
            .ok_or_else(|| EngineError::InvalidUrl(target.to_string()))?;

        let mut rule = self
            .store
            .list_rules()
            .await?
            .into_iter()
            .find(|r| matches!(r.kind, RuleKind::Proxy { .. }) && r.host_pattern.eq_ignore_ascii_case(&host));

        match &mut rule {
            Some(rule) => {
                rule.enabled = true;
                if let RuleKind::Proxy { proxy_url: existing_url, use_proxy } = &mut rule.kind {
                    *existing_url = proxy_url.clone();
                    *use_proxy = true;
                }
            }
            None => {
                rule = Some(Rule {
                    id: 0,
                    host_pattern: host,
                    enabled: true,
                    kind: RuleKind::Proxy { proxy_url, use_proxy: true },
                });
            }
        }
        self.store.upsert_rule(&rule.expect("just set above")).await?;

        self.retry(id).await
    }

    pub async fn create_batch(
        self: &Arc<Self>,
        name: String,
        destination: PathBuf,
        urls: Vec<String>,
        force_proxy: bool,
    ) -> Result<(zdmr_types::Batch, Vec<Download>), EngineError> {
        let mut batch = zdmr_types::Batch::new(name, destination.clone());
        batch.force_proxy = force_proxy;
        self.store.upsert_batch(&batch).await?;

        let mut downloads = Vec::with_capacity(urls.len());
        for url in urls {
            downloads.push(self.enqueue(url, Some(destination.clone()), Some(batch.id)).await?);
        }
        Ok((batch, downloads))
    }

    pub async fn get_download(&self, id: Uuid) -> Result<Option<Download>, EngineError> {
        self.store.load_download(id).await
    }

    pub async fn list_downloads(&self) -> Result<Vec<Download>, EngineError> {
        self.store.load_all_downloads().await
    }

    pub async fn cancel_and_delete(&self, id: Uuid) -> Result<(), EngineError> {
        if let Some(handle) = self.active.read().await.get(&id) {
            handle.cancelled.store(true, Ordering::Release);
        }
        self.store.delete_download(id).await?;
        self.events.send(CoreEvent::DownloadsChanged).ok();
        Ok(())
    }

    async fn try_admit_queued(self: &Arc<Self>) -> Result<(), EngineError> {
        loop {
            let Ok(permit) = Arc::clone(&self.admission).try_acquire_owned() else {
                return Ok(());
            };

            let mut queued: Vec<Download> = self
                .store
                .load_all_downloads()
                .await?
                .into_iter()
                .filter(|d| d.status == DownloadStatus::Queued)
                .collect();
            queued.sort_by_key(|d| d.created_at);

            let Some(next) = queued.into_iter().next() else {
                drop(permit);
                return Ok(());
            };

            self.spawn_download(next, permit).await;
        }
    }

    async fn spawn_download(self: &Arc<Self>, download: Download, permit: OwnedSemaphorePermit) {
        let engine = Arc::clone(self);
        let handle = ActiveDownload {
            paused: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
            total_downloaded: Arc::new(AtomicU64::new(download.downloaded)),
        };
        let paused = Arc::clone(&handle.paused);
        let cancelled = Arc::clone(&handle.cancelled);
        let total_downloaded = Arc::clone(&handle.total_downloaded);
        let id = download.id;

        self.active.write().await.insert(id, handle);

        tokio::spawn(async move {
            let _permit = permit;
            run_download(&engine, download, paused, cancelled, total_downloaded).await;
            engine.active.write().await.remove(&id);
            engine.events.send(CoreEvent::DownloadsChanged).ok();
            let _ = engine.try_admit_queued().await;
        });
    }
}

/// Drive one download from `Queued` through however many attempts its
/// retry policy allows, to a terminal `Completed` or `Error` status.
async fn run_download(
    engine: &Arc<Engine>,
    mut download: Download,
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    total_downloaded: Arc<AtomicU64>,
) {
    let max_retries = engine.settings.read().await.max_retries;
    let mut attempt: u32 = 0;
    let mut current_url = download.url.clone();
    let mut unknown_code_retried = false;
    // Cumulative across every attempt of this download, never reset by an
    // attempt that makes progress — six total stalls is a hard ceiling.
    let stall_strikes = Arc::new(AtomicU32::new(0));

    loop {
        match try_once(
            engine,
            &mut download,
            &current_url,
            &paused,
            &cancelled,
            &total_downloaded,
            &stall_strikes,
        )
        .await
        {
            Ok(()) => {
                download.status = DownloadStatus::Completed;
                download.completed_at = Some(chrono::Utc::now());
                let _ = engine
                    .store
                    .update_status(download.id, DownloadStatus::Completed, None, None)
                    .await;
                emit_status(engine, &download);
                return;
            }
            Err(EngineError::Cancelled) => {
                let final_status = if paused.load(Ordering::Acquire) {
                    DownloadStatus::Paused
                } else {
                    return; // deleted out from under us
                };
                let _ = engine.store.update_status(download.id, final_status, None, None).await;
                download.status = final_status;
                emit_status(engine, &download);
                return;
            }
            Err(err) => {
                let code = err.code();
                warn!(download_id = %download.id, %code, attempt, "fetch attempt failed");

                // UNKNOWN gets exactly one automatic retry regardless of
                // max_retries, rather than the full retry budget.
                let unknown_exhausted = code == ErrorCode::Unknown && unknown_code_retried;
                if code == ErrorCode::Unknown {
                    unknown_code_retried = true;
                }

                // A download stalled (no throughput for a full watchdog
                // window) surfaces here as `Timeout`; only a sixth
                // cumulative stall escalates it to a terminal failure.
                let stalled = code == ErrorCode::Timeout;
                let stall_exhausted = stalled && stall_strikes.load(Ordering::Acquire) >= STALL_STRIKES_BEFORE_TIMEOUT;

                if !code.is_auto_retryable() || unknown_exhausted || stall_exhausted || attempt >= max_retries {
                    let _ = engine
                        .store
                        .update_status(download.id, DownloadStatus::Error, Some(code), Some(err.to_string()))
                        .await;
                    download.status = DownloadStatus::Error;
                    download.error_code = Some(code);
                    download.error_message = Some(err.to_string());
                    emit_status(engine, &download);
                    return;
                }

                if code.retry_kind() == RetryKind::MirrorThenBackoff {
                    if let Some(mirror_url) = resolve_mirror(engine, &download.url).await {
                        info!(download_id = %download.id, mirror = %mirror_url, "falling back to mirror");
                        current_url = mirror_url;
                        download.mirror_used =
                            Url::parse(&current_url).ok().and_then(|u| u.host_str().map(String::from));
                        attempt += 1;
                        continue;
                    }
                }

                attempt += 1;
                let delay = backoff_delay(attempt);
                if stalled {
                    engine
                        .events
                        .send(CoreEvent::DownloadStatusChanged {
                            id: download.id,
                            status: DownloadStatus::Downloading,
                            error_code: None,
                            error_message: Some(format!("stalled, retrying in {}s", delay.as_secs())),
                        })
                        .ok();
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn emit_status(engine: &Arc<Engine>, download: &Download) {
    engine
        .events
        .send(CoreEvent::DownloadStatusChanged {
            id: download.id,
            status: download.status,
            error_code: download.error_code,
            error_message: download.error_message.clone(),
        })
        .ok();
}

async fn resolve_mirror(engine: &Arc<Engine>, original_url: &str) -> Option<String> {
    let parsed = Url::parse(original_url).ok()?;
    let host = parsed.host_str()?;
    let rules = engine.store.list_enabled_rules().await.ok()?;
    let settings = engine.settings.read().await.clone();
    let snapshot = RulesSnapshot::new(rules, settings);
    let mirrors = snapshot.resolve_mirrors(host);
    let mirror_host = mirrors.first()?;

    let mut mirrored = parsed.clone();
    mirrored.set_host(Some(mirror_host.as_str())).ok()?;
    Some(mirrored.to_string())
}

/// Boxes `try_once_inner` so it can recurse on itself (async fns can't
/// call themselves directly without a pinned, heap-allocated future).
fn try_once<'a>(
    engine: &'a Arc<Engine>,
    download: &'a mut Download,
    current_url: &'a str,
    paused: &'a Arc<AtomicBool>,
    cancelled: &'a Arc<AtomicBool>,
    total_downloaded: &'a Arc<AtomicU64>,
    stall_strikes: &'a Arc<AtomicU32>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), EngineError>> + Send + 'a>> {
    Box::pin(try_once_inner(
        engine,
        download,
        current_url,
        paused,
        cancelled,
        total_downloaded,
        stall_strikes,
    ))
}

/// One probe-through-merge attempt against `current_url`. Leaves
/// `download` updated in place (filename, size, segments) as it learns
/// things, regardless of whether the attempt ultimately succeeds. May
/// recurse once into itself if the server ignores our `Range` header
/// mid-flight, collapsing to a single-stream restart from byte 0.
async fn try_once_inner(
    engine: &Arc<Engine>,
    download: &mut Download,
    current_url: &str,
    paused: &Arc<AtomicBool>,
    cancelled: &Arc<AtomicBool>,
    total_downloaded: &Arc<AtomicU64>,
    stall_strikes: &Arc<AtomicU32>,
) -> Result<(), EngineError> {
    engine
        .store
        .update_status(download.id, DownloadStatus::Downloading, None, None)
        .await?;
    download.status = DownloadStatus::Downloading;
    emit_status(engine, download);

    let parsed_url = Url::parse(current_url).map_err(|_| EngineError::InvalidUrl(current_url.to_string()))?;
    let host = parsed_url.host_str().unwrap_or_default().to_string();

    let rules = engine.store.list_enabled_rules().await?;
    let settings = engine.settings.read().await.clone();
    let snapshot = RulesSnapshot::new(rules, settings);
    let policy = TransportPolicy::resolve(&snapshot, &host);
    let client = transport::build_client(&policy)?;

    let probe = fetcher::probe(&client, current_url).await?;
    let is_resume = download.downloaded > 0 && !download.segments.is_empty();
    if is_resume {
        fetcher::validate_resume(download.etag.as_deref(), download.last_modified.as_deref(), &probe)?;
    }

    download.final_url = Some(probe.final_url.clone());
    download.etag = probe.etag.clone();
    download.last_modified = probe.last_modified.clone();
    download.supports_ranges = if probe.supports_ranges { SupportsRanges::Yes } else { SupportsRanges::No };
    if download.size.is_none() {
        download.size = probe.size;
    }

    if download.filename.is_empty() {
        let hints = FilenameHints {
            content_disposition: probe.content_disposition.as_deref(),
            content_type: probe.content_type.as_deref(),
        };
        download.filename = filename::resolve(current_url, &download.destination, &hints);
    }

    if download.segments.is_empty() {
        download.segments = fetcher::plan_segments(probe.size, probe.supports_ranges);
        engine.store.replace_segments(download.id, &download.segments).await?;
    }
    engine.store.upsert_download(download).await?;

    let (checkpoint_tx, mut checkpoint_rx) = mpsc::unbounded_channel::<(u32, u64, bool)>();
    let download_id = download.id;
    let store = Arc::clone(&engine.store);
    let checkpoint_task = tokio::spawn(async move {
        while let Some((index, downloaded, complete)) = checkpoint_rx.recv().await {
            let _ = store.checkpoint_segment_progress(download_id, index, downloaded, complete).await;
        }
    });

    let watchdog_cancelled = Arc::new(AtomicBool::new(false));
    let watchdog = spawn_stall_watchdog(
        Arc::clone(total_downloaded),
        Arc::clone(cancelled),
        Arc::clone(&watchdog_cancelled),
        Arc::clone(stall_strikes),
    );

    let total_segments = download.segments.len();
    let mut join_set = JoinSet::new();
    for mut segment in download.segments.clone() {
        let client = client.clone();
        let url = current_url.to_string();
        let temp_dir = engine.temp_dir.clone();
        let rate_limiter = engine.rate_limiter.clone();
        let paused = Arc::clone(paused);
        let cancelled = Arc::clone(cancelled);
        let total_downloaded = Arc::clone(total_downloaded);
        let checkpoint_tx = checkpoint_tx.clone();

        join_set.spawn(async move {
            let checkpoint_fn = move |index: u32, downloaded: u64, complete: bool| {
                let _ = checkpoint_tx.send((index, downloaded, complete));
            };
            let ctx = SegmentFetchContext {
                client: &client,
                url: &url,
                download_id,
                temp_dir: &temp_dir,
                rate_limiter: &rate_limiter,
                paused: &paused,
                cancelled: &cancelled,
                total_downloaded: &total_downloaded,
                total_segments,
                on_checkpoint: &checkpoint_fn,
            };
            let result = fetcher::fetch_segment(&ctx, &mut segment).await;
            (segment, result)
        });
    }
    drop(checkpoint_tx);

    let mut first_error: Option<EngineError> = None;
    let mut completed_segments = Vec::with_capacity(download.segments.len());
    while let Some(joined) = join_set.join_next().await {
        let (segment, result) = joined.map_err(|e| EngineError::Unknown(e.to_string()))?;
        match result {
            Ok(outcome) => {
                if let Some(total) = outcome.discovered_size {
                    download.size = Some(total);
                }
                completed_segments.push(segment);
            }
            Err(err) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
    }

    watchdog.abort();
    checkpoint_task.abort();

    if matches!(first_error, Some(EngineError::RangeUnsupported)) {
        warn!(
            download_id = %download.id,
            "server ignored the range request mid-flight, collapsing to single-stream and restarting from 0"
        );
        for segment in &download.segments {
            let stale = fetcher::segment_temp_path(&engine.temp_dir, download.id, segment.index);
            let _ = tokio::fs::remove_file(&stale).await;
        }
        total_downloaded.store(0, Ordering::Release);
        download.downloaded = 0;
        download.supports_ranges = SupportsRanges::No;
        download.segments = fetcher::plan_segments(download.size, false);
        engine.store.replace_segments(download.id, &download.segments).await?;
        engine.store.upsert_download(download).await?;
        return try_once(engine, download, current_url, paused, cancelled, total_downloaded, stall_strikes).await;
    }

    if watchdog_cancelled.load(Ordering::Acquire) {
        first_error = Some(EngineError::Timeout);
    }

    completed_segments.sort_by_key(|s| s.index);
    download.segments = completed_segments;
    download.downloaded = total_downloaded.load(Ordering::Acquire);
    engine.store.upsert_download(download).await?;

    if let Some(err) = first_error {
        return Err(err);
    }

    fetcher::merge_segments(
        &download.segments,
        download.id,
        &engine.temp_dir,
        &download.destination,
        &download.filename,
    )
    .await?;

    Ok(())
}

/// Watches `total_downloaded` for a single window with no throughput and
/// cancels the current attempt as soon as it sees one, bumping the
/// cumulative `stall_strikes` counter shared across every attempt of this
/// download. `run_download` is what decides whether that cumulative count
/// has crossed `STALL_STRIKES_BEFORE_TIMEOUT` and the download should stop
/// retrying. The caller tears this task down once its own fetch loop
/// finishes (success or otherwise).
fn spawn_stall_watchdog(
    total_downloaded: Arc<AtomicU64>,
    cancel_flag: Arc<AtomicBool>,
    stalled_flag: Arc<AtomicBool>,
    stall_strikes: Arc<AtomicU32>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = total_downloaded.load(Ordering::Acquire);
        loop {
            tokio::time::sleep(STALL_WINDOW).await;
            let current = total_downloaded.load(Ordering::Acquire);
            if current == last {
                let strikes = stall_strikes.fetch_add(1, Ordering::AcqRel) + 1;
                error!(
                    "no throughput for {:?}, cancelling this attempt (stall {} of {} cumulative)",
                    STALL_WINDOW, strikes, STALL_STRIKES_BEFORE_TIMEOUT
                );
                stalled_flag.store(true, Ordering::Release);
                cancel_flag.store(true, Ordering::Release);
                return;
            }
            last = current;
        }
    })
}
