//! Z-DMR Core - concurrent, resumable, range-aware download engine.
//!
//! This crate has no notion of a single "app instance" struct — it
//! exposes the pieces (`Store`, `Engine`, the progress bus, the control
//! API) and leaves composing them to whatever binary hosts it (the CLI's
//! `serve` subcommand today).

pub mod api;
mod engine;
mod error;
mod fetcher;
mod filename;
pub mod progress;
mod rate_limiter;
mod rules;
mod store;
mod transport;

pub use engine::Engine;
pub use error::EngineError;
pub use fetcher::ProbeResult;
pub use rate_limiter::RateLimiter;
pub use rules::RulesSnapshot;
pub use store::Store;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use zdmr_types::Settings;

/// Everything a host binary needs to run the engine: the store, the
/// engine itself (already restored from a prior run), the directory
/// segment temp files live under, and the progress bus's task handle
/// (abort it on shutdown; dropping `Runtime` does not stop it on its
/// own since `Engine` is independently `Arc`-held by the API server).
pub struct Runtime {
    pub store: Arc<Store>,
    pub engine: Arc<Engine>,
    pub temp_dir: PathBuf,
    pub progress_handle: tokio::task::JoinHandle<()>,
}

/// Open the database at `db_path`, load settings, build the `Engine`,
/// requeue anything left `Downloading` from a prior run, admit as many
/// queued downloads as the concurrency cap allows, and start the
/// progress bus.
pub async fn bootstrap(db_path: impl AsRef<Path>, temp_dir: PathBuf) -> Result<Runtime, EngineError> {
    tokio::fs::create_dir_all(&temp_dir).await?;

    let store = Arc::new(Store::open(db_path).await?);
    let settings = store.load_settings().await?;
    let engine = Engine::new(Arc::clone(&store), settings, temp_dir.clone());
    engine.restore().await?;
    let progress_handle = progress::spawn(Arc::clone(&engine));

    Ok(Runtime {
        store,
        engine,
        temp_dir,
        progress_handle,
    })
}

/// Default settings, used when no prior settings row exists.
pub fn default_settings() -> Settings {
    Settings::default()
}

/// Probe a URL without creating a download — used by the CLI's `probe`
/// command and, in principle, any future "check before you add" UI
/// affordance. Builds a plain no-proxy client since no download (and
/// thus no per-host rule resolution) exists yet for this URL.
pub async fn probe_link(url: &str) -> Result<zdmr_types::LinkInfo, EngineError> {
    let policy = transport::TransportPolicy::default();
    let client = transport::build_client(&policy)?;
    let probe = fetcher::probe(&client, url).await?;

    let hints = filename::FilenameHints {
        content_disposition: probe.content_disposition.as_deref(),
        content_type: probe.content_type.as_deref(),
    };
    let filename = filename::resolve(url, Path::new("."), &hints);

    Ok(zdmr_types::LinkInfo {
        url: url.to_string(),
        final_url: Some(probe.final_url),
        filename,
        size: probe.size,
        content_type: probe.content_type,
        supports_ranges: if probe.supports_ranges {
            zdmr_types::SupportsRanges::Yes
        } else {
            zdmr_types::SupportsRanges::No
        },
    })
}

/// Initialize `tracing` with an env-configurable filter (`debug` in
/// debug builds, `info` in release, overridable via `RUST_LOG`) plus a
/// daily-rotating JSON-lines file under `log_dir`. Returns the guard
/// that must be held for the life of the process to keep the
/// non-blocking file writer flushing.
pub fn init_logging(log_dir: impl AsRef<Path>) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            tracing_subscriber::EnvFilter::new("debug")
        } else {
            tracing_subscriber::EnvFilter::new("info")
        }
    });

    let file_appender = tracing_appender::rolling::daily(log_dir, "zdmr.jsonl");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
        .init();

    guard
}
