//! Shared fixtures for the integration suite.

pub mod range_server;

use std::time::Duration;
use uuid::Uuid;
use zdmr_core::{Engine, Store};
use zdmr_types::{Download, DownloadStatus, Settings};

/// Build a fresh `Engine` over a throwaway sqlite file and temp
/// directory, both under `tmp` (a `tempfile::TempDir` the caller keeps
/// alive for the test's duration — dropping it too early deletes the
/// engine's temp/segment files out from under a running download).
pub async fn test_engine(tmp: &std::path::Path, settings: Settings) -> (std::sync::Arc<Store>, std::sync::Arc<Engine>) {
    let db_path = tmp.join("zdmr.sqlite");
    let temp_dir = tmp.join("tmp");
    tokio::fs::create_dir_all(&temp_dir).await.unwrap();

    let store = std::sync::Arc::new(Store::open(&db_path).await.unwrap());
    store.save_settings(&settings).await.unwrap();
    let engine = Engine::new(std::sync::Arc::clone(&store), settings, temp_dir);
    (store, engine)
}

/// Poll `store` until `id` reaches one of `statuses`, or panic after
/// `timeout`. Every download eventually lands in a terminal state (or
/// `Paused`), so a bounded poll is the simplest way to synchronize with
/// the engine's background task without reaching into its internals.
pub async fn wait_for_status(store: &Store, id: Uuid, statuses: &[DownloadStatus], timeout: Duration) -> Download {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(download) = store.load_download(id).await.unwrap() {
            if statuses.contains(&download.status) {
                return download;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for download {id} to reach {statuses:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
