//! P1: pausing mid-flight and resuming must reproduce the exact original
//! bytes, picking up from where the paused attempt left off rather than
//! starting over.

mod common;

use std::time::Duration;
use zdmr_types::{DownloadStatus, Settings};

#[tokio::test]
async fn pause_then_resume_reproduces_the_original_file() {
    // 3 MiB, comfortably over the multi-segment split threshold, so this
    // exercises several segment workers resuming independently.
    let body: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let base_url = common::range_server::start(body.clone());

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("downloads");
    tokio::fs::create_dir_all(&dest).await.unwrap();

    let mut settings = Settings::default();
    settings.default_download_path = dest.clone();
    // Throttle hard enough that the test has time to pause before
    // completion, without the test itself taking forever.
    settings.global_speed_limit = Some(512 * 1024);

    let (store, engine) = common::test_engine(tmp.path(), settings).await;

    let url = format!("{base_url}file.bin");
    let download = engine.enqueue(url, None, None).await.unwrap();

    // Wait until some bytes have landed, then pause mid-flight.
    tokio::time::sleep(Duration::from_millis(400)).await;
    engine.pause(download.id).await.unwrap();

    let paused = common::wait_for_status(
        &store,
        download.id,
        &[DownloadStatus::Paused],
        Duration::from_secs(5),
    )
    .await;
    assert!(paused.downloaded > 0, "expected some progress before pause");
    assert!(paused.downloaded < body.len() as u64, "paused too late to exercise resume");

    engine.resume(download.id).await.unwrap();
    let completed = common::wait_for_status(
        &store,
        download.id,
        &[DownloadStatus::Completed, DownloadStatus::Error],
        Duration::from_secs(30),
    )
    .await;
    assert_eq!(completed.status, DownloadStatus::Completed, "{:?}", completed.error_message);

    let final_path = dest.join(&completed.filename);
    let on_disk = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(on_disk, body, "resumed download did not reproduce the original bytes");
}
