//! P2: a configured global speed limit must actually cap throughput,
//! not just exist as an unread setting.

mod common;

use std::time::{Duration, Instant};
use zdmr_types::{DownloadStatus, Settings};

#[tokio::test]
async fn global_speed_limit_caps_measured_throughput() {
    let size = 2 * 1024 * 1024; // under the segment-split threshold, single stream
    let body: Vec<u8> = vec![0xAB; size];
    let base_url = common::range_server::start(body.clone());

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("downloads");
    tokio::fs::create_dir_all(&dest).await.unwrap();

    let limit_bytes_per_sec: u64 = 256 * 1024;
    let mut settings = Settings::default();
    settings.default_download_path = dest.clone();
    settings.global_speed_limit = Some(limit_bytes_per_sec);

    let (store, engine) = common::test_engine(tmp.path(), settings).await;

    let url = format!("{base_url}file.bin");
    let started = Instant::now();
    let download = engine.enqueue(url, None, None).await.unwrap();

    let completed = common::wait_for_status(
        &store,
        download.id,
        &[DownloadStatus::Completed, DownloadStatus::Error],
        Duration::from_secs(30),
    )
    .await;
    let elapsed = started.elapsed();
    assert_eq!(completed.status, DownloadStatus::Completed, "{:?}", completed.error_message);

    // Over a local loopback link an unthrottled transfer of this size
    // finishes in well under a second. The configured ceiling puts a
    // floor under how fast it's allowed to go; allow generous slack for
    // scheduling jitter without letting an unthrottled transfer pass.
    let expected_floor = Duration::from_secs_f64(size as f64 / limit_bytes_per_sec as f64 * 0.5);
    assert!(
        elapsed >= expected_floor,
        "download finished in {elapsed:?}, faster than the rate limit should allow (floor {expected_floor:?})"
    );
}
