//! P5: a download whose original host can't be reached falls back to a
//! configured mirror host and completes from there; separately, routing
//! a failing host through a proxy persists a usable rule.

mod common;

use std::time::Duration;
use zdmr_types::{DownloadStatus, Rule, RuleKind, Settings};

#[tokio::test]
async fn unreachable_host_falls_back_to_configured_mirror() {
    let body = b"mirror fallback payload".repeat(1024);
    let base_url = common::range_server::start(body.clone());
    // `base_url` is "http://127.0.0.1:<port>/" — pull the port back out so
    // the unreachable original URL can target the same port. `set_host`
    // (used by the mirror resolver) only ever rewrites the host, so the
    // rewritten URL keeps whatever port the original one had.
    let port = url::Url::parse(&base_url).unwrap().port().unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("downloads");
    tokio::fs::create_dir_all(&dest).await.unwrap();

    let mut settings = Settings::default();
    settings.default_download_path = dest.clone();

    let (store, engine) = common::test_engine(tmp.path(), settings).await;

    store
        .upsert_rule(&Rule {
            id: 0,
            host_pattern: "host.invalid".to_string(),
            enabled: true,
            kind: RuleKind::Mirror {
                mirror_hosts: vec!["127.0.0.1".to_string()],
            },
        })
        .await
        .unwrap();

    // `.invalid` never resolves (RFC 2606): the probe's HEAD fails at DNS
    // resolution, which the engine classifies as a mirror-eligible error.
    let url = format!("http://host.invalid:{port}/file.bin");
    let download = engine.enqueue(url, None, None).await.unwrap();

    let completed = common::wait_for_status(
        &store,
        download.id,
        &[DownloadStatus::Completed, DownloadStatus::Error],
        Duration::from_secs(15),
    )
    .await;

    assert_eq!(completed.status, DownloadStatus::Completed, "{:?}", completed.error_message);
    assert_eq!(completed.mirror_used.as_deref(), Some("127.0.0.1"));

    let final_path = dest.join(&completed.filename);
    let on_disk = tokio::fs::read(&final_path).await.unwrap();
    assert_eq!(on_disk, body);
}

#[tokio::test]
async fn add_host_to_proxy_and_retry_creates_an_enabled_proxy_rule() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("downloads");
    tokio::fs::create_dir_all(&dest).await.unwrap();

    let mut settings = Settings::default();
    settings.default_download_path = dest;
    // No retry budget: the first DNS failure should land straight in
    // `Error` instead of working through several backoff delays first.
    settings.max_retries = 0;
    let (store, engine) = common::test_engine(tmp.path(), settings).await;

    // A download that will never resolve, so it lands in `Error` and
    // stays there for us to retry through a proxy rule.
    let download = engine
        .enqueue("http://definitely-not-a-real-host.invalid/file.bin".to_string(), None, None)
        .await
        .unwrap();

    common::wait_for_status(
        &store,
        download.id,
        &[DownloadStatus::Error],
        Duration::from_secs(15),
    )
    .await;

    engine
        .add_host_to_proxy_and_retry(download.id, "http://proxy.local:8080".to_string())
        .await
        .unwrap();

    let rules = store.list_rules().await.unwrap();
    let proxy_rule = rules
        .iter()
        .find(|r| r.host_pattern.eq_ignore_ascii_case("definitely-not-a-real-host.invalid"))
        .expect("expected a proxy rule for the failing host");
    assert!(proxy_rule.enabled);
    match &proxy_rule.kind {
        RuleKind::Proxy { proxy_url, use_proxy } => {
            assert_eq!(proxy_url, "http://proxy.local:8080");
            assert!(use_proxy);
        }
        other => panic!("expected a Proxy rule, got {other:?}"),
    }
}
