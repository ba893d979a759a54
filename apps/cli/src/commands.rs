//! CLI command implementations. Everything here talks directly to the
//! embedded `zdmr_core::Runtime` — no HTTP round trip for local use; the
//! Control API (see `serve`) exists for other processes, not for us.

use crate::output;
use crate::progress::DownloadBars;
use crate::{ConfigAction, OutputFormat, RuleAction};
use anyhow::{anyhow, Result};
use console::style;
use std::path::PathBuf;
use tokio_stream::StreamExt;
use uuid::Uuid;
use zdmr_core::Runtime;
use zdmr_types::{Download, DownloadStatus, HeaderMode, Rule, RuleKind};

fn parse_id(id: &str) -> Result<Uuid> {
    Uuid::parse_str(id).map_err(|_| anyhow!("'{id}' is not a valid download ID"))
}

// ============================================================================
// Download commands
// ============================================================================

pub async fn add_downloads(
    runtime: &Runtime,
    urls: Vec<String>,
    output_dir: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    if urls.is_empty() {
        return Err(anyhow!("provide at least one URL"));
    }

    let mut added = Vec::with_capacity(urls.len());
    for url in urls {
        let download = runtime.engine.enqueue(url, output_dir.clone(), None).await?;
        added.push(download);
    }

    output::print(&added, format, || {
        for download in &added {
            println!("{} queued {}", style("✓").green().bold(), download.id);
        }
    })
}

pub async fn create_batch(
    runtime: &Runtime,
    name: Option<String>,
    destination: PathBuf,
    urls: Vec<String>,
    url_file: Option<PathBuf>,
    force_proxy: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut all_urls = urls;
    if let Some(path) = url_file {
        let content = tokio::fs::read_to_string(&path).await?;
        all_urls.extend(content.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
    }
    if all_urls.is_empty() {
        return Err(anyhow!("batch has no URLs (pass --url or --url-file)"));
    }

    let (batch, downloads) = runtime
        .engine
        .create_batch(name.unwrap_or_else(|| "batch".to_string()), destination, all_urls, force_proxy)
        .await?;

    output::print(&(&batch, &downloads), format, || {
        println!(
            "{} created batch {} with {} download(s)",
            style("✓").green().bold(),
            batch.id,
            downloads.len()
        );
    })
}

pub async fn list_downloads(runtime: &Runtime, format: OutputFormat) -> Result<()> {
    let downloads = runtime.engine.list_downloads().await?;

    output::print(&downloads, format, || {
        if downloads.is_empty() {
            println!("{}", style("no downloads").dim());
            return;
        }
        match format {
            OutputFormat::Table => print_table(&downloads),
            _ => {
                for download in &downloads {
                    print_summary(download, false);
                }
            }
        }
    })
}

fn print_table(downloads: &[Download]) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct Row {
        id: String,
        filename: String,
        size: String,
        progress: String,
        status: String,
    }

    let rows: Vec<Row> = downloads
        .iter()
        .map(|d| Row {
            id: d.id.to_string()[..8].to_string(),
            filename: if d.filename.len() > 30 {
                format!("{}...", &d.filename[..27])
            } else {
                d.filename.clone()
            },
            size: d.size.map(output::format_bytes).unwrap_or_else(|| "?".to_string()),
            progress: format!("{:.1}%", d.progress()),
            status: d.status.to_string(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

fn status_icon(status: DownloadStatus) -> console::StyledObject<&'static str> {
    match status {
        DownloadStatus::Completed => style("✓").green(),
        DownloadStatus::Downloading => style("↓").cyan(),
        DownloadStatus::Paused => style("⏸").yellow(),
        DownloadStatus::Error => style("✗").red(),
        DownloadStatus::Queued => style("·").dim(),
    }
}

fn print_summary(download: &Download, detailed: bool) {
    println!(
        "{} {} {} [{}]",
        status_icon(download.status),
        style(&download.filename).bold(),
        style(format!("{:.1}%", download.progress())).dim(),
        style(download.status.to_string()).dim()
    );

    if detailed {
        println!("    id: {}", download.id);
        println!("    url: {}", download.url);
        if let Some(size) = download.size {
            println!(
                "    size: {} / {}",
                output::format_bytes(download.downloaded),
                output::format_bytes(size)
            );
        }
        if let Some(ref mirror) = download.mirror_used {
            println!("    mirror: {mirror}");
        }
        if let Some(ref message) = download.error_message {
            println!("    error: {}", style(message).red());
        }
    }
}

pub async fn show_info(runtime: &Runtime, id: &str, format: OutputFormat) -> Result<()> {
    let uuid = parse_id(id)?;
    let download = runtime
        .engine
        .get_download(uuid)
        .await?
        .ok_or_else(|| anyhow!("no such download: {id}"))?;

    output::print(&download, format, || print_summary(&download, true))
}

pub async fn pause_download(runtime: &Runtime, id: &str) -> Result<()> {
    runtime.engine.pause(parse_id(id)?).await?;
    println!("{} paused", style("✓").green().bold());
    Ok(())
}

pub async fn resume_download(runtime: &Runtime, id: &str) -> Result<()> {
    runtime.engine.resume(parse_id(id)?).await?;
    println!("{} resumed", style("✓").green().bold());
    Ok(())
}

pub async fn retry_download(runtime: &Runtime, id: &str) -> Result<()> {
    runtime.engine.retry(parse_id(id)?).await?;
    println!("{} retrying", style("✓").green().bold());
    Ok(())
}

pub async fn delete_download(runtime: &Runtime, id: &str) -> Result<()> {
    runtime.engine.cancel_and_delete(parse_id(id)?).await?;
    println!("{} deleted", style("✓").green().bold());
    Ok(())
}

pub async fn add_host_to_proxy_and_retry(runtime: &Runtime, id: &str, proxy_url: String) -> Result<()> {
    runtime.engine.add_host_to_proxy_and_retry(parse_id(id)?, proxy_url).await?;
    println!("{} proxy rule added, retrying", style("✓").green().bold());
    Ok(())
}

pub async fn clear_completed(runtime: &Runtime) -> Result<()> {
    let removed = runtime.store.clear_completed().await?;
    println!("{} removed {} completed download(s)", style("✓").green().bold(), removed);
    Ok(())
}

/// Subscribe to the engine's event bus and render live bars until every
/// download the engine knows about has reached a terminal state.
pub async fn watch(runtime: &Runtime) -> Result<()> {
    let mut events = tokio_stream::wrappers::BroadcastStream::new(runtime.engine.subscribe());
    let mut bars = DownloadBars::new();

    loop {
        let downloads = runtime.engine.list_downloads().await?;
        let still_running = downloads
            .iter()
            .any(|d| matches!(d.status, DownloadStatus::Queued | DownloadStatus::Downloading));
        if !still_running {
            break;
        }

        match tokio::time::timeout(std::time::Duration::from_secs(2), events.next()).await {
            Ok(Some(Ok(event))) => bars.handle_event(&event),
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => continue, // timeout: re-check terminal state
        }
    }

    Ok(())
}

// ============================================================================
// Probe command
// ============================================================================

pub async fn probe_urls(urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let mut results = Vec::with_capacity(urls.len());
    for url in &urls {
        match zdmr_core::probe_link(url).await {
            Ok(info) => results.push(Ok(info)),
            Err(e) => results.push(Err((url.clone(), e.to_string()))),
        }
    }

    output::print(&results.iter().filter_map(|r| r.as_ref().ok()).collect::<Vec<_>>(), format, || {
        for result in &results {
            match result {
                Ok(info) => {
                    println!("{} {}", style("✓").green(), info.filename);
                    if let Some(size) = info.size {
                        println!("    size: {}", output::format_bytes(size));
                    }
                    println!("    ranges: {:?}", info.supports_ranges);
                }
                Err((url, message)) => println!("{} {}: {}", style("✗").red(), url, style(message).red()),
            }
        }
    })
}

// ============================================================================
// Rule commands
// ============================================================================

pub async fn rule_action(runtime: &Runtime, action: RuleAction, format: OutputFormat) -> Result<()> {
    match action {
        RuleAction::List => {
            let rules = runtime.store.list_rules().await?;
            output::print(&rules, format, || {
                if rules.is_empty() {
                    println!("{}", style("no rules").dim());
                }
                for rule in &rules {
                    print_rule(rule);
                }
            })?;
        }

        RuleAction::Proxy { host_pattern, proxy_url } => {
            let rule = Rule {
                id: 0,
                host_pattern,
                enabled: true,
                kind: RuleKind::Proxy { proxy_url, use_proxy: true },
            };
            let id = runtime.store.upsert_rule(&rule).await?;
            println!("{} added proxy rule #{id}", style("✓").green().bold());
        }

        RuleAction::Header { host_pattern, name, value, override_existing } => {
            let mode = if override_existing { HeaderMode::Override } else { HeaderMode::AddIfMissing };
            let rule = Rule {
                id: 0,
                host_pattern,
                enabled: true,
                kind: RuleKind::Header { name, value, mode },
            };
            let id = runtime.store.upsert_rule(&rule).await?;
            println!("{} added header rule #{id}", style("✓").green().bold());
        }

        RuleAction::Mirror { host_pattern, mirror_hosts } => {
            if mirror_hosts.is_empty() {
                return Err(anyhow!("provide at least one mirror host"));
            }
            let rule = Rule {
                id: 0,
                host_pattern,
                enabled: true,
                kind: RuleKind::Mirror { mirror_hosts },
            };
            let id = runtime.store.upsert_rule(&rule).await?;
            println!("{} added mirror rule #{id}", style("✓").green().bold());
        }

        RuleAction::Remove { id } => {
            runtime.store.delete_rule(id).await?;
            println!("{} removed rule #{id}", style("✓").green().bold());
        }
    }

    Ok(())
}

fn print_rule(rule: &Rule) {
    let kind = match &rule.kind {
        RuleKind::Proxy { proxy_url, use_proxy } => format!("proxy {proxy_url} (use_proxy={use_proxy})"),
        RuleKind::Header { name, value, mode } => format!("header {name}: {value} ({mode:?})"),
        RuleKind::Mirror { mirror_hosts } => format!("mirror -> {}", mirror_hosts.join(", ")),
    };
    println!("#{} {} {}", rule.id, rule.host_pattern, kind);
}

// ============================================================================
// Config commands
// ============================================================================

pub async fn config_action(runtime: &Runtime, action: Option<ConfigAction>, format: OutputFormat) -> Result<()> {
    match action.unwrap_or(ConfigAction::Show) {
        ConfigAction::Show => {
            let settings = runtime.store.load_settings().await?;
            output::print(&settings, format, || {
                println!("default download path: {}", settings.default_download_path.display());
                println!("max concurrent downloads: {}", settings.max_concurrent_downloads);
                println!(
                    "global speed limit: {}",
                    settings
                        .global_speed_limit
                        .map(output::format_bytes)
                        .map(|s| format!("{s}/s"))
                        .unwrap_or_else(|| "unlimited".to_string())
                );
                println!("max retries: {}", settings.max_retries);
                println!("control api port: {}", settings.control_api_port);
            })?;
        }

        ConfigAction::SpeedLimit { bytes_per_sec } => {
            let mut settings = runtime.store.load_settings().await?;
            settings.global_speed_limit = bytes_per_sec;
            runtime.store.save_settings(&settings).await?;
            runtime.engine.update_speed_limit(bytes_per_sec).await;
            println!("{} speed limit updated", style("✓").green().bold());
        }

        ConfigAction::MaxConcurrent { count } => {
            let mut settings = runtime.store.load_settings().await?;
            settings.max_concurrent_downloads = count;
            runtime.store.save_settings(&settings).await?;
            println!(
                "{} max concurrent downloads set to {count} (takes effect on next restart)",
                style("✓").green().bold()
            );
        }

        ConfigAction::DefaultPath { path } => {
            let mut settings = runtime.store.load_settings().await?;
            settings.default_download_path = path;
            runtime.store.save_settings(&settings).await?;
            println!("{} default download path updated", style("✓").green().bold());
        }
    }

    Ok(())
}

// ============================================================================
// Daemon
// ============================================================================

pub async fn serve(runtime: &Runtime, port: Option<u16>) -> Result<()> {
    let settings = runtime.store.load_settings().await?;
    let port = port.unwrap_or(settings.control_api_port);
    let token = runtime.store.get_or_create_api_token().await?;

    println!("{} control API on http://127.0.0.1:{port}", style("✓").green().bold());
    println!("  token: {token}");

    zdmr_core::api::serve(std::sync::Arc::clone(&runtime.engine), token, port)
        .await
        .map_err(Into::into)
}
