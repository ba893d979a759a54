//! Live progress bars for the `watch` command.

use crate::output::{format_eta, format_speed};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use uuid::Uuid;
use zdmr_types::{CoreEvent, DownloadStatus};

/// Tracks one progress bar per download currently known to the watcher.
pub struct DownloadBars {
    multi: MultiProgress,
    bars: HashMap<Uuid, ProgressBar>,
}

impl DownloadBars {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    fn bar_for(&mut self, id: Uuid) -> &ProgressBar {
        self.bars.entry(id).or_insert_with(|| {
            let pb = self.multi.add(ProgressBar::new(0));
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {msg}")
                    .unwrap()
                    .progress_chars("█▓▒░  "),
            );
            pb
        })
    }

    /// Apply one event to the bar set, updating or finishing the
    /// relevant download's bar.
    pub fn handle_event(&mut self, event: &CoreEvent) {
        match event {
            CoreEvent::ProgressBatch { items } => {
                for item in items {
                    let bar = self.bar_for(item.id);
                    if let Some(total) = item.total {
                        bar.set_length(total);
                    }
                    bar.set_position(item.downloaded);
                    let eta = item.eta_seconds.map(format_eta).unwrap_or_else(|| "-".to_string());
                    bar.set_message(format!("{} eta {}", format_speed(item.speed), eta));
                }
            }
            CoreEvent::DownloadStatusChanged { id, status, error_message, .. } => {
                if let Some(bar) = self.bars.get(id) {
                    match status {
                        DownloadStatus::Completed => {
                            bar.finish_with_message(format!("{} complete", style("done").green()))
                        }
                        DownloadStatus::Error => bar.abandon_with_message(format!(
                            "{} {}",
                            style("failed").red(),
                            error_message.as_deref().unwrap_or("unknown error")
                        )),
                        DownloadStatus::Paused => bar.set_message(format!("{}", style("paused").yellow())),
                        _ => {}
                    }
                }
            }
            CoreEvent::DownloadsChanged => {}
        }
    }
}

impl Default for DownloadBars {
    fn default() -> Self {
        Self::new()
    }
}
