//! L8 progress bus.
//!
//! A single periodic task ticks every 250ms, reads every active
//! download's raw atomic byte counter, smooths it into a speed and ETA,
//! and emits one batched `ProgressBatch` event — replacing the teacher's
//! per-download reporter task with one shared one.

use crate::engine::Engine;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;
use zdmr_types::{CoreEvent, DownloadProgress};

const TICK: Duration = Duration::from_millis(250);
const EWMA_ALPHA: f64 = 0.3;
const SPEED_WINDOW: Duration = Duration::from_secs(1);

struct Tracker {
    last_downloaded: u64,
    window_start: Instant,
    speed: f64,
}

/// Spawn the progress bus. Runs for the life of the process; the caller
/// holds the returned handle only to abort it on shutdown.
pub fn spawn(engine: Arc<Engine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut trackers: HashMap<Uuid, Tracker> = HashMap::new();
        let mut interval = tokio::time::interval(TICK);

        loop {
            interval.tick().await;
            let active = engine.progress_snapshot().await;

            let active_ids: HashSet<Uuid> = active.iter().map(|(id, _)| *id).collect();
            trackers.retain(|id, _| active_ids.contains(id));

            if active.is_empty() {
                continue;
            }

            let sizes = engine.active_sizes().await;
            let now = Instant::now();
            let mut items = Vec::with_capacity(active.len());

            for (id, downloaded) in active {
                let tracker = trackers.entry(id).or_insert_with(|| Tracker {
                    last_downloaded: downloaded,
                    window_start: now,
                    speed: 0.0,
                });

                if now.duration_since(tracker.window_start) >= SPEED_WINDOW {
                    let elapsed = now.duration_since(tracker.window_start).as_secs_f64();
                    let delta = downloaded.saturating_sub(tracker.last_downloaded) as f64;
                    let instantaneous = delta / elapsed;
                    tracker.speed = EWMA_ALPHA * instantaneous + (1.0 - EWMA_ALPHA) * tracker.speed;
                    tracker.last_downloaded = downloaded;
                    tracker.window_start = now;
                }

                let total = sizes.get(&id).copied().flatten();
                let eta_seconds = match total {
                    Some(total) if tracker.speed > 1.0 && total > downloaded => {
                        Some(((total - downloaded) as f64 / tracker.speed) as u64)
                    }
                    _ => None,
                };

                items.push(DownloadProgress {
                    id,
                    downloaded,
                    total,
                    speed: tracker.speed,
                    eta_seconds,
                });
            }

            engine.emit(CoreEvent::ProgressBatch { items });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_smooths_towards_new_reading() {
        let mut speed = 100.0_f64;
        let instantaneous = 300.0_f64;
        speed = EWMA_ALPHA * instantaneous + (1.0 - EWMA_ALPHA) * speed;
        assert!((speed - 160.0).abs() < 1e-9);
    }
}
