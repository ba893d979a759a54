//! Global bandwidth limiter.
//!
//! A single token bucket shared by every segment of every active
//! download — there is deliberately no per-host or per-download variant
//! of this type.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const MIN_CAPACITY_BYTES: u64 = 4096;

#[derive(Clone)]
pub struct RateLimiter {
    state: Arc<Mutex<State>>,
}

struct State {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: u64,
    unlimited: bool,
}

impl RateLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        if bytes_per_second == 0 {
            return Self::unlimited();
        }
        let capacity = bytes_per_second.max(MIN_CAPACITY_BYTES);
        Self {
            state: Arc::new(Mutex::new(State {
                capacity,
                tokens: capacity as f64,
                last_refill: Instant::now(),
                refill_rate: bytes_per_second,
                unlimited: false,
            })),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                capacity: u64::MAX,
                tokens: f64::MAX,
                last_refill: Instant::now(),
                refill_rate: u64::MAX,
                unlimited: true,
            })),
        }
    }

    pub async fn set_limit(&self, bytes_per_second: Option<u64>) {
        let mut state = self.state.lock().await;
        match bytes_per_second {
            None | Some(0) => {
                state.capacity = u64::MAX;
                state.refill_rate = u64::MAX;
                state.tokens = f64::MAX;
                state.unlimited = true;
            }
            Some(bps) => {
                let capacity = bps.max(MIN_CAPACITY_BYTES);
                state.capacity = capacity;
                state.refill_rate = bps;
                state.unlimited = false;
                state.tokens = state.tokens.min(capacity as f64);
            }
        }
    }

    /// Block until `bytes` worth of tokens are available, then consume them.
    pub async fn acquire(&self, bytes: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if state.unlimited {
                    return;
                }
                refill(&mut state);

                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    return;
                }

                let needed = bytes as f64 - state.tokens;
                let wait_secs = needed / state.refill_rate as f64;
                let consumed = state.tokens;
                state.tokens = 0.0;
                let consumed_secs = consumed / state.refill_rate as f64;
                if consumed_secs >= wait_secs {
                    Duration::ZERO
                } else {
                    Duration::from_secs_f64(wait_secs - consumed_secs)
                }
            };

            if wait > Duration::ZERO {
                tokio::time::sleep(wait.min(Duration::from_millis(100))).await;
            }
        }
    }

    pub async fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.unlimited {
            return true;
        }
        refill(&mut state);
        if state.tokens >= bytes as f64 {
            state.tokens -= bytes as f64;
            true
        } else {
            false
        }
    }
}

fn refill(state: &mut State) {
    if state.unlimited {
        return;
    }
    let now = Instant::now();
    let elapsed = now.duration_since(state.last_refill);
    if elapsed.as_secs_f64() > 0.0 {
        let added = elapsed.as_secs_f64() * state.refill_rate as f64;
        state.tokens = (state.tokens + added).min(state.capacity as f64);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_once_bucket_is_drained() {
        let limiter = RateLimiter::new(1000);
        let start = Instant::now();
        limiter.acquire(500).await;
        assert!(start.elapsed().as_millis() < 50);

        limiter.acquire(4000).await;
        assert!(start.elapsed().as_millis() >= 400);
    }

    #[tokio::test]
    async fn unlimited_never_waits() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        for _ in 0..50 {
            limiter.acquire(10_000).await;
        }
        assert!(start.elapsed().as_millis() < 50);
    }

    #[tokio::test]
    async fn capacity_floor_is_4kib() {
        // Even a tiny limit gets at least a 4 KiB bucket so the first
        // chunk of a slow download isn't throttled to single bytes.
        let limiter = RateLimiter::new(100);
        assert!(limiter.try_acquire(4096).await);
        assert!(!limiter.try_acquire(1).await);
    }
}
