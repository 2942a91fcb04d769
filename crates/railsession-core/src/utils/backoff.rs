use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Base delay for login retry backoff.
const BACKOFF_BASE_MS: u64 = 1000;

/// Upper bound for login retry backoff.
/// One minute keeps an unattended node retrying without hammering the service.
const BACKOFF_CAP_MS: u64 = 60_000;

/// Range, in seconds, that randomized sleeps are drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SleepInterval {
    pub min: f64,
    pub max: f64,
}

impl Default for SleepInterval {
    fn default() -> Self {
        Self { min: 0.1, max: 5.0 }
    }
}

impl SleepInterval {
    pub fn is_valid(&self) -> bool {
        self.min >= 0.0 && self.min <= self.max
    }
}

/// Pick a random duration inside `interval`.
///
/// Kept synchronous so the thread-local RNG never lives across an `.await`.
pub fn jitter(interval: SleepInterval) -> Duration {
    if interval.max <= interval.min {
        return Duration::from_secs_f64(interval.min.max(0.0));
    }
    let secs = rand::thread_rng().gen_range(interval.min..=interval.max);
    Duration::from_secs_f64(secs)
}

/// Exponential backoff for the `attempt`-th consecutive failure (1-based),
/// capped and jittered into the upper half of the window.
pub fn exponential_backoff(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ceiling = BACKOFF_BASE_MS.saturating_mul(1 << shift).min(BACKOFF_CAP_MS);
    let ms = rand::thread_rng().gen_range(ceiling / 2..=ceiling);
    Duration::from_millis(ms)
}
