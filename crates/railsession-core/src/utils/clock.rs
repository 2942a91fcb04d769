use chrono::Utc;
use tokio::time::Instant;

/// Wall-clock time derived from a monotonic origin.
///
/// The epoch is sampled once; later readings add elapsed monotonic time, so a
/// paused tokio clock (tests) drives it exactly like `tokio::time::sleep`.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch_millis: i64,
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch_millis: Utc::now().timestamp_millis(),
            origin: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.epoch_millis + self.origin.elapsed().as_millis() as i64
    }

    pub fn now_secs(&self) -> i64 {
        self.now_millis() / 1000
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
