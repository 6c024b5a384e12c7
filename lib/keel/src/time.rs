use std::time::{Duration, Instant};

/// A duration as whole microseconds.
#[inline]
pub fn duration_micros(duration: Duration) -> u64 {
    duration.as_secs() * 1_000_000 + u64::from(duration.subsec_micros())
}

/// Coarse monotonic clock. Reads zero at creation and counts microseconds
/// from there.
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    #[inline]
    pub fn new() -> Clock {
        Clock {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since the clock was created.
    #[inline]
    pub fn micros(&self) -> u64 {
        let elapsed = self.epoch.elapsed();
        elapsed.as_secs() * 1_000_000 + u64::from(elapsed.subsec_micros())
    }
}
