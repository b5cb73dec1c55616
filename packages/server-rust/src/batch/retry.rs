use std::time::Duration;

/// Retry delay derived from how long the batch has been running.
///
/// The delay grows with batch age, not with a request's attempt count, so
/// every request retried late in a batch waits longer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    min: Duration,
    max: Duration,
}

impl RetryPolicy {
    /// Policy clamping delays to `min..=max`. A `max` below `min` is raised to it.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Delay before retrying a request `elapsed` into the batch.
    #[must_use]
    pub fn delay(&self, elapsed: Duration) -> Duration {
        elapsed.clamp(self.min, self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(10))
    }
}
