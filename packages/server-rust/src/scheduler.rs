//! Scheduler seam for continuation-driven code.

use tokio::runtime::Handle;
use tokio::time::Instant;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs outside the caller's stack, now or at a point in time.
pub trait Scheduler: Send + Sync {
    /// Runs `job` as soon as possible.
    fn post(&self, job: Job);

    /// Runs `job` at `at` (immediately if `at` has passed). Timers cannot be
    /// cancelled; jobs must tolerate firing late or after their purpose ended.
    fn arm_timer(&self, at: Instant, job: Job);
}

/// [`Scheduler`] over a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn post(&self, job: Job) {
        self.handle.spawn(async move { job() });
    }

    fn arm_timer(&self, at: Instant, job: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep_until(at).await;
            job();
        });
    }
}
