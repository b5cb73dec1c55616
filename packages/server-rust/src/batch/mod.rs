//! Batch orchestration: many requests, one coordinator transaction, one deadline.
//!
//! Both forms share [`run::BatchRun`], which owns the per-request due times and
//! the retry decision. The blocking form drives it from an `async` loop over
//! `wait`; the event-driven form drives it from response callbacks and timers
//! posted to the engine's [`Scheduler`](crate::scheduler::Scheduler).

mod blocking;
mod event;
mod retry;
mod run;

use clustercomm_core::{OperationResult, OperationStatus, OutboundRequest};
use serde::Serialize;

pub use event::BatchCompletion;
pub use retry::RetryPolicy;

/// One planned call inside a batch.
///
/// `done` and `result` are written by the orchestrator: `result` holds the
/// last observed outcome, also for requests that ran out of time.
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub destination: String,
    pub request: OutboundRequest,
    pub done: bool,
    pub result: Option<OperationResult>,
}

impl ClusterRequest {
    #[must_use]
    pub fn new(destination: impl Into<String>, request: OutboundRequest) -> Self {
        Self {
            destination: destination.into(),
            request,
            done: false,
            result: None,
        }
    }

    /// Finished with a 2xx answer.
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.done
            && self.result.as_ref().is_some_and(|result| {
                result.status == OperationStatus::Received
                    && result.answer.as_ref().is_some_and(|answer| answer.is_success())
            })
    }
}

/// Outcome counts of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub done: usize,
    pub good: usize,
}

impl BatchReport {
    #[must_use]
    pub fn of(requests: &[ClusterRequest]) -> Self {
        Self {
            total: requests.len(),
            done: requests.iter().filter(|request| request.done).count(),
            good: requests.iter().filter(|request| request.is_good()).count(),
        }
    }

    /// Every request reached a final outcome.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.done == self.total
    }
}
