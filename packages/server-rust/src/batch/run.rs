use std::collections::HashMap;
use std::time::Duration;

use clustercomm_core::{
    Answer, CoordTransactionId, ErrorCode, OperationId, OperationResult, OperationStatus,
};
use tokio::time::Instant;
use tracing::debug;

use super::{BatchReport, ClusterRequest, RetryPolicy};
use crate::comm::RequestOptions;
use crate::directory::Directory;
use crate::error::CommError;

/// Shortest budget handed to `wait`; a zero budget would wait forever.
pub(super) const MIN_WAIT: Duration = Duration::from_millis(1);

/// Orchestration state shared by the blocking and event-driven batch forms.
#[derive(Debug)]
pub(super) struct BatchRun {
    pub coord: CoordTransactionId,
    /// Next eligible send time per request; `None` while in flight.
    due: Vec<Option<Instant>>,
    in_flight: HashMap<OperationId, usize>,
    start: Instant,
    deadline: Instant,
    retry_on_not_found: bool,
    policy: RetryPolicy,
}

impl BatchRun {
    pub fn new(
        coord: CoordTransactionId,
        len: usize,
        timeout: Duration,
        retry_on_not_found: bool,
        policy: RetryPolicy,
    ) -> Self {
        let start = Instant::now();
        Self {
            coord,
            due: vec![Some(start); len],
            in_flight: HashMap::new(),
            start,
            deadline: start + timeout,
            retry_on_not_found,
            policy,
        }
    }

    /// Every request is done, or the deadline has passed.
    pub fn is_finished(&self, requests: &[ClusterRequest], now: Instant) -> bool {
        now >= self.deadline || requests.iter().all(|request| request.done)
    }

    /// Requests ready to be (re)sent at `now`.
    pub fn due_indices(&self, requests: &[ClusterRequest], now: Instant) -> Vec<usize> {
        requests
            .iter()
            .zip(&self.due)
            .enumerate()
            .filter(|(_, (request, due))| !request.done && due.is_some_and(|due| due <= now))
            .map(|(index, _)| index)
            .collect()
    }

    /// Options for a request sent at `now`: it may use the remaining batch time.
    pub fn request_options(&self, now: Instant) -> RequestOptions {
        RequestOptions {
            timeout: self.deadline.saturating_duration_since(now).max(MIN_WAIT),
            connect_timeout: None,
            single_request: true,
            log_resolution_errors: false,
        }
    }

    pub fn mark_in_flight(&mut self, index: usize, operation_id: OperationId) {
        self.due[index] = None;
        self.in_flight.insert(operation_id, index);
    }

    /// Earliest due time of a pending request, capped at the deadline.
    pub fn next_action_time(&self, requests: &[ClusterRequest]) -> Instant {
        requests
            .iter()
            .zip(&self.due)
            .filter(|(request, _)| !request.done)
            .filter_map(|(_, due)| *due)
            .fold(self.deadline, Instant::min)
    }

    /// Applies one finished operation to its request.
    ///
    /// Results of operations this run did not send are ignored.
    ///
    /// # Errors
    ///
    /// Returns `CommError::Directory` if refreshing the directory for a retry
    /// fails; the result is recorded but the request stays pending.
    pub fn handle_result(
        &mut self,
        requests: &mut [ClusterRequest],
        mut result: OperationResult,
        directory: &dyn Directory,
    ) -> Result<(), CommError> {
        let Some(index) = self.in_flight.remove(&result.operation_id) else {
            debug!(operation_id = %result.operation_id, "ignoring result outside of batch");
            return Ok(());
        };

        if self.retry_on_not_found
            && result.status == OperationStatus::Received
            && result
                .answer
                .as_ref()
                .is_some_and(Answer::is_data_source_not_found)
        {
            debug!(operation_id = %result.operation_id, shard_id = %result.shard_id, "data source not found, retrying");
            result.status = OperationStatus::BackendUnavailable;
            result.error_code = ErrorCode::CLUSTER_BACKEND_UNAVAILABLE;
            result.error_message = "data source not found".to_string();
        }

        let retryable = match result.status {
            OperationStatus::BackendUnavailable => true,
            OperationStatus::Timeout => !result.send_was_complete,
            _ => false,
        };

        let request = &mut requests[index];
        request.result = Some(result);
        if !retryable {
            request.done = true;
            return Ok(());
        }

        directory.refresh().map_err(CommError::Directory)?;

        let now = Instant::now();
        let due = now + self.policy.delay(now.saturating_duration_since(self.start));
        if due >= self.deadline {
            request.done = true;
        } else {
            self.due[index] = Some(due);
            metrics::counter!("clustercomm_batch_retries_total").increment(1);
        }
        Ok(())
    }

    pub fn report(requests: &[ClusterRequest]) -> BatchReport {
        BatchReport::of(requests)
    }
}
