use std::time::Duration;

use clustercomm_core::{OperationId, OperationStatus};
use tokio::time::Instant;
use tracing::{debug, error};

use super::run::{BatchRun, MIN_WAIT};
use super::{BatchReport, ClusterRequest};
use crate::comm::ClusterComm;
use crate::error::CommError;

impl ClusterComm {
    /// Sends every request, retrying transient failures, until all are done or
    /// `timeout` has passed.
    ///
    /// Each request's `done` and `result` are filled in place. Requests still
    /// in flight at the deadline are dropped and stay not-done.
    pub async fn perform_requests(
        &self,
        requests: &mut [ClusterRequest],
        timeout: Duration,
        retry_on_not_found: bool,
    ) -> BatchReport {
        if requests.is_empty() {
            return BatchReport::default();
        }

        let coord = self.new_coord_transaction_id();
        let mut run = BatchRun::new(
            coord,
            requests.len(),
            timeout,
            retry_on_not_found,
            self.retry_policy(),
        );
        debug!(coord_transaction_id = %coord, requests = requests.len(), ?timeout, "starting batch");

        if let Err(err) = self.drive_batch(&mut run, requests).await {
            error!(coord_transaction_id = %coord, error = %err, "batch stopped by unexpected error");
        }

        self.drop_operations(coord, OperationId::ANY, "");
        let report = BatchRun::report(requests);
        debug!(coord_transaction_id = %coord, ?report, "batch finished");
        report
    }

    async fn drive_batch(
        &self,
        run: &mut BatchRun,
        requests: &mut [ClusterRequest],
    ) -> Result<(), CommError> {
        loop {
            let now = Instant::now();
            if run.is_finished(requests, now) {
                return Ok(());
            }

            for index in run.due_indices(requests, now) {
                let request = &requests[index];
                let operation_id = self.async_request(
                    run.coord,
                    &request.destination,
                    request.request.clone(),
                    None,
                    &run.request_options(now),
                );
                run.mark_in_flight(index, operation_id);
            }

            let next = run.next_action_time(requests);
            let budget = next.saturating_duration_since(Instant::now()).max(MIN_WAIT);
            let result = self.wait(run.coord, OperationId::ANY, "", budget).await;
            match result.status {
                // Nothing in flight: sleep until the next retry or the deadline.
                OperationStatus::Dropped => tokio::time::sleep_until(next).await,
                OperationStatus::Timeout if result.operation_id.is_any() => {}
                _ => run.handle_result(requests, result, self.directory().as_ref())?,
            }
        }
    }
}
