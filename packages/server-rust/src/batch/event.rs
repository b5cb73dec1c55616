use std::sync::Arc;
use std::time::Duration;

use clustercomm_core::{CoordTransactionId, OperationId, OperationResult};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, error};

use super::run::BatchRun;
use super::{BatchReport, ClusterRequest};
use crate::comm::ClusterComm;
use crate::registry::ResponseCallback;

/// Receives the finished requests and their report, exactly once.
pub type BatchCompletion = Box<dyn FnOnce(Vec<ClusterRequest>, BatchReport) + Send + 'static>;

struct BatchState {
    run: BatchRun,
    requests: Vec<ClusterRequest>,
    on_complete: BatchCompletion,
    /// Only the most recently armed timer may step the batch.
    timer_generation: u64,
    /// Fire time of the live timer; `None` once it has fired.
    armed_at: Option<Instant>,
}

/// Event-driven batch: advanced by response callbacks and timers, never by a
/// task blocked on `wait`. The state is `None` once the batch has finished.
struct AsyncBatch {
    comm: Arc<ClusterComm>,
    state: Mutex<Option<BatchState>>,
}

impl AsyncBatch {
    /// Dispatches due requests and arms the timer for the next action, or
    /// finishes the batch.
    fn step(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return;
        };

        let now = Instant::now();
        if state.run.is_finished(&state.requests, now) {
            let finished = guard.take();
            drop(guard);
            self.finish(finished);
            return;
        }

        for index in state.run.due_indices(&state.requests, now) {
            let request = &state.requests[index];
            let operation_id = self.comm.async_request(
                state.run.coord,
                &request.destination,
                request.request.clone(),
                Some(self.response_callback()),
                &state.run.request_options(now),
            );
            state.run.mark_in_flight(index, operation_id);
        }

        let at = state.run.next_action_time(&state.requests);
        if state.armed_at == Some(at) {
            return;
        }
        state.timer_generation += 1;
        state.armed_at = Some(at);
        let generation = state.timer_generation;
        drop(guard);

        let batch = Arc::clone(self);
        self.comm
            .scheduler()
            .arm_timer(at, Box::new(move || batch.on_timer(generation)));
    }

    /// Callback handed to the dispatcher; moves the result onto the scheduler
    /// so it is never handled on the dispatcher's stack.
    fn response_callback(self: &Arc<Self>) -> ResponseCallback {
        let batch = Arc::clone(self);
        Box::new(move |result: OperationResult| {
            let scheduler = batch.comm.scheduler().clone();
            scheduler.post(Box::new(move || batch.on_result(result)));
        })
    }

    fn on_result(self: &Arc<Self>, result: OperationResult) {
        let outcome = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                debug!(operation_id = %result.operation_id, "result after batch finished");
                return;
            };
            state
                .run
                .handle_result(&mut state.requests, result, self.comm.directory().as_ref())
        };

        if let Err(err) = outcome {
            let finished = self.state.lock().take();
            if let Some(state) = &finished {
                error!(coord_transaction_id = %state.run.coord, error = %err, "batch stopped by unexpected error");
            }
            self.finish(finished);
            return;
        }
        self.step();
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let current = match self.state.lock().as_mut() {
            Some(state) if state.timer_generation == generation => {
                state.armed_at = None;
                true
            }
            _ => false,
        };
        if current {
            self.step();
        }
    }

    fn finish(&self, finished: Option<BatchState>) {
        let Some(state) = finished else {
            return;
        };
        let coord = state.run.coord;
        self.comm.drop_operations(coord, OperationId::ANY, "");
        let report = BatchRun::report(&state.requests);
        debug!(coord_transaction_id = %coord, ?report, "batch finished");
        (state.on_complete)(state.requests, report);
    }
}

impl ClusterComm {
    /// Event-driven form of [`perform_requests`](Self::perform_requests).
    ///
    /// Returns at once with the batch's coordinator transaction id. Requests
    /// advance through response callbacks and timers on the engine's
    /// scheduler; `on_complete` receives them back with the report when all
    /// are done or `timeout` has passed.
    pub fn perform_async_requests(
        self: &Arc<Self>,
        requests: Vec<ClusterRequest>,
        timeout: Duration,
        retry_on_not_found: bool,
        on_complete: impl FnOnce(Vec<ClusterRequest>, BatchReport) + Send + 'static,
    ) -> CoordTransactionId {
        let coord = self.new_coord_transaction_id();
        let run = BatchRun::new(
            coord,
            requests.len(),
            timeout,
            retry_on_not_found,
            self.retry_policy(),
        );
        debug!(coord_transaction_id = %coord, requests = requests.len(), ?timeout, "starting event-driven batch");

        let batch = Arc::new(AsyncBatch {
            comm: Arc::clone(self),
            state: Mutex::new(Some(BatchState {
                run,
                requests,
                on_complete: Box::new(on_complete),
                timer_generation: 0,
                armed_at: None,
            })),
        });
        batch.step();
        coord
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use clustercomm_core::{Answer, Method, OperationStatus, OutboundRequest};
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::CommConfig;
    use crate::directory::StaticDirectory;
    use crate::scheduler::{Job, Scheduler, TokioScheduler};
    use crate::testing::{directory, start_comm, BrokenDirectory, ScriptedTransport};
    use crate::transport::{TransportError, TransportRequest};

    /// Counts armed timers, delegating to the runtime.
    struct CountingScheduler {
        inner: TokioScheduler,
        timers: Arc<AtomicUsize>,
    }

    impl Scheduler for CountingScheduler {
        fn post(&self, job: Job) {
            self.inner.post(job);
        }

        fn arm_timer(&self, at: Instant, job: Job) {
            self.timers.fetch_add(1, Ordering::SeqCst);
            self.inner.arm_timer(at, job);
        }
    }

    fn batch(destinations: &[&str]) -> Vec<ClusterRequest> {
        destinations
            .iter()
            .map(|destination| {
                ClusterRequest::new(
                    *destination,
                    OutboundRequest::new(Method::PUT, "/_api/document/c/k").with_body("{}"),
                )
            })
            .collect()
    }

    async fn run_batch(
        comm: &Arc<ClusterComm>,
        requests: Vec<ClusterRequest>,
        timeout: Duration,
    ) -> (Vec<ClusterRequest>, BatchReport) {
        let (tx, rx) = oneshot::channel();
        comm.perform_async_requests(requests, timeout, false, move |requests, report| {
            let _ = tx.send((requests, report));
        });
        rx.await.unwrap()
    }

    fn unreachable(endpoint: &str) -> TransportError {
        TransportError::Unreachable {
            endpoint: endpoint.to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn completes_with_all_answers() {
        let comm = start_comm(
            ScriptedTransport::new(|_, _| Ok(Answer::new(202, "{}"))),
            directory(),
        );
        let (requests, report) =
            run_batch(&comm, batch(&["shard:s1", "shard:s2", "shard:s3"]), Duration::from_secs(5))
                .await;

        assert_eq!(
            report,
            BatchReport {
                total: 3,
                done: 3,
                good: 3
            }
        );
        assert!(requests
            .iter()
            .all(|request| request.result.as_ref().unwrap().status == OperationStatus::Received));
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let comm = start_comm(
            ScriptedTransport::new(|_, _| Ok(Answer::new(200, "{}"))),
            directory(),
        );
        let (requests, report) = run_batch(&comm, Vec::new(), Duration::from_secs(5)).await;
        assert!(requests.is_empty());
        assert_eq!(report, BatchReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_backends_give_up() {
        let transport = ScriptedTransport::new(|request, _| {
            Err(TransportError::Unreachable {
                endpoint: request.endpoint.clone(),
                message: "connection refused".to_string(),
            })
        });
        let calls = transport.calls();
        let comm = start_comm(transport, directory());

        let start = Instant::now();
        let (requests, report) =
            run_batch(&comm, batch(&["shard:s1", "shard:s2", "shard:s3"]), Duration::from_secs(5))
                .await;

        assert_eq!(report.done, 3);
        assert_eq!(report.good, 0);
        assert!(start.elapsed() <= Duration::from_secs(5));
        assert!(calls.load(Ordering::SeqCst) >= 6);
        assert!(requests.iter().all(|request| {
            request.result.as_ref().unwrap().status == OperationStatus::BackendUnavailable
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let transport = ScriptedTransport::new(|request, attempt| {
            if attempt < 2 {
                Err(TransportError::Unreachable {
                    endpoint: request.endpoint.clone(),
                    message: "connection refused".to_string(),
                })
            } else {
                Ok(Answer::new(200, "{}"))
            }
        });
        let calls = transport.calls();
        let comm = start_comm(transport, directory());

        let (_, report) = run_batch(&comm, batch(&["shard:s2"]), Duration::from_secs(30)).await;
        assert_eq!(report.good, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_finishes_slow_batch() {
        let transport = ScriptedTransport::new(|_, _| Ok(Answer::new(200, "{}")))
            .with_delay(Duration::from_secs(120));
        let comm = start_comm(transport, directory());

        let start = Instant::now();
        let (_, report) = run_batch(&comm, batch(&["shard:s1"]), Duration::from_secs(3)).await;
        assert_eq!(report.good, 0);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(120));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_retried_next_to_unresolvable_destination() {
        let transport = ScriptedTransport::new(|_: &TransportRequest, attempt: usize| {
            if attempt == 0 {
                Ok(Answer::new(404, r#"{"error":true,"errorNum":1203}"#))
            } else {
                Ok(Answer::new(200, "{}"))
            }
        });
        let calls = transport.calls();
        let comm = start_comm(transport, directory());

        let (tx, rx) = oneshot::channel();
        comm.perform_async_requests(
            batch(&["bogus:x", "shard:s1"]),
            Duration::from_secs(3),
            true,
            move |requests, report| {
                let _ = tx.send((requests, report));
            },
        );
        let (requests, report) = rx.await.unwrap();

        assert_eq!(
            report,
            BatchReport {
                total: 2,
                done: 2,
                good: 1
            }
        );
        assert_eq!(
            requests[0].result.as_ref().unwrap().status,
            OperationStatus::BackendUnavailable
        );
        assert!(requests[1].is_good());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn directory_failure_stops_batch() {
        let inner = StaticDirectory::new();
        inner.set_shard_leader("s1", "DB-1");
        inner.set_endpoint("DB-1", "tcp://10.0.0.1:8529");
        let transport = ScriptedTransport::new(|request: &TransportRequest, _: usize| {
            Err(unreachable(&request.endpoint))
        });
        let calls = transport.calls();
        let comm = ClusterComm::start(
            CommConfig {
                worker_count: 1,
                ..CommConfig::default()
            },
            Arc::new(BrokenDirectory(inner)),
            &*transport.into_factory(),
        )
        .unwrap();

        let start = Instant::now();
        let (requests, report) =
            run_batch(&comm, batch(&["shard:s1"]), Duration::from_secs(60)).await;

        assert_eq!(report.total, 1);
        assert_eq!(report.done, 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            requests[0].result.as_ref().unwrap().status,
            OperationStatus::BackendUnavailable
        );
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn results_do_not_rearm_an_unchanged_timer() {
        let timers = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new(CountingScheduler {
            inner: TokioScheduler::current(),
            timers: timers.clone(),
        });
        let transport = ScriptedTransport::new(|_: &TransportRequest, _: usize| {
            Ok(Answer::new(200, "{}"))
        });
        let comm = ClusterComm::start_with_scheduler(
            CommConfig {
                worker_count: 2,
                ..CommConfig::default()
            },
            directory(),
            &*transport.into_factory(),
            scheduler,
        )
        .unwrap();

        let (_, report) = run_batch(
            &comm,
            batch(&["shard:s1", "shard:s2", "shard:s3"]),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(report.good, 3);
        assert_eq!(timers.load(Ordering::SeqCst), 1);
    }
}
