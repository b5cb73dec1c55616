//! Worker pool: N transport workers, round-robin assignment, failed-server aborts.
//!
//! Each worker owns one [`Transport`] and the table of requests it has in
//! flight. A request's reply goes through a [`ReplySink`], which is consumed on
//! delivery; whoever removes the in-flight entry first (the transport task, an
//! abort, or shutdown) is the only one able to deliver.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clustercomm_core::{OperationId, OperationResult};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::error::CommError;
use crate::registry::OperationRegistry;
use crate::transport::{
    Delivery, SendProgress, Transport, TransportError, TransportFactory, TransportRequest,
};
use crate::worker::{BackgroundRunnable, BackgroundWorker};

// ---------------------------------------------------------------------------
// ReplySink
// ---------------------------------------------------------------------------

enum SinkTarget {
    /// Registered operation, completed through the registry.
    Tracked {
        registry: Arc<OperationRegistry>,
        operation_id: OperationId,
    },
    /// Sync bridge: the finished result goes straight to the waiting caller.
    Direct {
        tx: oneshot::Sender<OperationResult>,
        result: OperationResult,
    },
}

/// Where the outcome of one request goes. Delivers at most once.
///
/// A sink dropped without delivering completes its operation with an
/// `Aborted` error, so no caller is left waiting on a request that a stopped
/// worker will never send.
pub(crate) struct ReplySink {
    target: Option<SinkTarget>,
}

impl ReplySink {
    pub(crate) fn tracked(registry: Arc<OperationRegistry>, operation_id: OperationId) -> Self {
        Self {
            target: Some(SinkTarget::Tracked {
                registry,
                operation_id,
            }),
        }
    }

    pub(crate) fn direct(tx: oneshot::Sender<OperationResult>, result: OperationResult) -> Self {
        Self {
            target: Some(SinkTarget::Direct { tx, result }),
        }
    }

    /// Marks the operation as being handed to the transport.
    ///
    /// Returns `false` if a tracked operation was dropped while queued.
    fn begin_send(&self) -> bool {
        match &self.target {
            Some(SinkTarget::Tracked {
                registry,
                operation_id,
            }) => registry.begin_send(*operation_id),
            Some(SinkTarget::Direct { .. }) => true,
            None => false,
        }
    }

    fn progress(&self) -> SendProgress {
        match &self.target {
            Some(SinkTarget::Tracked {
                registry,
                operation_id,
            }) => SendProgress::tracked(registry.clone(), *operation_id),
            _ => SendProgress::detached(),
        }
    }

    /// Consumes the sink without delivering anything.
    fn discard(mut self) {
        self.target = None;
    }

    pub(crate) fn deliver(mut self, delivery: Delivery) {
        if let Some(target) = self.target.take() {
            Self::deliver_to(target, delivery);
        }
    }

    fn deliver_to(target: SinkTarget, delivery: Delivery) {
        match target {
            SinkTarget::Tracked {
                registry,
                operation_id,
            } => registry.complete(operation_id, delivery),
            SinkTarget::Direct { tx, mut result } => {
                delivery.apply_to(&mut result);
                // The caller may have given up waiting.
                let _ = tx.send(result);
            }
        }
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            Self::deliver_to(
                target,
                Delivery::failure(
                    TransportError::Aborted {
                        reason: "worker stopped".to_string(),
                    },
                    false,
                ),
            );
        }
    }
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.target {
            Some(SinkTarget::Tracked { .. }) => "tracked",
            Some(SinkTarget::Direct { .. }) => "direct",
            None => "delivered",
        };
        f.debug_tuple("ReplySink").field(&kind).finish()
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// One request ready for a worker.
#[derive(Debug)]
pub(crate) struct Dispatch {
    pub operation_id: OperationId,
    /// Empty for raw endpoints.
    pub server_id: String,
    pub request: TransportRequest,
    pub timeout: Duration,
    pub sink: ReplySink,
}

/// Task variants for a transport worker.
#[derive(Debug)]
pub(crate) enum WorkerTask {
    Send(Box<Dispatch>),
    /// Cancel one in-flight request; its outcome is discarded by the registry.
    Abort(OperationId),
}

// ---------------------------------------------------------------------------
// TransportWorker
// ---------------------------------------------------------------------------

struct InFlight {
    server_id: String,
    cancel: CancellationToken,
    sink: ReplySink,
}

/// Runnable owning one transport and the requests it has in flight.
pub(crate) struct TransportWorker {
    index: usize,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn Directory>,
    in_flight: Arc<DashMap<OperationId, InFlight>>,
}

impl TransportWorker {
    fn new(index: usize, transport: Arc<dyn Transport>, directory: Arc<dyn Directory>) -> Self {
        Self {
            index,
            transport,
            directory,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    fn send(&self, dispatch: Dispatch) {
        let Dispatch {
            operation_id,
            server_id,
            mut request,
            timeout,
            sink,
        } = dispatch;
        request.timeout = Some(timeout);

        if !sink.begin_send() {
            debug!(worker = self.index, %operation_id, "skipping operation dropped while queued");
            sink.discard();
            return;
        }

        let progress = sink.progress();
        let cancel = CancellationToken::new();
        self.in_flight.insert(
            operation_id,
            InFlight {
                server_id,
                cancel: cancel.clone(),
                sink,
            },
        );

        let transport = self.transport.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = cancel.cancelled() => return,
                sent = async {
                    if transport.enforces_timeout() {
                        transport.send(request, &progress).await
                    } else {
                        tokio::time::timeout(timeout, transport.send(request, &progress))
                            .await
                            .unwrap_or(Err(TransportError::Timeout))
                    }
                } => sent,
            };
            if let Some((_, entry)) = in_flight.remove(&operation_id) {
                entry.sink.deliver(Delivery {
                    outcome,
                    send_was_complete: progress.is_complete(),
                });
            }
        });
    }

    fn abort(&self, operation_id: OperationId, error: TransportError) -> bool {
        match self.in_flight.remove(&operation_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                entry.sink.deliver(Delivery::failure(error, false));
                true
            }
            None => false,
        }
    }

    /// Aborts every in-flight request addressed to a server marked failed.
    fn abort_failed_servers(&self) -> usize {
        let failed: HashSet<String> = self.directory.failed_servers().into_iter().collect();
        if failed.is_empty() {
            return 0;
        }

        let doomed: Vec<(OperationId, String)> = self
            .in_flight
            .iter()
            .filter(|entry| failed.contains(&entry.server_id))
            .map(|entry| (*entry.key(), entry.server_id.clone()))
            .collect();

        doomed
            .into_iter()
            .filter(|(operation_id, server_id)| {
                self.abort(
                    *operation_id,
                    TransportError::ServerFailed {
                        server_id: server_id.clone(),
                    },
                )
            })
            .count()
    }
}

#[async_trait]
impl BackgroundRunnable for TransportWorker {
    type Task = WorkerTask;

    async fn run(&mut self, task: WorkerTask) {
        match task {
            WorkerTask::Send(dispatch) => self.send(*dispatch),
            WorkerTask::Abort(operation_id) => {
                if self.abort(
                    operation_id,
                    TransportError::Aborted {
                        reason: "operation dropped".to_string(),
                    },
                ) {
                    debug!(worker = self.index, %operation_id, "aborted in-flight request");
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        let aborted = self.abort_failed_servers();
        if aborted > 0 {
            warn!(worker = self.index, aborted, "aborted requests to failed servers");
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<OperationId> = self.in_flight.iter().map(|entry| *entry.key()).collect();
        for operation_id in ids {
            self.abort(
                operation_id,
                TransportError::Aborted {
                    reason: "worker pool shutting down".to_string(),
                },
            );
        }
        debug!(worker = self.index, "transport worker stopped");
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// Fixed set of transport workers with round-robin assignment.
pub(crate) struct WorkerPool {
    workers: Vec<BackgroundWorker<TransportWorker>>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one), each with its own transport.
    pub(crate) fn start(
        count: usize,
        check_interval: Duration,
        directory: &Arc<dyn Directory>,
        factory: &TransportFactory,
    ) -> Result<Self, CommError> {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let transport =
                factory(index).map_err(|source| CommError::Transport { worker: index, source })?;
            let runnable = TransportWorker::new(index, transport, directory.clone());
            workers.push(BackgroundWorker::start(runnable, check_interval));
        }
        info!(workers = count, "worker pool started");
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Index of the worker for the next request.
    pub(crate) fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len()
    }

    /// Queues a request on worker `index`.
    ///
    /// On a stopped pool the dispatch is dropped, which completes its
    /// operation with an error through the sink.
    pub(crate) fn dispatch(&self, index: usize, dispatch: Dispatch) {
        let operation_id = dispatch.operation_id;
        if let Err(err) = self.workers[index].submit(WorkerTask::Send(Box::new(dispatch))) {
            debug!(worker = index, %operation_id, error = %err, "request rejected");
        }
    }

    pub(crate) fn abort(&self, index: usize, operation_id: OperationId) {
        if let Some(worker) = self.workers.get(index) {
            let _ = worker.submit(WorkerTask::Abort(operation_id));
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.workers.iter().all(BackgroundWorker::is_running)
    }

    /// Stops every worker, aborting what they have in flight.
    pub(crate) async fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop().await;
        }
        info!("worker pool stopped");
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
