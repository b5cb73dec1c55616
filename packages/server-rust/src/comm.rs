//! The cluster communication engine: dispatch, sync bridge, wait/enquire/drop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clustercomm_core::{
    Answer, CoordTransactionId, ErrorCode, Method, OperationId, OperationResult, OperationStatus,
    OutboundRequest,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::batch::RetryPolicy;
use crate::config::CommConfig;
use crate::directory::Directory;
use crate::error::CommError;
use crate::pool::{Dispatch, ReplySink, WorkerPool};
use crate::registry::{OperationRegistry, ResponseCallback};
use crate::resolve::{resolve, ResolveError, ResolvedDestination};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::transport::{HttpTransport, Transport, TransportFactory, TransportRequest};

/// Header carrying the route back to the coordinator for asynchronous answers.
pub const COORDINATOR_HEADER: &str = "x-cluster-coordinator";

/// Header carrying the original status code of an asynchronous answer.
pub const RESPONSE_CODE_HEADER: &str = "x-cluster-response-code";

/// Coordinator endpoint receiving asynchronous answers.
pub const SHARD_COMM_PATH: &str = "/_api/shard-comm";

// ---------------------------------------------------------------------------
// Coordinator header
// ---------------------------------------------------------------------------

/// Parsed `node:coordTransactionId:operationId:shardId` routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorHeader {
    pub node_id: String,
    pub coord_transaction_id: CoordTransactionId,
    pub operation_id: OperationId,
    pub shard_id: String,
}

impl CoordinatorHeader {
    /// Parses a header value.
    ///
    /// # Errors
    ///
    /// Returns `CommError::InvalidCoordinatorHeader` unless the value has four
    /// `:`-separated parts with a non-empty node id and numeric ids.
    pub fn parse(value: &str) -> Result<Self, CommError> {
        let invalid = || CommError::InvalidCoordinatorHeader {
            header: value.to_string(),
        };
        let mut parts = value.splitn(4, ':');
        let (Some(node_id), Some(coord), Some(operation), Some(shard_id)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        if node_id.is_empty() {
            return Err(invalid());
        }
        let coord = coord.parse::<u64>().map_err(|_| invalid())?;
        let operation = operation.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self {
            node_id: node_id.to_string(),
            coord_transaction_id: CoordTransactionId(coord),
            operation_id: OperationId(operation),
            shard_id: shard_id.to_string(),
        })
    }
}

impl fmt::Display for CoordinatorHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.node_id, self.coord_transaction_id, self.operation_id, self.shard_id
        )
    }
}

// ---------------------------------------------------------------------------
// RequestOptions
// ---------------------------------------------------------------------------

/// Per-request dispatch options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Whole-request timeout. Zero uses the configured default.
    pub timeout: Duration,
    pub connect_timeout: Option<Duration>,
    /// `false` expects the real answer later through `process_answer`.
    pub single_request: bool,
    /// Log resolution failures at `warn` instead of `debug`.
    pub log_resolution_errors: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: None,
            single_request: true,
            log_resolution_errors: true,
        }
    }
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// ClusterComm
// ---------------------------------------------------------------------------

/// Cluster communication engine. Construct one per process with
/// [`ClusterComm::start`] and share the returned handle.
pub struct ClusterComm {
    config: CommConfig,
    directory: Arc<dyn Directory>,
    registry: Arc<OperationRegistry>,
    pool: WorkerPool,
    scheduler: Arc<dyn Scheduler>,
    retry: RetryPolicy,
    tickets: AtomicU64,
}

impl fmt::Debug for ClusterComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterComm")
            .field("node_id", &self.config.node_id)
            .field("pool", &self.pool)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ClusterComm {
    /// Starts the engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `CommError::Transport` if `factory` fails for any worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(
        config: CommConfig,
        directory: Arc<dyn Directory>,
        factory: &TransportFactory,
    ) -> Result<Arc<Self>, CommError> {
        Self::start_with_scheduler(
            config,
            directory,
            factory,
            Arc::new(TokioScheduler::current()),
        )
    }

    /// Starts the engine with one [`HttpTransport`] per worker.
    ///
    /// # Errors
    ///
    /// Returns `CommError::Transport` if an HTTP client cannot be built.
    pub fn start_http(
        config: CommConfig,
        directory: Arc<dyn Directory>,
    ) -> Result<Arc<Self>, CommError> {
        let connect_timeout = config.connect_timeout();
        let factory = move |_: usize| -> anyhow::Result<Arc<dyn Transport>> {
            Ok(Arc::new(HttpTransport::new(connect_timeout)?))
        };
        Self::start(config, directory, &factory)
    }

    /// Starts the engine with an explicit scheduler for event-driven batches.
    ///
    /// # Errors
    ///
    /// Returns `CommError::Transport` if `factory` fails for any worker.
    pub fn start_with_scheduler(
        config: CommConfig,
        directory: Arc<dyn Directory>,
        factory: &TransportFactory,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>, CommError> {
        let pool = WorkerPool::start(
            config.worker_count,
            config.failed_server_check_interval(),
            &directory,
            factory,
        )?;
        let registry = Arc::new(OperationRegistry::new(config.wait_poll_interval()));
        let retry = RetryPolicy::new(
            Duration::from_millis(config.min_retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        );
        info!(node_id = %config.node_id, workers = pool.len(), "cluster communication started");
        Ok(Arc::new(Self {
            config,
            directory,
            registry,
            pool,
            scheduler,
            retry,
            tickets: AtomicU64::new(1),
        }))
    }

    #[must_use]
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    #[must_use]
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Number of operations currently held by the registry.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.registry.len()
    }

    /// Returns `true` until `shutdown` has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Process-unique ticket, never 0.
    fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    /// Fresh coordinator transaction id for grouping operations.
    #[must_use]
    pub fn new_coord_transaction_id(&self) -> CoordTransactionId {
        CoordTransactionId(self.next_ticket())
    }

    fn effective_timeout(&self, timeout: Duration) -> Duration {
        if timeout.is_zero() {
            self.config.default_request_timeout()
        } else {
            timeout
        }
    }

    fn resolution_failed(result: &mut OperationResult, err: &ResolveError) {
        result.shard_id = err.shard_id().to_string();
        result.server_id = err.server_id().to_string();
        result.fail(
            OperationStatus::BackendUnavailable,
            ErrorCode::CLUSTER_BACKEND_UNAVAILABLE,
            err.to_string(),
        );
    }

    fn transport_request(
        resolved: &ResolvedDestination,
        request: OutboundRequest,
        connect_timeout: Option<Duration>,
    ) -> TransportRequest {
        TransportRequest {
            endpoint: resolved.endpoint.clone(),
            method: request.method,
            path: request.path,
            body: request.body,
            headers: request.headers,
            connect_timeout,
            timeout: None,
        }
    }

    // -- Submission ---------------------------------------------------------

    /// Submits a request and returns its operation id at once.
    ///
    /// A destination that cannot be resolved still yields an id: its
    /// operation is already `BackendUnavailable` and no transport is
    /// contacted. With a `callback` the finished operation is handed to it
    /// (and never registered for `wait`); without one it stays in the
    /// registry until collected by `wait` or `drop_operations`.
    pub fn async_request(
        &self,
        coord: CoordTransactionId,
        destination: &str,
        request: OutboundRequest,
        callback: Option<ResponseCallback>,
        options: &RequestOptions,
    ) -> OperationId {
        let operation_id = OperationId(self.next_ticket());
        metrics::counter!("clustercomm_requests_total").increment(1);

        let mut result = OperationResult::new(operation_id, coord);
        result.single = options.single_request;

        let resolved = match resolve(self.directory.as_ref(), destination) {
            Ok(resolved) => resolved,
            Err(err) => {
                if options.log_resolution_errors {
                    warn!(%operation_id, coord_transaction_id = %coord, destination, error = %err, "cannot resolve destination");
                } else {
                    debug!(%operation_id, coord_transaction_id = %coord, destination, error = %err, "cannot resolve destination");
                }
                Self::resolution_failed(&mut result, &err);
                match callback {
                    Some(callback) => callback(result),
                    None => self.registry.insert(result, None, None),
                }
                return operation_id;
            }
        };

        result.shard_id.clone_from(&resolved.shard_id);
        result.server_id.clone_from(&resolved.server_id);
        result.endpoint.clone_from(&resolved.endpoint);

        let mut request = request;
        if !options.single_request {
            let header = CoordinatorHeader {
                node_id: self.config.node_id.clone(),
                coord_transaction_id: coord,
                operation_id,
                shard_id: resolved.shard_id.clone(),
            };
            request
                .headers
                .insert(COORDINATOR_HEADER.to_string(), header.to_string());
        }

        let worker = self.pool.next_index();
        self.registry.insert(result, Some(worker), callback);
        debug!(%operation_id, coord_transaction_id = %coord, destination, worker, "submitting request");

        self.pool.dispatch(
            worker,
            Dispatch {
                operation_id,
                server_id: resolved.server_id.clone(),
                request: Self::transport_request(&resolved, request, options.connect_timeout),
                timeout: self.effective_timeout(options.timeout),
                sink: ReplySink::tracked(self.registry.clone(), operation_id),
            },
        );
        operation_id
    }

    /// Sends a request and waits for its single reply.
    ///
    /// The operation never enters the registry, so it is invisible to
    /// `enquire`, `wait` and `drop_operations`.
    pub async fn sync_request(
        &self,
        coord: CoordTransactionId,
        destination: &str,
        request: OutboundRequest,
        timeout: Duration,
    ) -> OperationResult {
        let operation_id = OperationId(self.next_ticket());
        metrics::counter!("clustercomm_requests_total").increment(1);

        let mut result = OperationResult::new(operation_id, coord);
        let resolved = match resolve(self.directory.as_ref(), destination) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(%operation_id, coord_transaction_id = %coord, destination, error = %err, "cannot resolve destination");
                Self::resolution_failed(&mut result, &err);
                return result;
            }
        };
        result.shard_id.clone_from(&resolved.shard_id);
        result.server_id.clone_from(&resolved.server_id);
        result.endpoint.clone_from(&resolved.endpoint);

        let (tx, rx) = oneshot::channel();
        let worker = self.pool.next_index();
        self.pool.dispatch(
            worker,
            Dispatch {
                operation_id,
                server_id: resolved.server_id.clone(),
                request: Self::transport_request(&resolved, request, None),
                timeout: self.effective_timeout(timeout),
                sink: ReplySink::direct(tx, result.clone()),
            },
        );

        rx.await.unwrap_or_else(|_| {
            result.fail(
                OperationStatus::Error,
                ErrorCode::CLUSTER_CONNECTION_LOST,
                "reply channel closed",
            );
            result
        })
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Current snapshot of an operation; `Dropped` if it is not tracked.
    #[must_use]
    pub fn enquire(&self, operation_id: OperationId) -> OperationResult {
        self.registry.enquire(operation_id)
    }

    /// Waits for a matching operation to finish and collects it.
    ///
    /// See [`OperationRegistry::wait`]; a zero `timeout` waits indefinitely.
    pub async fn wait(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
        timeout: Duration,
    ) -> OperationResult {
        self.registry
            .wait(coord, operation_id, shard_id, timeout)
            .await
    }

    /// Discards every matching operation and aborts those still in flight.
    /// Calling it again with the same arguments does nothing.
    pub fn drop_operations(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
    ) {
        for dropped in self.registry.drop_matching(coord, operation_id, shard_id) {
            if let Some(worker) = dropped.worker {
                self.pool.abort(worker, dropped.operation_id);
            }
        }
    }

    // -- Asynchronous answers -----------------------------------------------

    /// Completes a `single_request = false` operation with the answer a data
    /// server sent back.
    ///
    /// # Errors
    ///
    /// Returns `CommError::InvalidCoordinatorHeader` for a malformed header and
    /// `CommError::UnknownOperation` when the operation is no longer live.
    pub fn process_answer(&self, coordinator_header: &str, answer: Answer) -> Result<(), CommError> {
        let header = CoordinatorHeader::parse(coordinator_header)?;
        self.registry
            .answer(header.coord_transaction_id, header.operation_id, answer)
            .inspect_err(|err| debug!(error = %err, "discarding asynchronous answer"))
    }

    /// Sends `answer` back to the coordinator named in `coordinator_header`.
    pub async fn async_answer(&self, coordinator_header: &str, answer: Answer) -> OperationResult {
        let header = match CoordinatorHeader::parse(coordinator_header) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "cannot send asynchronous answer");
                let mut result =
                    OperationResult::new(OperationId::ANY, CoordTransactionId::ANY);
                result.fail(OperationStatus::Error, ErrorCode::INTERNAL, err.to_string());
                return result;
            }
        };

        let mut request = OutboundRequest::new(Method::PUT, SHARD_COMM_PATH).with_body(answer.body);
        for (name, value) in answer.headers {
            request = request.with_header(&name, value);
        }
        request = request
            .with_header(COORDINATOR_HEADER, coordinator_header)
            .with_header(RESPONSE_CODE_HEADER, answer.status_code.to_string());

        let destination = format!("server:{}", header.node_id);
        self.sync_request(
            header.coord_transaction_id,
            &destination,
            request,
            self.config.default_request_timeout(),
        )
        .await
    }

    /// Stops every worker. In-flight and queued requests complete with
    /// `Error`; later submissions complete with `Error` immediately.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        info!(outstanding = self.registry.len(), "cluster communication stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use clustercomm_core::Method;

    use super::*;
    use crate::testing::{directory, start_comm, ScriptedTransport};
    use crate::transport::TransportError;

    fn ok_transport() -> ScriptedTransport {
        ScriptedTransport::new(|_, _| Ok(Answer::new(200, r#"{"ok":true}"#)))
    }

    fn get() -> OutboundRequest {
        OutboundRequest::new(Method::GET, "/_api/version")
    }

    #[test]
    fn coordinator_header_round_trip() {
        let header = CoordinatorHeader::parse("CRDN-1:12:34:s100").unwrap();
        assert_eq!(header.node_id, "CRDN-1");
        assert_eq!(header.coord_transaction_id, CoordTransactionId(12));
        assert_eq!(header.operation_id, OperationId(34));
        assert_eq!(header.shard_id, "s100");
        assert_eq!(header.to_string(), "CRDN-1:12:34:s100");

        let empty_shard = CoordinatorHeader::parse("CRDN-1:1:2:").unwrap();
        assert!(empty_shard.shard_id.is_empty());
    }

    #[test]
    fn malformed_coordinator_headers() {
        for bad in ["", "CRDN-1", "CRDN-1:1:2", ":1:2:s1", "CRDN-1:x:2:s1", "CRDN-1:1:-2:s1"] {
            assert!(
                matches!(
                    CoordinatorHeader::parse(bad),
                    Err(CommError::InvalidCoordinatorHeader { .. })
                ),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn bogus_destination_never_reaches_transport() {
        let transport = ok_transport();
        let calls = transport.calls();
        let comm = start_comm(transport, directory());

        let id = comm.async_request(
            CoordTransactionId(1),
            "bogus:foo",
            get(),
            None,
            &RequestOptions::default(),
        );
        let result = comm.enquire(id);
        assert_eq!(result.status, OperationStatus::BackendUnavailable);
        assert_eq!(result.error_code(), ErrorCode::CLUSTER_BACKEND_UNAVAILABLE);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let waited = comm
            .wait(CoordTransactionId(1), id, "", Duration::from_secs(1))
            .await;
        assert_eq!(waited.status, OperationStatus::BackendUnavailable);
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn shard_without_leader_reports_shard_id() {
        let comm = start_comm(ok_transport(), directory());
        let id = comm.async_request(
            CoordTransactionId(1),
            "shard:c7",
            get(),
            None,
            &RequestOptions::default(),
        );
        let result = comm.enquire(id);
        assert_eq!(result.status, OperationStatus::BackendUnavailable);
        assert_eq!(result.shard_id, "c7");
        assert_eq!(result.server_id, "");
    }

    #[tokio::test]
    async fn resolution_failure_goes_to_callback() {
        let comm = start_comm(ok_transport(), directory());
        let (tx, rx) = oneshot::channel();
        comm.async_request(
            CoordTransactionId(1),
            "server:DB-404",
            get(),
            Some(Box::new(move |result| {
                let _ = tx.send(result);
            })),
            &RequestOptions::default(),
        );
        let result = rx.await.unwrap();
        assert_eq!(result.status, OperationStatus::BackendUnavailable);
        assert_eq!(result.server_id, "DB-404");
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let comm = start_comm(ok_transport(), directory());
        let first = comm.async_request(CoordTransactionId(1), "shard:s1", get(), None, &RequestOptions::default());
        let second = comm.async_request(CoordTransactionId(1), "bogus:x", get(), None, &RequestOptions::default());
        let coord = comm.new_coord_transaction_id();
        assert_ne!(first, second);
        assert!(coord.0 > second.0);
    }

    #[tokio::test]
    async fn request_is_resolved_and_answered() {
        let transport = ok_transport();
        let requests = transport.requests();
        let comm = start_comm(transport, directory());

        let id = comm.async_request(
            CoordTransactionId(3),
            "shard:s1",
            get(),
            None,
            &RequestOptions::default(),
        );
        let result = comm
            .wait(CoordTransactionId(3), OperationId::ANY, "s1", Duration::from_secs(5))
            .await;
        assert_eq!(result.operation_id, id);
        assert_eq!(result.status, OperationStatus::Received);
        assert_eq!(result.server_id, "DB-1");
        assert_eq!(result.endpoint, "tcp://10.0.0.1:8529");
        assert_eq!(result.answer_code(), Some(200));

        let seen = requests.lock();
        assert_eq!(seen[0].endpoint, "tcp://10.0.0.1:8529");
        assert!(!seen[0].headers.contains_key(COORDINATOR_HEADER));
    }

    #[tokio::test]
    async fn sync_request_is_invisible_to_registry() {
        let comm = start_comm(ok_transport(), directory());
        let result = comm
            .sync_request(CoordTransactionId(9), "server:DB-2", get(), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, OperationStatus::Received);
        assert_eq!(result.server_id, "DB-2");
        assert_eq!(comm.enquire(result.operation_id).status, OperationStatus::Dropped);
        assert_eq!(comm.outstanding(), 0);

        let waited = comm
            .wait(CoordTransactionId(9), OperationId::ANY, "", Duration::from_secs(1))
            .await;
        assert_eq!(waited.status, OperationStatus::Dropped);
    }

    #[tokio::test]
    async fn sync_request_reports_unreachable_peer() {
        let transport = ScriptedTransport::new(|request, _| {
            Err(TransportError::Unreachable {
                endpoint: request.endpoint.clone(),
                message: "connection refused".to_string(),
            })
        });
        let comm = start_comm(transport, directory());
        let result = comm
            .sync_request(CoordTransactionId(1), "shard:s2", get(), Duration::from_secs(5))
            .await;
        assert_eq!(result.status, OperationStatus::BackendUnavailable);
        assert!(!result.send_was_complete);
        assert_eq!(result.shard_id, "s2");
    }

    #[tokio::test]
    async fn asynchronous_answer_completes_operation() {
        let transport = ScriptedTransport::new(|_, _| Ok(Answer::new(202, "")));
        let requests = transport.requests();
        let comm = start_comm(transport, directory());

        let options = RequestOptions {
            single_request: false,
            ..RequestOptions::default()
        };
        let id = comm.async_request(CoordTransactionId(4), "shard:s1", get(), None, &options);

        let pending = comm
            .wait(CoordTransactionId(4), id, "", Duration::from_millis(200))
            .await;
        assert_eq!(pending.status, OperationStatus::Timeout);
        assert_eq!(comm.enquire(id).status, OperationStatus::Sent);

        let header = requests.lock()[0].headers[COORDINATOR_HEADER].clone();
        assert_eq!(header, format!("CRDN-1:4:{id}:s1"));

        comm.process_answer(&header, Answer::new(201, r#"{"_key":"a"}"#))
            .unwrap();
        let result = comm
            .wait(CoordTransactionId(4), id, "", Duration::from_secs(1))
            .await;
        assert_eq!(result.status, OperationStatus::Received);
        assert_eq!(result.answer_code(), Some(201));

        let late = comm.process_answer(&header, Answer::new(200, ""));
        assert!(matches!(late, Err(CommError::UnknownOperation { .. })));
    }

    #[tokio::test]
    async fn async_answer_routes_to_coordinator() {
        let transport = ok_transport();
        let requests = transport.requests();
        let dir = directory();
        dir.set_endpoint("CRDN-1", "tcp://10.0.0.100:8529");
        let comm = start_comm(transport, dir);

        let result = comm
            .async_answer("CRDN-1:4:17:s1", Answer::new(201, "payload"))
            .await;
        assert_eq!(result.status, OperationStatus::Received);

        let seen = requests.lock();
        let sent = &seen[0];
        assert_eq!(sent.endpoint, "tcp://10.0.0.100:8529");
        assert_eq!(sent.method, Method::PUT);
        assert_eq!(sent.path, SHARD_COMM_PATH);
        assert_eq!(sent.headers[COORDINATOR_HEADER], "CRDN-1:4:17:s1");
        assert_eq!(sent.headers[RESPONSE_CODE_HEADER], "201");
        assert_eq!(sent.body.as_deref(), Some(&b"payload"[..]));
    }

    #[tokio::test]
    async fn async_answer_with_bad_header_fails() {
        let comm = start_comm(ok_transport(), directory());
        let result = comm.async_answer("garbage", Answer::new(200, "")).await;
        assert_eq!(result.status, OperationStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_aborts_in_flight_request() {
        let transport = ok_transport().with_delay(Duration::from_secs(30));
        let comm = start_comm(transport, directory());

        let id = comm.async_request(
            CoordTransactionId(6),
            "shard:s1",
            get(),
            None,
            &RequestOptions::default(),
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(comm.enquire(id).status, OperationStatus::Sent);

        comm.drop_operations(CoordTransactionId(6), OperationId::ANY, "");
        comm.drop_operations(CoordTransactionId(6), OperationId::ANY, "");
        assert_eq!(comm.enquire(id).status, OperationStatus::Dropped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn callback_runs_once_and_skips_registry() {
        let comm = start_comm(ok_transport(), directory());
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let seen = calls.clone();
        comm.async_request(
            CoordTransactionId(2),
            "shard:s3",
            get(),
            Some(Box::new(move |result| {
                seen.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(result);
            })),
            &RequestOptions::default(),
        );
        let result = rx.await.unwrap();
        assert_eq!(result.status, OperationStatus::Received);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(comm.outstanding(), 0);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_result() {
        let transport = ok_transport().with_delay(Duration::from_millis(50));
        let comm = start_comm(transport, directory());
        comm.async_request(CoordTransactionId(7), "shard:s1", get(), None, &RequestOptions::default());

        let spawn_wait = |comm: Arc<ClusterComm>| {
            tokio::spawn(async move {
                comm.wait(CoordTransactionId(7), OperationId::ANY, "", Duration::from_secs(1))
                    .await
                    .status
            })
        };
        let first = spawn_wait(comm.clone());
        let second = spawn_wait(comm.clone());

        let mut statuses = vec![first.await.unwrap(), second.await.unwrap()];
        statuses.sort_by_key(|status| status.as_str());
        assert_eq!(
            statuses,
            vec![OperationStatus::Dropped, OperationStatus::Received]
        );
    }

    #[tokio::test]
    async fn shutdown_fails_outstanding_and_later_requests() {
        let transport = ok_transport().with_delay(Duration::from_secs(600));
        let comm = start_comm(transport, directory());

        let in_flight = comm.async_request(CoordTransactionId(8), "shard:s1", get(), None, &RequestOptions::default());
        tokio::task::yield_now().await;
        comm.shutdown().await;
        assert!(!comm.is_running());

        let result = comm
            .wait(CoordTransactionId(8), in_flight, "", Duration::from_secs(1))
            .await;
        assert_eq!(result.status, OperationStatus::Error);

        let late = comm.async_request(CoordTransactionId(8), "shard:s1", get(), None, &RequestOptions::default());
        assert_eq!(comm.enquire(late).status, OperationStatus::Error);

        let sync = comm
            .sync_request(CoordTransactionId(8), "shard:s1", get(), Duration::from_secs(1))
            .await;
        assert_eq!(sync.status, OperationStatus::Error);
    }
}
