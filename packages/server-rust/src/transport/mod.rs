//! Transport seam: how a resolved request reaches the wire.
//!
//! A `Transport` sends one request and yields its answer. Each worker owns its
//! own transport instance; the worker wraps every send with the per-request
//! timeout and cancellation, and reports the outcome as a [`Delivery`].

pub mod http_transport;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clustercomm_core::{
    Answer, ErrorCode, Headers, Method, OperationId, OperationResult, OperationStatus,
};
use tracing::warn;

use crate::registry::OperationRegistry;

pub use self::http_transport::HttpTransport;

// ---------------------------------------------------------------------------
// Request / error types
// ---------------------------------------------------------------------------

/// A fully resolved request as handed to a transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// `tcp://host:port` or `ssl://host:port`.
    pub endpoint: String,
    pub method: Method,
    pub path: String,
    pub body: Option<Bytes>,
    pub headers: Headers,
    /// Per-request connect timeout; transports fall back to their own default.
    pub connect_timeout: Option<Duration>,
    /// Overall deadline for the exchange, filled in by the worker.
    pub timeout: Option<Duration>,
}

/// Failures reported by a transport or by the worker driving it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect to endpoint '{endpoint}': {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("request timed out")]
    Timeout,
    #[error("server '{server_id}' is marked as failed")]
    ServerFailed { server_id: String },
    #[error("request aborted: {reason}")]
    Aborted { reason: String },
    #[error("{message}")]
    Failed { code: ErrorCode, message: String },
}

impl TransportError {
    /// Returns `true` when the peer could not be reached at all.
    #[must_use]
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::ServerFailed { .. })
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// One transport instance, exclusively owned by one worker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends `request` and waits for its answer.
    ///
    /// Implementations call `progress.mark_sent()` once the request bytes are
    /// fully written. Cancellation is applied by the caller by dropping the
    /// returned future; so is the timeout, unless
    /// [`enforces_timeout`](Self::enforces_timeout) says otherwise.
    async fn send(
        &self,
        request: TransportRequest,
        progress: &SendProgress,
    ) -> Result<Answer, TransportError>;

    /// Whether `send` honours `TransportRequest::timeout` itself and reports
    /// expiry as `TransportError::Timeout` after updating `progress`.
    fn enforces_timeout(&self) -> bool {
        false
    }
}

/// Builds the transport instance for worker `index`.
pub type TransportFactory =
    dyn Fn(usize) -> anyhow::Result<Arc<dyn Transport>> + Send + Sync;

// ---------------------------------------------------------------------------
// SendProgress
// ---------------------------------------------------------------------------

/// Handle through which a transport reports that the request bytes are out.
///
/// For tracked operations this moves the registry entry `Sending -> Sent`;
/// the flag itself becomes `send_was_complete` when the request fails.
#[derive(Clone)]
pub struct SendProgress {
    complete: Arc<AtomicBool>,
    tracked: Option<(Arc<OperationRegistry>, OperationId)>,
}

impl SendProgress {
    /// Progress handle that updates nothing but its own flag.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            complete: Arc::new(AtomicBool::new(false)),
            tracked: None,
        }
    }

    pub(crate) fn tracked(registry: Arc<OperationRegistry>, operation_id: OperationId) -> Self {
        Self {
            complete: Arc::new(AtomicBool::new(false)),
            tracked: Some((registry, operation_id)),
        }
    }

    /// Records that the request has been written completely. Idempotent.
    pub fn mark_sent(&self) {
        if self.complete.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some((registry, operation_id)) = &self.tracked {
            registry.mark_sent(*operation_id);
        }
    }

    /// Whether `mark_sent` has been called.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SendProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendProgress")
            .field("complete", &self.is_complete())
            .field("operation_id", &self.tracked.as_ref().map(|(_, id)| *id))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Final outcome of one transport exchange, as seen by the completion path.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub outcome: Result<Answer, TransportError>,
    pub send_was_complete: bool,
}

impl Delivery {
    #[must_use]
    pub fn answer(answer: Answer) -> Self {
        Self {
            outcome: Ok(answer),
            send_was_complete: true,
        }
    }

    #[must_use]
    pub fn failure(error: TransportError, send_was_complete: bool) -> Self {
        Self {
            outcome: Err(error),
            send_was_complete,
        }
    }

    /// Writes this outcome into `result` as its terminal state.
    ///
    /// Unreachable peers become `BackendUnavailable` (and are the only
    /// failures logged as connection errors), timeouts become `Timeout`,
    /// everything else `Error`.
    pub fn apply_to(self, result: &mut OperationResult) {
        let error = match self.outcome {
            Ok(answer) => {
                result.receive(answer);
                return;
            }
            Err(error) => error,
        };

        result.send_was_complete = self.send_was_complete;
        match &error {
            TransportError::Unreachable { .. } | TransportError::ServerFailed { .. } => {
                warn!(
                    operation_id = %result.operation_id,
                    endpoint = %result.endpoint,
                    server_id = %result.server_id,
                    error = %error,
                    "cluster connection error"
                );
                metrics::counter!("clustercomm_backend_unavailable_total").increment(1);
                result.fail(
                    OperationStatus::BackendUnavailable,
                    ErrorCode::CLUSTER_BACKEND_UNAVAILABLE,
                    error.to_string(),
                );
            }
            TransportError::Timeout => {
                result.fail(
                    OperationStatus::Timeout,
                    ErrorCode::CLUSTER_TIMEOUT,
                    error.to_string(),
                );
            }
            TransportError::Aborted { .. } => {
                result.fail(
                    OperationStatus::Error,
                    ErrorCode::CLUSTER_CONNECTION_LOST,
                    error.to_string(),
                );
            }
            TransportError::Failed { code, .. } => {
                result.fail(OperationStatus::Error, *code, error.to_string());
            }
        }
    }
}
