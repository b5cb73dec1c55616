//! Operation lifecycle states and numeric error codes.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OperationStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a tracked operation.
///
/// State machine:
/// `Submitted -> Sending -> Sent -> {Received | Timeout}`, and from any
/// non-terminal state directly to `Error`, `Dropped` or `BackendUnavailable`.
/// Once terminal, an operation is never written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationStatus {
    /// Registered, no bytes have left the process yet.
    Submitted,
    /// Handed to the transport, request bytes are being written.
    Sending,
    /// Request bytes are out; awaiting the answer.
    Sent,
    /// An answer arrived.
    Received,
    /// No answer arrived in time.
    Timeout,
    /// The transport or the peer reported a failure.
    Error,
    /// The operation was dropped, or never existed.
    Dropped,
    /// The destination could not be resolved or the peer is unreachable.
    BackendUnavailable,
}

impl OperationStatus {
    /// Returns `true` for states after which no further mutation is permitted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Received | Self::Timeout | Self::Error | Self::Dropped | Self::BackendUnavailable
        )
    }

    /// Returns a static string for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Received => "received",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Dropped => "dropped",
            Self::BackendUnavailable => "backend_unavailable",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Numeric error code observed by callers.
///
/// The named constants are the codes this engine produces itself; any other
/// value is passed through verbatim from an erroneous reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const NO_ERROR: Self = Self(0);
    /// Catch-all for a terminal state without a more specific code.
    pub const INTERNAL: Self = Self(4);
    /// Structured error code carried in a 404 body when a collection/shard is missing.
    pub const DATA_SOURCE_NOT_FOUND: Self = Self(1203);
    /// Deadline passed while waiting for a reply.
    pub const CLUSTER_TIMEOUT: Self = Self(1457);
    /// Connection broke after the request was sent.
    pub const CLUSTER_CONNECTION_LOST: Self = Self(1475);
    /// Destination unresolvable or peer unreachable.
    pub const CLUSTER_BACKEND_UNAVAILABLE: Self = Self(1478);

    /// Returns `true` unless this is `NO_ERROR`.
    #[must_use]
    pub fn is_error(self) -> bool {
        self != Self::NO_ERROR
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
