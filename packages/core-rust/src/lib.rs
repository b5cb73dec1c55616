//! `ClusterComm` Core: operation ids, statuses, error codes, destinations and answers.

pub mod answer;
pub mod destination;
pub mod result;
pub mod status;
pub mod types;

pub use answer::{Answer, OutboundRequest, SUCCESS_CODES};
pub use destination::{endpoint_to_url, Destination, DestinationError};
pub use result::OperationResult;
pub use status::{ErrorCode, OperationStatus};
pub use types::{shard_matches, CoordTransactionId, Headers, OperationId};

// Re-exported so callers build requests without depending on `http` directly.
pub use http::Method;
