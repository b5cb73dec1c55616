//! `ClusterComm`: coordinator-to-server request dispatch, operation tracking, and batch retry.

pub mod batch;
pub mod comm;
pub mod config;
pub mod directory;
pub mod error;
pub mod logging;
mod pool;
pub mod registry;
pub mod resolve;
pub mod scheduler;
pub mod transport;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchCompletion, BatchReport, ClusterRequest, RetryPolicy};
pub use comm::{ClusterComm, CoordinatorHeader, RequestOptions, COORDINATOR_HEADER};
pub use config::CommConfig;
pub use directory::{Directory, StaticDirectory};
pub use error::CommError;
pub use registry::ResponseCallback;
pub use resolve::{resolve, ResolveError, ResolvedDestination};
pub use scheduler::{Scheduler, TokioScheduler};
pub use transport::{HttpTransport, SendProgress, Transport, TransportError, TransportRequest};
