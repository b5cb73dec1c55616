use clustercomm_core::OperationId;

/// Errors surfaced by the engine's own API.
///
/// Request dispatch never returns these: dispatch failures become terminal
/// operation results instead.
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("worker pool is not running")]
    PoolStopped,
    #[error("invalid coordinator header: '{header}'")]
    InvalidCoordinatorHeader { header: String },
    #[error("no live operation {operation_id} for answer")]
    UnknownOperation { operation_id: OperationId },
    #[error("directory refresh failed: {0}")]
    Directory(#[source] anyhow::Error),
    #[error("failed to create transport for worker {worker}: {source}")]
    Transport {
        worker: usize,
        #[source]
        source: anyhow::Error,
    },
}
