//! Destination resolution: logical destination string -> concrete endpoint.

use clustercomm_core::{Destination, DestinationError};

use crate::directory::Directory;

/// A destination resolved to a network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDestination {
    pub endpoint: String,
    /// Empty unless the destination named a shard.
    pub shard_id: String,
    /// Empty for raw endpoints.
    pub server_id: String,
}

/// Reasons a destination could not be resolved.
///
/// Every variant becomes a `BackendUnavailable` operation; the ids known at
/// the point of failure are kept so the operation can report them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error("cannot find responsible server for shard '{shard_id}'")]
    NoResponsibleServer { shard_id: String },
    #[error("did not find endpoint of server '{server_id}'")]
    UnknownServer { shard_id: String, server_id: String },
}

impl ResolveError {
    /// Shard id known before the failure (empty if none).
    #[must_use]
    pub fn shard_id(&self) -> &str {
        match self {
            Self::Destination(_) => "",
            Self::NoResponsibleServer { shard_id } | Self::UnknownServer { shard_id, .. } => {
                shard_id
            }
        }
    }

    /// Server id known before the failure (empty if none).
    #[must_use]
    pub fn server_id(&self) -> &str {
        match self {
            Self::UnknownServer { server_id, .. } => server_id,
            _ => "",
        }
    }
}

/// Resolves `destination` through `directory`.
///
/// `shard:` goes shard -> server -> endpoint, `server:` goes server ->
/// endpoint, raw endpoints are used verbatim without touching the directory.
///
/// # Errors
///
/// Returns a `ResolveError` when the string is outside the destination grammar
/// or any directory lookup comes back empty.
pub fn resolve(
    directory: &dyn Directory,
    destination: &str,
) -> Result<ResolvedDestination, ResolveError> {
    match Destination::parse(destination)? {
        Destination::Shard(shard_id) => {
            let Some(server_id) = directory.responsible_server(&shard_id) else {
                return Err(ResolveError::NoResponsibleServer { shard_id });
            };
            let Some(endpoint) = directory.endpoint(&server_id) else {
                return Err(ResolveError::UnknownServer {
                    shard_id,
                    server_id,
                });
            };
            Ok(ResolvedDestination {
                endpoint,
                shard_id,
                server_id,
            })
        }
        Destination::Server(server_id) => match directory.endpoint(&server_id) {
            Some(endpoint) => Ok(ResolvedDestination {
                endpoint,
                shard_id: String::new(),
                server_id,
            }),
            None => Err(ResolveError::UnknownServer {
                shard_id: String::new(),
                server_id,
            }),
        },
        Destination::Endpoint(endpoint) => Ok(ResolvedDestination {
            endpoint,
            shard_id: String::new(),
            server_id: String::new(),
        }),
    }
}
