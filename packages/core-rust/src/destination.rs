//! Logical destination strings.
//!
//! Grammar:
//!
//! ```text
//! destination := "shard:" ID | "server:" ID | "tcp://" HOSTPORT PATH? | "ssl://" HOSTPORT PATH?
//! ```
//!
//! Any other prefix is rejected. Shards and servers are resolved through the
//! directory at dispatch time; raw endpoints are used verbatim.

use std::fmt;

/// Parsed routing target of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// A logical data partition, resolved to its responsible server.
    Shard(String),
    /// A server id, resolved to its endpoint.
    Server(String),
    /// A raw `tcp://` or `ssl://` endpoint.
    Endpoint(String),
}

/// Errors from parsing a destination string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    #[error("did not understand destination '{destination}'")]
    UnknownScheme { destination: String },
    #[error("destination '{destination}' has an empty identifier")]
    EmptyId { destination: String },
}

const SHARD_PREFIX: &str = "shard:";
const SERVER_PREFIX: &str = "server:";
const TCP_SCHEME: &str = "tcp://";
const SSL_SCHEME: &str = "ssl://";

impl Destination {
    /// Parses a destination string.
    ///
    /// # Errors
    ///
    /// Returns `DestinationError::UnknownScheme` for any prefix outside the
    /// grammar and `DestinationError::EmptyId` when the id/host part is empty.
    pub fn parse(destination: &str) -> Result<Self, DestinationError> {
        let empty = || DestinationError::EmptyId {
            destination: destination.to_string(),
        };

        if let Some(id) = destination.strip_prefix(SHARD_PREFIX) {
            if id.is_empty() {
                return Err(empty());
            }
            return Ok(Self::Shard(id.to_string()));
        }
        if let Some(id) = destination.strip_prefix(SERVER_PREFIX) {
            if id.is_empty() {
                return Err(empty());
            }
            return Ok(Self::Server(id.to_string()));
        }
        for scheme in [TCP_SCHEME, SSL_SCHEME] {
            if let Some(rest) = destination.strip_prefix(scheme) {
                if rest.is_empty() || rest.starts_with('/') {
                    return Err(empty());
                }
                return Ok(Self::Endpoint(destination.to_string()));
            }
        }
        Err(DestinationError::UnknownScheme {
            destination: destination.to_string(),
        })
    }

    /// Shard id, if this destination names a shard.
    #[must_use]
    pub fn shard_id(&self) -> Option<&str> {
        match self {
            Self::Shard(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shard(id) => write!(f, "{SHARD_PREFIX}{id}"),
            Self::Server(id) => write!(f, "{SERVER_PREFIX}{id}"),
            Self::Endpoint(endpoint) => f.write_str(endpoint),
        }
    }
}

/// Converts a `tcp://`/`ssl://` endpoint to an `http://`/`https://` base URL.
///
/// Returns `None` for strings outside the endpoint grammar.
#[must_use]
pub fn endpoint_to_url(endpoint: &str) -> Option<String> {
    if let Some(rest) = endpoint.strip_prefix(TCP_SCHEME) {
        return Some(format!("http://{}", rest.trim_end_matches('/')));
    }
    endpoint
        .strip_prefix(SSL_SCHEME)
        .map(|rest| format!("https://{}", rest.trim_end_matches('/')))
}
