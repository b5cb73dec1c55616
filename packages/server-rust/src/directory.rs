//! Directory lookup seam: shard -> server -> endpoint, plus failed-server tracking.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

// ---------------------------------------------------------------------------
// Directory trait
// ---------------------------------------------------------------------------

/// Cluster directory consulted by the resolver and the worker pool.
///
/// Lookups are synchronous and must not block on the network; implementations
/// serve them from a locally cached view and update it in `refresh`.
pub trait Directory: Send + Sync {
    /// Server currently responsible for a shard, if known.
    fn responsible_server(&self, shard_id: &str) -> Option<String>;

    /// Endpoint (`tcp://` or `ssl://`) of a server, if known.
    fn endpoint(&self, server_id: &str) -> Option<String>;

    /// Reloads the cached view from the authoritative source.
    fn refresh(&self) -> anyhow::Result<()>;

    /// Servers currently marked as failed.
    fn failed_servers(&self) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// StaticDirectory
// ---------------------------------------------------------------------------

/// In-memory directory mutated explicitly by its owner.
///
/// `refresh` has nothing to reload; it only counts invocations so callers can
/// observe that a refresh was requested.
#[derive(Debug)]
pub struct StaticDirectory {
    shards: DashMap<String, String>,
    endpoints: DashMap<String, String>,
    failed: ArcSwap<HashSet<String>>,
    refreshes: AtomicU64,
}

impl StaticDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
            endpoints: DashMap::new(),
            failed: ArcSwap::from_pointee(HashSet::new()),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Sets (or replaces) the server responsible for a shard.
    pub fn set_shard_leader(&self, shard_id: &str, server_id: &str) {
        self.shards
            .insert(shard_id.to_string(), server_id.to_string());
    }

    /// Forgets the responsible server of a shard.
    pub fn remove_shard(&self, shard_id: &str) {
        self.shards.remove(shard_id);
    }

    /// Sets (or replaces) the endpoint of a server.
    pub fn set_endpoint(&self, server_id: &str, endpoint: &str) {
        self.endpoints
            .insert(server_id.to_string(), endpoint.to_string());
    }

    /// Forgets the endpoint of a server.
    pub fn remove_endpoint(&self, server_id: &str) {
        self.endpoints.remove(server_id);
    }

    /// Marks a server as failed or healthy again.
    pub fn set_failed(&self, server_id: &str, failed: bool) {
        self.failed.rcu(|current| {
            let mut next = HashSet::clone(current);
            if failed {
                next.insert(server_id.to_string());
            } else {
                next.remove(server_id);
            }
            Arc::new(next)
        });
    }

    /// Number of `refresh` calls so far.
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory for StaticDirectory {
    fn responsible_server(&self, shard_id: &str) -> Option<String> {
        self.shards.get(shard_id).map(|entry| entry.value().clone())
    }

    fn endpoint(&self, server_id: &str) -> Option<String> {
        self.endpoints.get(server_id).map(|entry| entry.value().clone())
    }

    fn refresh(&self) -> anyhow::Result<()> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn failed_servers(&self) -> Vec<String> {
        self.failed.load().iter().cloned().collect()
    }
}
