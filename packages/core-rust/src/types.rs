use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Process-unique identifier of one tracked request/response exchange.
///
/// `0` is reserved as the wildcard ("any operation") in `wait`/`drop` calls
/// and is never issued for a real operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl OperationId {
    /// The wildcard id, matching every operation.
    pub const ANY: Self = Self(0);

    /// Returns `true` for the wildcard id.
    #[must_use]
    pub fn is_any(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-chosen correlation key grouping many operations.
///
/// Not a database transaction. `0` means "unset" and matches every
/// coordinator transaction when used as a filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoordTransactionId(pub u64);

impl CoordTransactionId {
    /// The wildcard/unset id.
    pub const ANY: Self = Self(0);

    /// Returns `true` for the wildcard id.
    #[must_use]
    pub fn is_any(self) -> bool {
        self.0 == 0
    }

    /// Wildcard-aware comparison: `ANY` on the filter side matches everything.
    #[must_use]
    pub fn matches(self, candidate: Self) -> bool {
        self.is_any() || self == candidate
    }
}

impl fmt::Display for CoordTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request/response header fields. Keys are kept lowercase by convention.
///
/// `BTreeMap` keeps header order deterministic for logging and tests.
pub type Headers = BTreeMap<String, String>;

/// Wildcard-aware shard comparison: an empty filter matches every shard.
#[must_use]
pub fn shard_matches(filter: &str, candidate: &str) -> bool {
    filter.is_empty() || filter == candidate
}
