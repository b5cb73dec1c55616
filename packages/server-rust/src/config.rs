use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the cluster communication engine.
///
/// Every field has a default, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CommConfig {
    /// Identifier of this coordinator; echoed in the coordinator header so
    /// data servers can route asynchronous answers back.
    pub node_id: String,
    /// Number of transport workers. Defaults to `cores / 8 + 1`.
    pub worker_count: usize,
    /// Interval at which each worker aborts requests to failed servers (ms).
    pub failed_server_check_interval_ms: u64,
    /// Re-check interval of `wait` with a zero timeout (ms).
    pub wait_poll_interval_ms: u64,
    /// Lower clamp of the batch retry delay (ms).
    pub min_retry_delay_ms: u64,
    /// Upper clamp of the batch retry delay (ms).
    pub max_retry_delay_ms: u64,
    /// Timeout for requests the engine issues on its own behalf (ms).
    pub default_request_timeout_ms: u64,
    /// Connect timeout handed to transports (ms).
    pub connect_timeout_ms: u64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            worker_count: default_worker_count(),
            failed_server_check_interval_ms: 3_000,
            wait_poll_interval_ms: 10_000,
            min_retry_delay_ms: 200,
            max_retry_delay_ms: 10_000,
            default_request_timeout_ms: 120_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl CommConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not valid JSON for this struct.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    #[must_use]
    pub fn failed_server_check_interval(&self) -> Duration {
        Duration::from_millis(self.failed_server_check_interval_ms)
    }

    #[must_use]
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    #[must_use]
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One worker per eight cores, at least one.
fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    cores / 8 + 1
}
