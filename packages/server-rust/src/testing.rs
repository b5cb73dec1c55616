//! Scripted transport double for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clustercomm_core::Answer;
use parking_lot::Mutex;

use crate::comm::ClusterComm;
use crate::config::CommConfig;
use crate::directory::{Directory, StaticDirectory};
use crate::transport::{SendProgress, Transport, TransportError, TransportFactory, TransportRequest};

type Handler = dyn Fn(&TransportRequest, usize) -> Result<Answer, TransportError> + Send + Sync;

/// Transport whose replies come from a closure.
///
/// The closure receives the request and the zero-based attempt number for its
/// endpoint+path. Unreachable outcomes return at once without marking the
/// request sent; everything else marks it sent, then waits `delay`.
#[derive(Clone)]
pub(crate) struct ScriptedTransport {
    handler: Arc<Handler>,
    delay: Duration,
    unsent: bool,
    calls: Arc<AtomicUsize>,
    attempts: Arc<Mutex<HashMap<String, usize>>>,
    requests: Arc<Mutex<Vec<TransportRequest>>>,
}

impl ScriptedTransport {
    pub(crate) fn new(
        handler: impl Fn(&TransportRequest, usize) -> Result<Answer, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            delay: Duration::ZERO,
            unsent: false,
            calls: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every reply is held back by `delay`.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Never reports the request as fully sent.
    pub(crate) fn with_unsent(mut self) -> Self {
        self.unsent = true;
        self
    }

    /// Shared counter of `send` calls.
    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared log of every request seen.
    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<TransportRequest>>> {
        self.requests.clone()
    }

    /// Factory handing every worker a clone that shares counters.
    pub(crate) fn into_factory(self) -> Box<TransportFactory> {
        Box::new(move |_| {
            let transport: Arc<dyn Transport> = Arc::new(self.clone());
            Ok(transport)
        })
    }

    pub(crate) fn factory(
        handler: impl Fn(&TransportRequest, usize) -> Result<Answer, TransportError>
            + Send
            + Sync
            + 'static,
    ) -> Box<TransportFactory> {
        Self::new(handler).into_factory()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        request: TransportRequest,
        progress: &SendProgress,
    ) -> Result<Answer, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts
                .entry(format!("{}{}", request.endpoint, request.path))
                .or_insert(0);
            let attempt = *counter;
            *counter += 1;
            attempt
        };
        let outcome = (self.handler)(&request, attempt);
        self.requests.lock().push(request);

        if matches!(outcome, Err(TransportError::Unreachable { .. })) {
            return outcome;
        }
        if !self.unsent {
            progress.mark_sent();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Directory whose refresh always fails.
pub(crate) struct BrokenDirectory(pub StaticDirectory);

impl Directory for BrokenDirectory {
    fn responsible_server(&self, shard_id: &str) -> Option<String> {
        self.0.responsible_server(shard_id)
    }

    fn endpoint(&self, server_id: &str) -> Option<String> {
        self.0.endpoint(server_id)
    }

    fn refresh(&self) -> anyhow::Result<()> {
        anyhow::bail!("agency unreachable")
    }

    fn failed_servers(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Directory with shards `s1..s3` led by `DB-1..DB-3`.
pub(crate) fn directory() -> Arc<StaticDirectory> {
    let directory = Arc::new(StaticDirectory::new());
    for n in 1..=3 {
        directory.set_shard_leader(&format!("s{n}"), &format!("DB-{n}"));
        directory.set_endpoint(&format!("DB-{n}"), &format!("tcp://10.0.0.{n}:8529"));
    }
    directory
}

/// Engine with two workers sharing `transport`.
pub(crate) fn start_comm(
    transport: ScriptedTransport,
    directory: Arc<StaticDirectory>,
) -> Arc<ClusterComm> {
    let config = CommConfig {
        node_id: "CRDN-1".to_string(),
        worker_count: 2,
        ..CommConfig::default()
    };
    ClusterComm::start(config, directory, &*transport.into_factory())
        .expect("engine should start")
}
