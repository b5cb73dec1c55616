//! Background worker for queued and periodic tasks.
//!
//! Provides a generic `BackgroundWorker<R>` that processes tasks from an mpsc channel
//! via a `BackgroundRunnable` implementation, with periodic tick callbacks.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::CommError;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Trait for task handlers executed by `BackgroundWorker`.
///
/// Implementors define how individual tasks are processed, what happens on each
/// periodic tick, and how to clean up on shutdown. `run` should return quickly;
/// long exchanges belong in tasks spawned by the runnable.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// The type of task this runnable processes.
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called periodically (on each tick interval). Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Generic background worker that processes tasks via an unbounded mpsc channel.
///
/// The worker spawns a tokio task that:
/// 1. Listens for tasks on the channel
/// 2. Calls `BackgroundRunnable::run()` for each task
/// 3. Periodically calls `BackgroundRunnable::on_tick()` at the configured interval
/// 4. Calls `BackgroundRunnable::shutdown()` when stopped
///
/// Tasks still queued when the worker stops are dropped unprocessed.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: mpsc::UnboundedSender<R::Task>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Start the background worker with the given runnable and tick interval.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<R::Task>();
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut tick_interval = tokio::time::interval(tick_interval);
            tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the first immediate tick so on_tick doesn't fire at startup.
            tick_interval.tick().await;

            loop {
                tokio::select! {
                    () = stopped.cancelled() => break,
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break, // Channel closed.
                        }
                    }
                    _ = tick_interval.tick() => {
                        runnable.on_tick().await;
                    }
                }
            }

            rx.close();
            runnable.shutdown().await;
        });

        Self {
            tx,
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Submit a task to the worker.
    ///
    /// # Errors
    ///
    /// Returns `CommError::PoolStopped` if the worker has been stopped; the
    /// task is dropped in that case.
    pub fn submit(&self, task: R::Task) -> Result<(), CommError> {
        if self.cancel.is_cancelled() {
            return Err(CommError::PoolStopped);
        }
        self.tx.send(task).map_err(|_| CommError::PoolStopped)
    }

    /// Returns `true` until `stop` has been called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop the worker, waiting for the worker task to complete. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
