//! Operation registry: operation id -> current result, plus wildcard matching.
//!
//! All entries live behind one mutex paired with a "something received"
//! [`Notify`]. Completions update an entry under the lock and then either hand
//! it to the caller's callback (removing it) or wake every waiter so they can
//! re-scan. `wait` arms its notification *before* scanning, so a completion
//! between the scan and the suspension is never lost.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use clustercomm_core::{
    shard_matches, Answer, CoordTransactionId, OperationId, OperationResult, OperationStatus,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CommError;
use crate::transport::Delivery;

/// Continuation invoked exactly once with the finalized operation.
pub type ResponseCallback = Box<dyn FnOnce(OperationResult) + Send + 'static>;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

struct Entry {
    result: OperationResult,
    /// Worker holding the in-flight request, for aborts on drop.
    worker: Option<usize>,
    /// Present when the caller asked to be called back instead of polling.
    callback: Option<ResponseCallback>,
}

impl Entry {
    fn matches(&self, coord: CoordTransactionId, shard_id: &str) -> bool {
        coord.matches(self.result.coord_transaction_id)
            && shard_matches(shard_id, &self.result.shard_id)
    }
}

/// Outcome of one registry scan inside `wait`.
enum Lookup {
    Ready(OperationResult),
    Pending,
    Missing,
}

/// A non-terminal operation removed by `drop_matching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DroppedOperation {
    pub operation_id: OperationId,
    pub worker: Option<usize>,
}

// ---------------------------------------------------------------------------
// OperationRegistry
// ---------------------------------------------------------------------------

/// Thread-safe table of live operations.
pub struct OperationRegistry {
    entries: Mutex<HashMap<OperationId, Entry>>,
    received: Notify,
    poll_interval: Duration,
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("entries", &self.len())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl OperationRegistry {
    /// Creates an empty registry. `poll_interval` bounds each suspension of a
    /// `wait` called with a zero timeout.
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            received: Notify::new(),
            poll_interval,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registers an operation, replacing any stale entry with the same id.
    ///
    /// An already-terminal result (e.g. a resolution failure) wakes waiters
    /// immediately.
    pub fn insert(
        &self,
        result: OperationResult,
        worker: Option<usize>,
        callback: Option<ResponseCallback>,
    ) {
        let terminal = result.is_terminal();
        let replaced = {
            let mut entries = self.entries.lock();
            let replaced = entries.remove(&result.operation_id).is_some();
            entries.insert(
                result.operation_id,
                Entry {
                    result,
                    worker,
                    callback,
                },
            );
            replaced
        };
        if !replaced {
            metrics::gauge!("clustercomm_outstanding_operations").increment(1.0);
        }
        if terminal {
            self.received.notify_waiters();
        }
    }

    /// Moves a queued operation to `Sending`.
    ///
    /// Returns `false` if the operation was dropped while queued; the caller
    /// must then not send it.
    pub fn begin_send(&self, operation_id: OperationId) -> bool {
        let mut entries = self.entries.lock();
        match entries.get_mut(&operation_id) {
            Some(entry) if !entry.result.is_terminal() => {
                if entry.result.status == OperationStatus::Submitted {
                    entry.result.status = OperationStatus::Sending;
                }
                true
            }
            _ => false,
        }
    }

    /// Moves a `Sending` operation to `Sent`.
    pub fn mark_sent(&self, operation_id: OperationId) {
        if let Some(entry) = self.entries.lock().get_mut(&operation_id) {
            if entry.result.status == OperationStatus::Sending {
                entry.result.status = OperationStatus::Sent;
                entry.result.send_was_complete = true;
            }
        }
    }

    /// Applies a transport outcome to a tracked operation.
    ///
    /// Outcomes for dropped or already-terminal operations are discarded. For
    /// operations expecting an asynchronous answer, a 2xx reply is only an
    /// acknowledgment and leaves the operation `Sent`.
    pub fn complete(&self, operation_id: OperationId, delivery: Delivery) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&operation_id) else {
            debug!(%operation_id, "discarding reply for dropped operation");
            return;
        };
        if entry.result.is_terminal() {
            debug!(%operation_id, "discarding second reply for finished operation");
            return;
        }

        if !entry.result.single {
            if let Ok(ack) = &delivery.outcome {
                if ack.is_success() {
                    entry.result.status = OperationStatus::Sent;
                    entry.result.send_was_complete = true;
                    return;
                }
            }
        }

        delivery.apply_to(&mut entry.result);
        self.finish(entries, operation_id);
    }

    /// Completes an operation with an asynchronous answer from a data server.
    ///
    /// # Errors
    ///
    /// Returns `CommError::UnknownOperation` when no live, non-terminal
    /// operation with this id and coordinator transaction exists.
    pub fn answer(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        answer: Answer,
    ) -> Result<(), CommError> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&operation_id) {
            Some(entry)
                if !entry.result.is_terminal()
                    && coord.matches(entry.result.coord_transaction_id) =>
            {
                entry.result.receive(answer);
            }
            _ => return Err(CommError::UnknownOperation { operation_id }),
        }
        self.finish(entries, operation_id);
        Ok(())
    }

    /// Hands a just-finalized entry to its callback, or wakes waiters.
    fn finish(
        &self,
        mut entries: parking_lot::MutexGuard<'_, HashMap<OperationId, Entry>>,
        operation_id: OperationId,
    ) {
        let has_callback = entries
            .get(&operation_id)
            .is_some_and(|entry| entry.callback.is_some());
        if !has_callback {
            drop(entries);
            self.received.notify_waiters();
            return;
        }

        let removed = entries.remove(&operation_id);
        drop(entries);
        if let Some(Entry {
            result,
            callback: Some(callback),
            ..
        }) = removed
        {
            metrics::gauge!("clustercomm_outstanding_operations").decrement(1.0);
            callback(result);
        }
    }

    /// Non-blocking snapshot of an operation; `Dropped` if it is not tracked.
    #[must_use]
    pub fn enquire(&self, operation_id: OperationId) -> OperationResult {
        self.entries.lock().get(&operation_id).map_or_else(
            || OperationResult::dropped(operation_id, CoordTransactionId::ANY, ""),
            |entry| entry.result.clone(),
        )
    }

    /// Waits for a terminal operation and removes it from the registry.
    ///
    /// With a non-zero `operation_id` only that operation is considered.
    /// Otherwise the first terminal entry matching `(coord, shard_id)` is
    /// returned, where `CoordTransactionId::ANY` and `""` match anything.
    /// Entries owned by a callback are invisible to wildcard matching.
    ///
    /// - no matching entry: returns `Dropped` immediately
    /// - a match stays non-terminal until the deadline: returns `Timeout` and
    ///   leaves the entry in place
    /// - `timeout == 0` waits indefinitely, re-checking every poll interval
    pub async fn wait(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
        timeout: Duration,
    ) -> OperationResult {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            let notified = self.received.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take_ready(coord, operation_id, shard_id) {
                Lookup::Ready(result) => return result,
                Lookup::Missing => {
                    return OperationResult::dropped(operation_id, coord, shard_id);
                }
                Lookup::Pending => {}
            }

            let budget = match deadline {
                None => self.poll_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return self.timed_out(coord, operation_id, shard_id);
                    }
                    deadline - now
                }
            };
            // Either a completion or the budget running out triggers a re-scan.
            let _ = tokio::time::timeout(budget, notified).await;
        }
    }

    /// Scans and, for a terminal match, erases under one critical section.
    fn take_ready(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
    ) -> Lookup {
        let mut entries = self.entries.lock();

        let ready_id = if operation_id.is_any() {
            let mut pending = false;
            let mut ready: Option<OperationId> = None;
            for (id, entry) in entries.iter() {
                if entry.callback.is_some() || !entry.matches(coord, shard_id) {
                    continue;
                }
                if entry.result.is_terminal() {
                    ready = Some(ready.map_or(*id, |current| current.min(*id)));
                } else {
                    pending = true;
                }
            }
            match ready {
                Some(id) => id,
                None if pending => return Lookup::Pending,
                None => return Lookup::Missing,
            }
        } else {
            match entries.get(&operation_id) {
                Some(entry) if entry.result.is_terminal() => operation_id,
                Some(_) => return Lookup::Pending,
                None => return Lookup::Missing,
            }
        };

        match entries.remove(&ready_id) {
            Some(entry) => {
                metrics::gauge!("clustercomm_outstanding_operations").decrement(1.0);
                Lookup::Ready(entry.result)
            }
            None => Lookup::Missing,
        }
    }

    fn timed_out(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
    ) -> OperationResult {
        let mut result = if operation_id.is_any() {
            let mut result = OperationResult::new(operation_id, coord);
            result.shard_id = shard_id.to_string();
            result
        } else {
            self.entries.lock().get(&operation_id).map_or_else(
                || OperationResult::new(operation_id, coord),
                |entry| entry.result.clone(),
            )
        };
        result.status = OperationStatus::Timeout;
        result.answer = None;
        result
    }

    /// Removes every entry matching the filter, terminal or not.
    ///
    /// Callbacks of removed entries are discarded without being invoked.
    /// Returns the non-terminal operations so their in-flight requests can be
    /// aborted; replies arriving for them later are discarded by `complete`.
    pub fn drop_matching(
        &self,
        coord: CoordTransactionId,
        operation_id: OperationId,
        shard_id: &str,
    ) -> Vec<DroppedOperation> {
        let removed: Vec<Entry> = {
            let mut entries = self.entries.lock();
            if operation_id.is_any() {
                let ids: Vec<OperationId> = entries
                    .iter()
                    .filter(|(_, entry)| entry.matches(coord, shard_id))
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| entries.remove(&id))
                    .collect()
            } else {
                entries.remove(&operation_id).into_iter().collect()
            }
        };

        if !removed.is_empty() {
            #[allow(clippy::cast_precision_loss)]
            metrics::gauge!("clustercomm_outstanding_operations").decrement(removed.len() as f64);
            debug!(%coord, %operation_id, shard_id, count = removed.len(), "dropped operations");
        }

        removed
            .into_iter()
            .filter(|entry| !entry.result.is_terminal())
            .map(|entry| DroppedOperation {
                operation_id: entry.result.operation_id,
                worker: entry.worker,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
