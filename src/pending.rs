//! Pending-call registry: correlation ids and in-flight request futures.
//!
//! Single-resolution invariant: the map entry is the claim. Whichever path
//! removes the entry first (matching response, write failure, timeout
//! eviction, teardown) delivers the terminal result; every later path finds
//! the entry gone and discards its outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::SessionError;

const DEFAULT_MAX_PENDING: usize = 8192;

fn max_pending() -> usize {
    std::env::var("BACKHAUL_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

pub(crate) type CallResult = Result<Bytes, SessionError>;

type EntryMap = Arc<Mutex<HashMap<u32, oneshot::Sender<CallResult>>>>;

/// Registry of in-flight request/response calls keyed by correlation id.
pub struct PendingCalls {
    entries: EntryMap,
    next_id: AtomicU32,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
        }
    }

    /// Number of calls currently awaiting a response.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Allocate a fresh correlation id and register a waiter with a deadline.
    ///
    /// The counter wraps; id 0 and ids still in flight are skipped so an
    /// outstanding call is never aliased. A sleeper task races the response:
    /// if it removes the entry first, the call fails with [`SessionError::Timeout`]
    /// and a later response for the id is discarded.
    pub(crate) fn register(
        &self,
        timeout: Duration,
    ) -> Result<(u32, oneshot::Receiver<CallResult>), SessionError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut entries = self.entries.lock();
            let max = max_pending();
            if entries.len() >= max {
                tracing::warn!(
                    pending = entries.len(),
                    max_pending = max,
                    "too many pending calls; refusing new call"
                );
                return Err(SessionError::ResourceExhausted("pending calls"));
            }
            let id = loop {
                let candidate = self.next_id.fetch_add(1, Ordering::Relaxed);
                if candidate != 0 && !entries.contains_key(&candidate) {
                    break candidate;
                }
            };
            entries.insert(id, tx);
            id
        };

        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = entries.lock().remove(&id) {
                tracing::debug!(
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out; evicting"
                );
                let _ = tx.send(Err(SessionError::Timeout));
            }
        });

        Ok((id, rx))
    }

    /// Complete the waiter for `id` with a response payload.
    ///
    /// Unmatched ids (evicted after timeout, or never issued on this
    /// connection) are logged and dropped; a late response is not an error.
    pub(crate) fn resolve(&self, id: u32, payload: Bytes) {
        match self.entries.lock().remove(&id) {
            Some(tx) => {
                tracing::debug!(id, payload_len = payload.len(), "response delivered");
                let _ = tx.send(Ok(payload));
            }
            None => tracing::debug!(id, "response for unknown or evicted call id; dropping"),
        }
    }

    /// Remove a waiter without delivering a result. Used when the caller
    /// still owns the receiver and surfaces the failure itself.
    pub(crate) fn evict(&self, id: u32) {
        self.entries.lock().remove(&id);
    }

    /// Fail every outstanding call. Connection teardown path.
    pub(crate) fn fail_all(&self, cause: &'static str) {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), cause, "failing all pending calls");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(SessionError::ConnectionClosed(cause)));
        }
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
