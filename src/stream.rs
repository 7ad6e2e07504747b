//! Stream multiplexer: logical sub-channels over the shared connection.
//!
//! Each channel is identified by a stream id unique while the stream is open.
//! Local opens go through a create handshake (`StreamCreate` answered by
//! `StreamCreateSuccess` or `StreamCreateFail`); remote opens are offered to
//! the message listener for accept/reject. Inbound payloads for one stream
//! arrive at its sink in connection order; there is no ordering across
//! streams.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::SessionError;
use crate::session::Session;

/// Buffered payloads per stream before inbound delivery applies backpressure.
const STREAM_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    /// Create sent, waiting for the remote verdict.
    Opening,
    /// Handshake complete; payloads flow.
    Open,
}

/// A tracked channel. Closed channels are not represented: removal from the
/// table is the closed state, which also frees the id for reuse.
struct StreamEntry {
    phase: StreamPhase,
    data_tx: mpsc::Sender<Bytes>,
    ready_tx: Option<oneshot::Sender<Result<(), SessionError>>>,
}

/// Id allocation and routing tables for multiplexed stream channels.
pub struct StreamMultiplexer {
    streams: Mutex<HashMap<u32, StreamEntry>>,
    next_stream_id: AtomicU32,
}

impl StreamMultiplexer {
    /// `start_id` sets the first locally-allocated id. Peers sharing a
    /// connection should start at different parities (the counter steps by
    /// 2) so their locally-opened streams never collide.
    pub fn new(start_id: u32) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(start_id),
        }
    }

    /// Number of tracked streams (opening or open).
    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    pub(crate) fn is_open(&self, stream_id: u32) -> bool {
        self.streams
            .lock()
            .get(&stream_id)
            .is_some_and(|entry| entry.phase == StreamPhase::Open)
    }

    /// Allocate a stream id and track a channel in the opening phase.
    ///
    /// Returns the id, the handshake receiver, and the data receiver.
    pub(crate) fn open_local(
        &self,
    ) -> (
        u32,
        oneshot::Receiver<Result<(), SessionError>>,
        mpsc::Receiver<Bytes>,
    ) {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        let mut streams = self.streams.lock();
        let stream_id = loop {
            let candidate = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
            if candidate != 0 && !streams.contains_key(&candidate) {
                break candidate;
            }
        };
        streams.insert(
            stream_id,
            StreamEntry {
                phase: StreamPhase::Opening,
                data_tx,
                ready_tx: Some(ready_tx),
            },
        );
        (stream_id, ready_rx, data_rx)
    }

    /// Track an accepted remote-initiated stream, already open.
    ///
    /// Returns `None` when the id is in use; the caller rejects the create
    /// and leaves the existing stream untouched.
    pub(crate) fn register_remote(&self, stream_id: u32) -> Option<mpsc::Receiver<Bytes>> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&stream_id) {
            return None;
        }
        let (data_tx, data_rx) = mpsc::channel(STREAM_BUFFER);
        streams.insert(
            stream_id,
            StreamEntry {
                phase: StreamPhase::Open,
                data_tx,
                ready_tx: None,
            },
        );
        Some(data_rx)
    }

    /// Remote accepted a local open.
    pub(crate) fn created(&self, stream_id: u32) {
        let mut streams = self.streams.lock();
        match streams.get_mut(&stream_id) {
            Some(entry) if entry.phase == StreamPhase::Opening => {
                entry.phase = StreamPhase::Open;
                if let Some(tx) = entry.ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
                tracing::debug!(stream_id, "stream open");
            }
            _ => tracing::warn!(stream_id, "create-success for unknown or open stream; dropping"),
        }
    }

    /// Remote rejected a local open; the channel is discarded.
    pub(crate) fn create_failed(&self, stream_id: u32, reason: String) {
        match self.streams.lock().remove(&stream_id) {
            Some(entry) => {
                tracing::debug!(stream_id, reason = %reason, "stream create rejected by remote");
                if let Some(tx) = entry.ready_tx {
                    let _ = tx.send(Err(SessionError::StreamRejected(reason)));
                }
            }
            None => tracing::warn!(stream_id, "create-fail for unknown stream; dropping"),
        }
    }

    /// Route an inbound payload to the stream's sink, preserving arrival
    /// order. Unknown stream ids are logged and dropped.
    pub(crate) async fn deliver(&self, stream_id: u32, payload: Bytes) {
        let tx = {
            let streams = self.streams.lock();
            match streams.get(&stream_id) {
                Some(entry) if entry.phase == StreamPhase::Open => Some(entry.data_tx.clone()),
                Some(_) => {
                    tracing::warn!(stream_id, "payload before create handshake finished; dropping");
                    None
                }
                None => {
                    tracing::debug!(stream_id, "payload for unknown stream; dropping");
                    None
                }
            }
        };
        if let Some(tx) = tx {
            // Backpressure on a full sink; the receiver being gone means the
            // handle was dropped, so the channel goes with it.
            if tx.send(payload).await.is_err() {
                self.streams.lock().remove(&stream_id);
                tracing::debug!(stream_id, "stream receiver dropped; removing channel");
            }
        }
    }

    /// Drop the channel. Idempotent; returns whether it was still tracked.
    pub(crate) fn close(&self, stream_id: u32) -> bool {
        self.streams.lock().remove(&stream_id).is_some()
    }

    /// Tear down every tracked stream. Connection teardown path.
    pub(crate) fn close_all(&self, cause: &'static str) {
        let drained: Vec<_> = self.streams.lock().drain().collect();
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), cause, "closing all streams");
        }
        for (_, entry) in drained {
            if let Some(tx) = entry.ready_tx {
                let _ = tx.send(Err(SessionError::ConnectionClosed(cause)));
            }
            // data_tx drops here; sinks observe end-of-stream.
        }
    }
}

/// Caller-facing handle for a locally-opened stream channel.
///
/// Receiving yields payloads in connection arrival order and ends with
/// `None` once the stream is closed from either side. Dropping the handle
/// without [`StreamHandle::close`] releases the channel and best-effort
/// notifies the peer.
pub struct StreamHandle {
    stream_id: u32,
    session: Arc<Session>,
    rx: mpsc::Receiver<Bytes>,
    closed: bool,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl StreamHandle {
    pub(crate) fn new(session: Arc<Session>, stream_id: u32, rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            stream_id,
            session,
            rx,
            closed: false,
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Next inbound payload. `None` after the stream is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Send a payload on this stream.
    pub async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        self.session.send_stream_payload(self.stream_id, payload).await
    }

    /// Close the stream: notifies the peer and releases the channel.
    /// Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session.close_stream(self.stream_id).await
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        tracing::debug!(stream_id = self.stream_id, "stream handle dropped without close");
        let session = Arc::clone(&self.session);
        let stream_id = self.stream_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = session.close_stream(stream_id).await;
            });
        }
    }
}
