//! Session handler: owns the connection and dispatches both directions.
//!
//! The session is the single owner of the underlying transport. Outbound
//! calls flow through it into the pending-call registry or the stream
//! multiplexer; inbound packets are received by exactly one demux task per
//! attached transport and routed by packet type.
//!
//! # Key invariant
//!
//! Only the demux task calls `recv_packet`. Inbound processing for one
//! connection is strictly sequential, which is what keeps per-stream
//! ordering and single-resolution intact without locking in the hot path.
//! The registry and multiplexer tables still take a lock because
//! registration happens on caller tasks while resolution happens on the
//! demux task.
//!
//! # Usage
//!
//! ```ignore
//! let (transport, _peer) = Transport::mem_pair();
//! let session = Arc::new(Session::new(transport, "collector.example:9994"));
//! session.open()?;
//!
//! let response = session.request(Bytes::from_static(b"ping")).await?;
//!
//! let mut stream = session.open_stream(Bytes::new()).await?;
//! while let Some(chunk) = stream.recv().await { /* ... */ }
//!
//! session.close().await;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::listener::{LoggingListener, MessageListener};
use crate::packet::Packet;
use crate::pending::PendingCalls;
use crate::reconnect::{NoReconnect, Reconnector};
use crate::state::{SessionState, StateCell};
use crate::stream::{StreamHandle, StreamMultiplexer};
use crate::transport::Transport;
use crate::{SessionError, TransportError};

const DEFAULT_TIMEOUT_MS: u64 = 3_000;

fn default_request_timeout() -> Duration {
    let ms = std::env::var("BACKHAUL_REQUEST_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_TIMEOUT_MS);
    Duration::from_millis(ms)
}

/// Tunable bounds for the session's waits. Every wait in the public
/// contract is bounded by one of these.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Default bound for `request`; override per call with
    /// [`Session::request_with_timeout`].
    pub request_timeout: Duration,
    /// Bound for `send_sync` write completion.
    pub write_timeout: Duration,
    /// Bound for the stream create handshake.
    pub stream_open_timeout: Duration,
    /// First locally-allocated stream id. Peers sharing a connection should
    /// use different parities (1 and 2) so their opens never collide.
    pub stream_id_start: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            write_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream_open_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream_id_start: 1,
        }
    }
}

/// Write-completion handle returned by [`Session::send_async`].
///
/// An interrupted or abandoned wait is inconclusive: the write may still
/// complete afterwards. Probe with [`WriteHandle::try_result`] before
/// assuming failure.
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl WriteHandle {
    /// Wait for the write to complete.
    pub async fn wait(self) -> Result<(), SessionError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionClosed("write task dropped")),
        }
    }

    /// Non-blocking probe for a completed write.
    pub fn try_result(&mut self) -> Option<Result<(), SessionError>> {
        self.rx.try_recv().ok()
    }
}

/// A multiplexed RPC session over a single long-lived connection.
///
/// Owns one pending-call registry, one stream multiplexer, and one
/// connection state cell; all traffic for the connection flows through it.
pub struct Session {
    transport: Mutex<Transport>,
    state: StateCell,
    pending: PendingCalls,
    streams: StreamMultiplexer,
    listener: Mutex<Arc<dyn MessageListener>>,
    reconnector: Mutex<Arc<dyn Reconnector>>,
    /// Handed to the reconnector on unexpected closure.
    peer_address: String,
    /// Bumped on every attach. A demux loop for a replaced transport sees a
    /// stale generation and stands down instead of re-running closure
    /// handling.
    attach_generation: AtomicU64,
    /// Peer sent the close handshake; the next closure is graceful.
    peer_closed: AtomicBool,
    config: SessionConfig,
}

impl Session {
    pub fn new(transport: Transport, peer_address: impl Into<String>) -> Self {
        Self::with_config(transport, peer_address, SessionConfig::default())
    }

    pub fn with_config(
        transport: Transport,
        peer_address: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            state: StateCell::new(),
            pending: PendingCalls::new(),
            streams: StreamMultiplexer::new(config.stream_id_start),
            listener: Mutex::new(Arc::new(LoggingListener)),
            reconnector: Mutex::new(Arc::new(NoReconnect)),
            peer_address: peer_address.into(),
            attach_generation: AtomicU64::new(0),
            peer_closed: AtomicBool::new(false),
            config,
        }
    }

    /// Replace the inbound message listener. Takes effect for packets
    /// dispatched after the call.
    pub fn set_listener(&self, listener: Arc<dyn MessageListener>) {
        *self.listener.lock() = listener;
    }

    /// Replace the reconnection hook.
    pub fn set_reconnector(&self, reconnector: Arc<dyn Reconnector>) {
        *self.reconnector.lock() = reconnector;
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Calls currently awaiting a response. Diagnostics.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Streams currently opening or open. Diagnostics.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Attach to the transport and start the demux task. INIT -> RUN only.
    pub fn open(self: &Arc<Self>) -> Result<(), SessionError> {
        if !self.state.open() {
            return Err(SessionError::InvalidState(self.state.get()));
        }
        tracing::debug!(address = %self.peer_address, "session open");
        self.spawn_demux();
        Ok(())
    }

    /// Re-attach a fresh transport after a reconnect. RECONNECT -> RUN only.
    pub fn reattach(self: &Arc<Self>, transport: Transport) -> Result<(), SessionError> {
        {
            let mut slot = self.transport.lock();
            if !self.state.reconnect_to_run() {
                return Err(SessionError::InvalidState(self.state.get()));
            }
            *slot = transport;
        }
        tracing::info!(address = %self.peer_address, "reconnected");
        self.spawn_demux();
        Ok(())
    }

    /// Close the session: handshake packet best-effort, fail every pending
    /// call, close every stream, shut the transport. Returns `false` when
    /// the session was not running or reconnecting (second close is a
    /// no-op).
    pub async fn close(&self) -> bool {
        if !self.state.close() {
            tracing::debug!(state = %self.state.get(), "close is a no-op");
            return false;
        }
        tracing::debug!(address = %self.peer_address, "closing session");

        let transport = self.transport.lock().clone();
        if let Err(e) = transport.send_packet(Packet::Close).await {
            tracing::debug!(error = %e, "close handshake write failed");
        }
        self.teardown("session closed");
        transport.close();
        true
    }

    // ========================================================================
    // Outbound API
    // ========================================================================

    /// Fire-and-forget send.
    pub async fn send(&self, payload: Bytes) -> Result<(), SessionError> {
        let transport = self.ensure_run()?;
        transport
            .send_packet(Packet::Send { payload })
            .await
            .map_err(SessionError::WriteFailure)
    }

    /// Fire-and-forget send returning a write-completion handle.
    pub fn send_async(&self, payload: Bytes) -> Result<WriteHandle, SessionError> {
        let transport = self.ensure_run()?;
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = transport
                .send_packet(Packet::Send { payload })
                .await
                .map_err(SessionError::WriteFailure);
            let _ = tx.send(result);
        });
        Ok(WriteHandle { rx })
    }

    /// Send and wait for the write to complete, bounded by the configured
    /// write timeout.
    pub async fn send_sync(&self, payload: Bytes) -> Result<(), SessionError> {
        self.send_sync_with_timeout(payload, self.config.write_timeout)
            .await
    }

    /// Send and wait for the write to complete, bounded by `timeout`.
    pub async fn send_sync_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let transport = self.ensure_run()?;
        match tokio::time::timeout(timeout, transport.send_packet(Packet::Send { payload })).await
        {
            Ok(result) => result.map_err(SessionError::WriteFailure),
            Err(_) => Err(SessionError::Timeout),
        }
    }

    /// Request/response with the default timeout.
    pub async fn request(&self, payload: Bytes) -> Result<Bytes, SessionError> {
        self.request_with_timeout(payload, self.config.request_timeout)
            .await
    }

    /// Request/response with a per-call timeout.
    ///
    /// Fails fast when the session is not running. A failed write fails the
    /// call immediately with the write's cause instead of waiting out the
    /// timeout.
    pub async fn request_with_timeout(
        &self,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, SessionError> {
        struct PendingGuard<'a> {
            pending: &'a PendingCalls,
            id: u32,
            active: bool,
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                if self.active {
                    self.pending.evict(self.id);
                }
            }
        }

        let transport = self.ensure_run()?;
        let (id, rx) = self.pending.register(timeout)?;
        // Abandoning the wait must not leak the entry until the sleeper
        // fires.
        let mut guard = PendingGuard {
            pending: &self.pending,
            id,
            active: true,
        };

        tracing::debug!(id, payload_len = payload.len(), "request registered");
        if let Err(e) = transport.send_packet(Packet::Request { id, payload }).await {
            tracing::debug!(id, error = %e, "request write failed");
            return Err(SessionError::WriteFailure(e));
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionClosed("registry dropped")),
        };
        guard.active = false;
        result
    }

    /// Open a multiplexed stream channel; waits (bounded) for the remote
    /// verdict on the create handshake.
    pub async fn open_stream(self: &Arc<Self>, payload: Bytes) -> Result<StreamHandle, SessionError> {
        let transport = self.ensure_run()?;
        let (stream_id, ready_rx, data_rx) = self.streams.open_local();

        tracing::debug!(stream_id, "stream create");
        if let Err(e) = transport
            .send_packet(Packet::StreamCreate { stream_id, payload })
            .await
        {
            self.streams.close(stream_id);
            return Err(SessionError::WriteFailure(e));
        }

        match tokio::time::timeout(self.config.stream_open_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => Ok(StreamHandle::new(Arc::clone(self), stream_id, data_rx)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(SessionError::ConnectionClosed("handshake dropped")),
            Err(_) => {
                self.streams.close(stream_id);
                tracing::debug!(stream_id, "stream create handshake timed out");
                Err(SessionError::Timeout)
            }
        }
    }

    pub(crate) async fn send_stream_payload(
        &self,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<(), SessionError> {
        let transport = self.ensure_run()?;
        if !self.streams.is_open(stream_id) {
            return Err(SessionError::StreamClosed(stream_id));
        }
        transport
            .send_packet(Packet::StreamResponse { stream_id, payload })
            .await
            .map_err(SessionError::WriteFailure)
    }

    pub(crate) async fn close_stream(&self, stream_id: u32) -> Result<(), SessionError> {
        if !self.streams.close(stream_id) {
            return Ok(());
        }
        tracing::debug!(stream_id, "stream close");
        if self.state.is_run() {
            self.write_packet(Packet::StreamClose { stream_id }).await?;
        }
        Ok(())
    }

    /// Snapshot the live transport, refusing unless the session is running.
    fn ensure_run(&self) -> Result<Transport, SessionError> {
        let slot = self.transport.lock();
        let state = self.state.get();
        if state != SessionState::Run {
            return Err(SessionError::InvalidState(state));
        }
        Ok(slot.clone())
    }

    /// Write without the state gate. Dispatch paths (responses, stream
    /// verdicts) use this so replies still go out while teardown races in.
    async fn write_packet(&self, packet: Packet) -> Result<(), SessionError> {
        let transport = self.transport.lock().clone();
        transport
            .send_packet(packet)
            .await
            .map_err(SessionError::WriteFailure)
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    fn spawn_demux(self: &Arc<Self>) {
        let generation = self.attach_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let transport = self.transport.lock().clone();
        let session = Arc::clone(self);
        tokio::spawn(async move { session.demux(transport, generation).await });
    }

    fn current_generation(&self) -> u64 {
        self.attach_generation.load(Ordering::Acquire)
    }

    async fn demux(self: Arc<Self>, transport: Transport, generation: u64) {
        tracing::debug!(generation, "demux loop started");
        loop {
            match transport.recv_packet().await {
                Ok(packet) => self.dispatch(packet).await,
                Err(TransportError::Closed) => {
                    self.handle_closure(generation);
                    return;
                }
                Err(e) => {
                    self.handle_fatal(e, generation);
                    return;
                }
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, packet: Packet) {
        match packet {
            Packet::Send { payload } => {
                let listener = self.listener.lock().clone();
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| listener.handle_send(payload)))
                {
                    tracing::warn!("listener panicked in handle_send: {}", panic_message(&panic));
                }
            }
            Packet::Request { id, payload } => self.dispatch_request(id, payload),
            Packet::Response { id, payload } => self.pending.resolve(id, payload),
            Packet::StreamCreate { stream_id, payload } => {
                self.dispatch_stream_create(stream_id, payload).await;
            }
            Packet::StreamCreateSuccess { stream_id } => self.streams.created(stream_id),
            Packet::StreamCreateFail { stream_id, reason } => {
                self.streams.create_failed(stream_id, reason);
            }
            Packet::StreamResponse { stream_id, payload } => {
                self.streams.deliver(stream_id, payload).await;
            }
            Packet::StreamClose { stream_id } => {
                if self.streams.close(stream_id) {
                    tracing::debug!(stream_id, "stream closed by remote");
                } else {
                    tracing::debug!(stream_id, "close for unknown stream; dropping");
                }
            }
            Packet::Close => {
                tracing::debug!(address = %self.peer_address, "peer announced close handshake");
                self.peer_closed.store(true, Ordering::Release);
            }
        }
    }

    /// Requests run on their own task so a slow or panicking handler cannot
    /// stall the demux loop.
    fn dispatch_request(self: &Arc<Self>, id: u32, payload: Bytes) {
        let listener = self.listener.lock().clone();
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener.handle_request(payload)));
            match outcome {
                Ok(Some(response)) => {
                    if let Err(e) = session
                        .write_packet(Packet::Response {
                            id,
                            payload: response,
                        })
                        .await
                    {
                        tracing::warn!(id, error = %e, "failed to write response");
                    }
                }
                Ok(None) => {
                    tracing::warn!(id, "request produced no response; peer will time out");
                }
                Err(panic) => {
                    tracing::warn!(
                        id,
                        "listener panicked in handle_request: {}",
                        panic_message(&panic)
                    );
                }
            }
        });
    }

    async fn dispatch_stream_create(self: &Arc<Self>, stream_id: u32, payload: Bytes) {
        let listener = self.listener.lock().clone();
        let verdict = std::panic::catch_unwind(AssertUnwindSafe(|| {
            listener.handle_stream_create(stream_id, payload)
        }))
        .unwrap_or_else(|panic| {
            tracing::warn!(
                stream_id,
                "listener panicked in handle_stream_create: {}",
                panic_message(&panic)
            );
            Err("listener failed".to_string())
        });

        let reply = match verdict {
            Ok(()) => match self.streams.register_remote(stream_id) {
                Some(data_rx) => {
                    self.spawn_stream_pump(stream_id, data_rx, listener);
                    Packet::StreamCreateSuccess { stream_id }
                }
                None => {
                    // Duplicate id. Refuse, leave the existing stream alone.
                    tracing::warn!(stream_id, "stream create for an id already in use");
                    Packet::StreamCreateFail {
                        stream_id,
                        reason: "stream id already in use".to_string(),
                    }
                }
            },
            Err(reason) => {
                tracing::debug!(stream_id, reason = %reason, "stream create rejected");
                Packet::StreamCreateFail { stream_id, reason }
            }
        };

        if let Err(e) = self.write_packet(reply).await {
            tracing::warn!(stream_id, error = %e, "failed to answer stream create");
        }
    }

    /// One pump task per accepted remote stream keeps listener delivery in
    /// arrival order.
    fn spawn_stream_pump(
        &self,
        stream_id: u32,
        mut data_rx: tokio::sync::mpsc::Receiver<Bytes>,
        listener: Arc<dyn MessageListener>,
    ) {
        tokio::spawn(async move {
            while let Some(payload) = data_rx.recv().await {
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    listener.handle_stream_data(stream_id, payload)
                })) {
                    tracing::warn!(
                        stream_id,
                        "listener panicked in handle_stream_data: {}",
                        panic_message(&panic)
                    );
                }
            }
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener.handle_stream_close(stream_id)
            })) {
                tracing::warn!(
                    stream_id,
                    "listener panicked in handle_stream_close: {}",
                    panic_message(&panic)
                );
            }
        });
    }

    // ========================================================================
    // Closure handling
    // ========================================================================

    fn handle_closure(self: &Arc<Self>, generation: u64) {
        if generation != self.current_generation() {
            tracing::debug!(generation, "stale demux loop observed closure; ignoring");
            return;
        }
        match self.state.get() {
            SessionState::Closed => {
                tracing::debug!("connection closed after local close");
            }
            SessionState::Reconnect => {
                tracing::debug!("closure while already reconnecting");
            }
            SessionState::Init => {}
            SessionState::Run => {
                if self.peer_closed.load(Ordering::Acquire) {
                    // The peer said goodbye first: graceful shutdown, not a
                    // failure.
                    if self.state.close() {
                        tracing::info!(address = %self.peer_address, "peer closed the connection");
                        self.teardown("peer closed");
                    }
                } else if self.state.run_to_reconnect() {
                    tracing::info!(
                        address = %self.peer_address,
                        "unexpected closure; entering reconnect"
                    );
                    self.teardown("unexpected closure");
                    let reconnector = self.reconnector.lock().clone();
                    reconnector.reconnect(Arc::clone(self), &self.peer_address);
                }
                // A lost CAS means close() or another closure got there
                // first; nothing left to do.
            }
        }
    }

    fn handle_fatal(self: &Arc<Self>, error: TransportError, generation: u64) {
        if generation != self.current_generation() {
            tracing::debug!(generation, "stale demux loop observed an error; ignoring");
            return;
        }
        tracing::error!(error = %error, "fatal transport error; closing session");
        self.state.force_closed();
        let transport = self.transport.lock().clone();
        if !transport.is_closed() {
            transport.close();
        }
        self.teardown("transport failure");
    }

    fn teardown(&self, cause: &'static str) {
        self.pending.fail_all(cause);
        self.streams.close_all(cause);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
