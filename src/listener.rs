//! Pluggable handling for inbound application traffic.

use bytes::Bytes;

/// Collaborator invoked by the dispatcher for each classified inbound
/// packet.
///
/// Implementations run on dispatcher tasks and should not block for long.
/// `handle_request` returning `None` produces no response packet; the
/// remote call will run into its timeout.
pub trait MessageListener: Send + Sync {
    /// Fire-and-forget message.
    fn handle_send(&self, payload: Bytes);

    /// Correlated request; the returned payload is written back as the
    /// response.
    fn handle_request(&self, payload: Bytes) -> Option<Bytes>;

    /// The remote wants to open a stream. `Ok` accepts, `Err(reason)`
    /// rejects.
    fn handle_stream_create(&self, stream_id: u32, payload: Bytes) -> Result<(), String>;

    /// Payload on an accepted remote stream, in arrival order.
    fn handle_stream_data(&self, stream_id: u32, payload: Bytes);

    /// An accepted remote stream was closed.
    fn handle_stream_close(&self, stream_id: u32);
}

/// Default listener: logs every event, answers nothing, rejects streams.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl MessageListener for LoggingListener {
    fn handle_send(&self, payload: Bytes) {
        tracing::info!(payload_len = payload.len(), "send received");
    }

    fn handle_request(&self, payload: Bytes) -> Option<Bytes> {
        tracing::info!(
            payload_len = payload.len(),
            "request received without a handler; peer will time out"
        );
        None
    }

    fn handle_stream_create(&self, stream_id: u32, payload: Bytes) -> Result<(), String> {
        tracing::info!(stream_id, payload_len = payload.len(), "stream create received");
        Err("stream not supported".to_string())
    }

    fn handle_stream_data(&self, stream_id: u32, payload: Bytes) {
        tracing::info!(stream_id, payload_len = payload.len(), "stream payload received");
    }

    fn handle_stream_close(&self, stream_id: u32) {
        tracing::info!(stream_id, "stream closed");
    }
}
