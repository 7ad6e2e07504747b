//! Reconnection hook.
//!
//! The session does not own reconnect policy (backoff schedule, retry
//! budget). It only signals that the connection was lost while running; the
//! collaborator establishes a new transport and hands it back through
//! [`Session::reattach`], or abandons the session.

use std::sync::Arc;

use crate::session::Session;

/// Connection-factory collaborator, notified exactly once per unexpected
/// closure observed while the session was running.
pub trait Reconnector: Send + Sync {
    fn reconnect(&self, session: Arc<Session>, address: &str);
}

/// Default hook: logs the loss and leaves the session in reconnect state.
#[derive(Debug, Default)]
pub struct NoReconnect;

impl Reconnector for NoReconnect {
    fn reconnect(&self, _session: Arc<Session>, address: &str) {
        tracing::warn!(address, "connection lost; no reconnector configured");
    }
}
