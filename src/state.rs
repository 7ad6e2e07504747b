//! Connection lifecycle state machine.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a session's connection.
///
/// `Closed` is terminal. `Run` and `Reconnect` may alternate as the
/// underlying connection is lost and re-established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Constructed, not yet attached to a live connection.
    Init = 0,
    /// Connection open, fully operational.
    Run = 1,
    /// Connection lost unexpectedly, reconnection in progress.
    Reconnect = 2,
    /// Terminal; no further I/O.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Init,
            1 => SessionState::Run,
            2 => SessionState::Reconnect,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "init"),
            SessionState::Run => write!(f, "run"),
            SessionState::Reconnect => write!(f, "reconnect"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Atomic state cell guarding all session I/O.
///
/// Every transition is compare-and-set: a transition whose precondition no
/// longer holds returns `false` and changes nothing.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(SessionState::Init as u8))
    }

    pub(crate) fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn is_run(&self) -> bool {
        self.get() == SessionState::Run
    }

    fn cas(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// INIT -> RUN.
    pub(crate) fn open(&self) -> bool {
        self.cas(SessionState::Init, SessionState::Run)
    }

    /// RUN -> RECONNECT, on unexpected closure.
    pub(crate) fn run_to_reconnect(&self) -> bool {
        self.cas(SessionState::Run, SessionState::Reconnect)
    }

    /// RECONNECT -> RUN, on successful reconnection.
    pub(crate) fn reconnect_to_run(&self) -> bool {
        self.cas(SessionState::Reconnect, SessionState::Run)
    }

    /// RUN or RECONNECT -> CLOSED. Returns `false` when already closed or
    /// never opened.
    pub(crate) fn close(&self) -> bool {
        self.cas(SessionState::Run, SessionState::Closed)
            || self.cas(SessionState::Reconnect, SessionState::Closed)
    }

    /// Force CLOSED from any state. Fatal transport error path.
    pub(crate) fn force_closed(&self) {
        self.0.store(SessionState::Closed as u8, Ordering::Release);
    }
}
