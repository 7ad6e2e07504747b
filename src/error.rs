//! Error types.

use core::fmt;

use crate::state::SessionState;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The connection is closed (locally or by the peer).
    Closed,
    Io(std::io::Error),
    Decode(DecodeError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<DecodeError> for TransportError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Wire decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet type code outside the closed enumeration.
    UnknownPacketType(u16),
    /// Frame body ended before the fields of the given packet type.
    Truncated(u16),
    /// Frame length field exceeds the configured bound.
    FrameTooLarge { len: u32, max: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPacketType(code) => write!(f, "unknown packet type {code}"),
            Self::Truncated(code) => write!(f, "truncated frame for packet type {code}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Session-level errors surfaced to callers.
#[derive(Debug)]
pub enum SessionError {
    /// Operation attempted while the session is not running.
    InvalidState(SessionState),
    /// The underlying write failed.
    WriteFailure(TransportError),
    /// A bounded wait elapsed (write, request, or stream-open handshake).
    Timeout,
    /// The remote refused the stream create.
    StreamRejected(String),
    /// The stream channel is no longer open.
    StreamClosed(u32),
    /// The connection was torn down while the operation was in flight.
    ConnectionClosed(&'static str),
    /// An internal bound was hit; the operation was refused.
    ResourceExhausted(&'static str),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState(SessionState::Closed) => write!(f, "already closed"),
            Self::InvalidState(SessionState::Reconnect) => write!(f, "reconnecting"),
            Self::InvalidState(state) => write!(f, "invalid state: {state}"),
            Self::WriteFailure(e) => write!(f, "write failed: {e}"),
            Self::Timeout => write!(f, "timeout"),
            Self::StreamRejected(reason) => write!(f, "stream create rejected: {reason}"),
            Self::StreamClosed(stream_id) => write!(f, "stream {stream_id} closed"),
            Self::ConnectionClosed(cause) => write!(f, "connection closed: {cause}"),
            Self::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::WriteFailure(e) => Some(e),
            _ => None,
        }
    }
}
