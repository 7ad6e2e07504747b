//! Wire packet model.
//!
//! A [`Packet`] is pure data: a type discriminant plus opaque payload bytes.
//! The dispatcher routes on [`Packet::packet_type`] without interpreting
//! payloads; what the bytes mean is the application's business.

use bytes::Bytes;

/// Numeric packet type codes.
///
/// This is a closed enumeration fixed by the wire protocol; the gaps are
/// codes reserved by other revisions of the same wire. Changing any value
/// breaks compatibility with deployed peers.
pub mod packet_type {
    pub const SEND: u16 = 1;
    pub const REQUEST: u16 = 5;
    pub const RESPONSE: u16 = 6;
    pub const STREAM_CREATE: u16 = 10;
    pub const STREAM_CREATE_SUCCESS: u16 = 12;
    pub const STREAM_CREATE_FAIL: u16 = 14;
    pub const STREAM_CLOSE: u16 = 15;
    pub const STREAM_RESPONSE: u16 = 20;
    pub const CLOSE: u16 = 100;
}

/// A typed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Fire-and-forget message; no correlation id, no response expected.
    Send { payload: Bytes },
    /// Correlated request; `id` is unique among in-flight requests on this
    /// connection.
    Request { id: u32, payload: Bytes },
    /// Response to the outstanding request with the same `id`.
    Response { id: u32, payload: Bytes },
    /// Open a new logical stream channel.
    StreamCreate { stream_id: u32, payload: Bytes },
    /// Remote accepted the stream create.
    StreamCreateSuccess { stream_id: u32 },
    /// Remote rejected the stream create.
    StreamCreateFail { stream_id: u32, reason: String },
    /// Tear down a stream channel (sent by either side).
    StreamClose { stream_id: u32 },
    /// Payload delivered on an open stream channel.
    StreamResponse { stream_id: u32, payload: Bytes },
    /// Handshake signal preceding local socket shutdown.
    Close,
}

impl Packet {
    /// The numeric type code for this packet.
    pub fn packet_type(&self) -> u16 {
        match self {
            Packet::Send { .. } => packet_type::SEND,
            Packet::Request { .. } => packet_type::REQUEST,
            Packet::Response { .. } => packet_type::RESPONSE,
            Packet::StreamCreate { .. } => packet_type::STREAM_CREATE,
            Packet::StreamCreateSuccess { .. } => packet_type::STREAM_CREATE_SUCCESS,
            Packet::StreamCreateFail { .. } => packet_type::STREAM_CREATE_FAIL,
            Packet::StreamClose { .. } => packet_type::STREAM_CLOSE,
            Packet::StreamResponse { .. } => packet_type::STREAM_RESPONSE,
            Packet::Close => packet_type::CLOSE,
        }
    }
}
