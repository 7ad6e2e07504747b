//! Transport enum and internal backend trait.
//!
//! The transport boundary delivers whole, typed [`Packet`]s; the session
//! layer never parses raw bytes. Each backend lives in its own module under
//! `transport/` and implements the internal [`TransportBackend`] trait.

use crate::{Packet, TransportError};

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError>;
    async fn recv_packet(&self) -> Result<Packet, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

#[derive(Clone, Debug)]
pub enum Transport {
    Mem(mem::MemTransport),
    Stream(stream::StreamTransport),
}

impl Transport {
    pub async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        match self {
            Transport::Mem(t) => t.send_packet(packet).await,
            Transport::Stream(t) => t.send_packet(packet).await,
        }
    }

    pub async fn recv_packet(&self) -> Result<Packet, TransportError> {
        match self {
            Transport::Mem(t) => t.recv_packet().await,
            Transport::Stream(t) => t.recv_packet().await,
        }
    }

    pub fn close(&self) {
        match self {
            Transport::Mem(t) => t.close(),
            Transport::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Mem(t) => t.is_closed(),
            Transport::Stream(t) => t.is_closed(),
        }
    }

    /// Connected in-process pair, mainly for tests.
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Framed transport over any async byte stream.
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    /// Connected duplex pair over the framed codec, mainly for tests.
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }
}

pub mod mem;
pub mod stream;
