//! Framed packet transport over any async byte stream.
//!
//! Wire format, big-endian throughout (the original peer is a JVM process):
//! every frame is a `u32` body length followed by the body. The body starts
//! with the `u16` packet type code, then the id fields for the type, then
//! the remaining bytes as opaque payload (UTF-8 reason for
//! `STREAM_CREATE_FAIL`).
//!
//! Unknown packet type codes are logged and the frame is skipped; a
//! truncated body or an oversized frame is a fatal decode error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::packet::{Packet, packet_type};
use crate::{DecodeError, TransportError};

use super::TransportBackend;

/// Upper bound on a frame body. Anything larger is a framing fault.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn encode_body(packet: &Packet, buf: &mut BytesMut) {
    buf.put_u16(packet.packet_type());
    match packet {
        Packet::Send { payload } => buf.extend_from_slice(payload),
        Packet::Request { id, payload } | Packet::Response { id, payload } => {
            buf.put_u32(*id);
            buf.extend_from_slice(payload);
        }
        Packet::StreamCreate { stream_id, payload }
        | Packet::StreamResponse { stream_id, payload } => {
            buf.put_u32(*stream_id);
            buf.extend_from_slice(payload);
        }
        Packet::StreamCreateSuccess { stream_id } | Packet::StreamClose { stream_id } => {
            buf.put_u32(*stream_id);
        }
        Packet::StreamCreateFail { stream_id, reason } => {
            buf.put_u32(*stream_id);
            buf.extend_from_slice(reason.as_bytes());
        }
        Packet::Close => {}
    }
}

fn read_u32(body: &mut Bytes, code: u16) -> Result<u32, DecodeError> {
    if body.remaining() < 4 {
        return Err(DecodeError::Truncated(code));
    }
    Ok(body.get_u32())
}

fn decode_body(mut body: Bytes) -> Result<Packet, DecodeError> {
    if body.remaining() < 2 {
        return Err(DecodeError::Truncated(0));
    }
    let code = body.get_u16();
    let packet = match code {
        packet_type::SEND => Packet::Send { payload: body },
        packet_type::REQUEST => Packet::Request {
            id: read_u32(&mut body, code)?,
            payload: body,
        },
        packet_type::RESPONSE => Packet::Response {
            id: read_u32(&mut body, code)?,
            payload: body,
        },
        packet_type::STREAM_CREATE => Packet::StreamCreate {
            stream_id: read_u32(&mut body, code)?,
            payload: body,
        },
        packet_type::STREAM_CREATE_SUCCESS => Packet::StreamCreateSuccess {
            stream_id: read_u32(&mut body, code)?,
        },
        packet_type::STREAM_CREATE_FAIL => {
            let stream_id = read_u32(&mut body, code)?;
            Packet::StreamCreateFail {
                stream_id,
                reason: String::from_utf8_lossy(&body).into_owned(),
            }
        }
        packet_type::STREAM_CLOSE => Packet::StreamClose {
            stream_id: read_u32(&mut body, code)?,
        },
        packet_type::STREAM_RESPONSE => Packet::StreamResponse {
            stream_id: read_u32(&mut body, code)?,
            payload: body,
        },
        packet_type::CLOSE => Packet::Close,
        other => return Err(DecodeError::UnknownPacketType(other)),
    };
    Ok(packet)
}

impl TransportBackend for StreamTransport {
    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut body = BytesMut::with_capacity(64);
        encode_body(&packet, &mut body);

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv_packet(&self) -> Result<Packet, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;
        loop {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransportError::Closed
                } else {
                    TransportError::Io(e)
                }
            })?;
            let frame_len = u32::from_be_bytes(len_buf) as usize;
            if frame_len > MAX_FRAME_LEN {
                return Err(DecodeError::FrameTooLarge {
                    len: frame_len as u32,
                    max: MAX_FRAME_LEN as u32,
                }
                .into());
            }

            let mut body = vec![0u8; frame_len];
            reader.read_exact(&mut body).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    TransportError::Closed
                } else {
                    TransportError::Io(e)
                }
            })?;

            match decode_body(Bytes::from(body)) {
                Ok(packet) => return Ok(packet),
                Err(DecodeError::UnknownPacketType(code)) => {
                    // Closed enumeration on this wire; an unknown code is a
                    // peer anomaly, not a framing fault. Skip the frame.
                    tracing::warn!(code, frame_len, "unknown packet type; dropping frame");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_round_trip_over_a_duplex_pair() {
        let (a, b) = StreamTransport::pair();

        let sent = [
            Packet::Send {
                payload: Bytes::from_static(b"hello"),
            },
            Packet::Request {
                id: 42,
                payload: Bytes::from_static(&[1, 2, 3]),
            },
            Packet::Response {
                id: 42,
                payload: Bytes::new(),
            },
            Packet::StreamCreateFail {
                stream_id: 9,
                reason: "busy".to_string(),
            },
            Packet::Close,
        ];
        for packet in &sent {
            a.send_packet(packet.clone()).await.unwrap();
        }
        for packet in &sent {
            assert_eq!(&b.recv_packet().await.unwrap(), packet);
        }
    }

    #[tokio::test]
    async fn unknown_type_code_is_skipped() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(raw_a);

        // Frame with reserved type code 2, then a valid SEND.
        raw_b.write_all(&2u32.to_be_bytes()).await.unwrap();
        raw_b.write_all(&2u16.to_be_bytes()).await.unwrap();
        raw_b.write_all(&3u32.to_be_bytes()).await.unwrap();
        raw_b.write_all(&packet_type::SEND.to_be_bytes()).await.unwrap();
        raw_b.write_all(b"x").await.unwrap();

        match transport.recv_packet().await.unwrap() {
            Packet::Send { payload } => assert_eq!(payload, Bytes::from_static(b"x")),
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_maps_to_closed() {
        let (raw_a, raw_b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(raw_a);
        drop(raw_b);

        assert!(matches!(
            transport.recv_packet().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_decode_error() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(raw_a);

        raw_b
            .write_all(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes())
            .await
            .unwrap();

        assert!(matches!(
            transport.recv_packet().await,
            Err(TransportError::Decode(DecodeError::FrameTooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_a_decode_error() {
        let (raw_a, mut raw_b) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(raw_a);

        // REQUEST frame with only 2 of the 4 id bytes.
        raw_b.write_all(&4u32.to_be_bytes()).await.unwrap();
        raw_b
            .write_all(&packet_type::REQUEST.to_be_bytes())
            .await
            .unwrap();
        raw_b.write_all(&[0, 0]).await.unwrap();

        assert!(matches!(
            transport.recv_packet().await,
            Err(TransportError::Decode(DecodeError::Truncated(code))) if code == packet_type::REQUEST
        ));
    }
}
