//! In-process packet-pair transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{Packet, TransportError};

use super::TransportBackend;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    /// Dropped on close so the peer's receive side observes end-of-stream.
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    closed: AtomicBool,
}

impl MemTransport {
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_b)),
            rx: tokio::sync::Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });

        let inner_b = Arc::new(MemInner {
            tx: Mutex::new(Some(tx_a)),
            rx: tokio::sync::Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for MemTransport {
    async fn send_packet(&self, packet: Packet) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let tx = self
            .inner
            .tx
            .lock()
            .clone()
            .ok_or(TransportError::Closed)?;
        tx.send(packet).await.map_err(|_| TransportError::Closed)
    }

    async fn recv_packet(&self) -> Result<Packet, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let packet = {
            let mut rx = self.inner.rx.lock().await;
            rx.recv().await.ok_or(TransportError::Closed)?
        };

        Ok(packet)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}
