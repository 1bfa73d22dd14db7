//! Byte-stream transport abstraction
//!
//! The protocol consumes an ordered, reliable, bidirectional byte stream
//! with no message-boundary guarantee; framing lives above this seam. A
//! WebRTC data channel or TCP socket adapter implements [`Transport`];
//! [`duplex_pair`] provides an in-memory implementation for tests and
//! same-process sessions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::error::{ProtocolError, Result};

/// An ordered, reliable, bidirectional byte stream
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes to the peer
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Receive the next delivery, `None` once the stream is closed.
    ///
    /// Deliveries carry no boundary guarantee: one call may return a partial
    /// frame or several frames concatenated.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Close the stream; subsequent sends fail and the peer's recv drains
    async fn close(&self);
}

/// In-memory transport endpoint backed by channels
pub struct DuplexTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: Arc<AtomicBool>,
    close_notify: Arc<Notify>,
    peer_closed: Arc<AtomicBool>,
    peer_notify: Arc<Notify>,
}

/// Create a connected pair of in-memory transports
pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
    let (a_tx, a_rx) = mpsc::channel(256);
    let (b_tx, b_rx) = mpsc::channel(256);
    let a_closed = Arc::new(AtomicBool::new(false));
    let b_closed = Arc::new(AtomicBool::new(false));
    let a_notify = Arc::new(Notify::new());
    let b_notify = Arc::new(Notify::new());

    let a = DuplexTransport {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        closed: Arc::clone(&a_closed),
        close_notify: Arc::clone(&a_notify),
        peer_closed: Arc::clone(&b_closed),
        peer_notify: Arc::clone(&b_notify),
    };
    let b = DuplexTransport {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        closed: b_closed,
        close_notify: b_notify,
        peer_closed: a_closed,
        peer_notify: a_notify,
    };
    (a, b)
}

#[async_trait]
impl Transport for DuplexTransport {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) || self.peer_closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Transport("transport closed".to_string()));
        }
        self.tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| ProtocolError::Transport("peer receiver dropped".to_string()))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            delivery = rx.recv() => delivery,
            _ = self.close_notify.notified() => None,
            _ = self.peer_notify.notified() => None,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
        // wake the peer's pending recv too
        self.peer_closed.store(true, Ordering::SeqCst);
        self.peer_notify.notify_waiters();
    }
}
