//! In-memory loopback transport
//!
//! Two endpoints are created as a pair; what one sends the other receives.
//! Message boundaries are preserved by construction, so no length-prefix
//! framing is needed here. Used by tests and single-process deployments.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use cw_core::error::TransportError;
use cw_core::FrameTransport;

/// One endpoint of an in-process transport pair
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    connected: AtomicBool,
    /// Shared with the peer endpoint; closing either side closes both
    /// directions, mirroring a socket teardown.
    closed: CancellationToken,
}

impl LoopbackTransport {
    /// Create a connected pair of endpoints
    pub fn pair() -> (LoopbackTransport, LoopbackTransport) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let a = LoopbackTransport {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            connected: AtomicBool::new(false),
            closed: closed.clone(),
        };
        let b = LoopbackTransport {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            connected: AtomicBool::new(false),
            closed,
        };
        (a, b)
    }
}

#[async_trait]
impl FrameTransport for LoopbackTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectFailed(
                "loopback endpoint already closed".to_string(),
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        self.tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost("peer endpoint dropped".to_string()))
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(Bytes::new()),
            frame = rx.recv() => match frame {
                Some(frame) => Ok(frame),
                None => Ok(Bytes::new()),
            },
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_frames() {
        let (a, b) = LoopbackTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        a.send_frame(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap().as_ref(), b"hello");

        b.send_frame(Bytes::from_static(b"reply")).await.unwrap();
        assert_eq!(a.recv_frame().await.unwrap().as_ref(), b"reply");
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let (a, _b) = LoopbackTransport::pair();
        let result = a.send_frame(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_unblocks_receive_with_closure_signal() {
        let (a, b) = LoopbackTransport::pair();
        a.connect().await.unwrap();
        b.connect().await.unwrap();

        let receiver = tokio::spawn(async move { b.recv_frame().await });

        // Give the receive a chance to block first
        tokio::task::yield_now().await;
        a.close().await.unwrap();

        let frame = receiver.await.unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(!a.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (a, _b) = LoopbackTransport::pair();
        a.connect().await.unwrap();
        a.close().await.unwrap();
        a.close().await.unwrap();

        let result = a.send_frame(Bytes::from_static(b"x")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let (a, b) = LoopbackTransport::pair();
        a.close().await.unwrap();

        assert!(matches!(
            b.connect().await,
            Err(TransportError::ConnectFailed(_))
        ));
    }
}
