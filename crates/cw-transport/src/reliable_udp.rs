//! Reliable-UDP transport
//!
//! Speaks the same length-prefixed framing as the stream transports, over a
//! connected datagram socket. Retransmission, ordering, and fragmentation of
//! frames larger than a datagram are the job of the medium underneath (a
//! KCP-style lane or an equivalently reliable path); this type only does the
//! framing and the transport contract. Datagram payloads are appended to the
//! shared accumulator, so frames may span multiple datagrams as long as the
//! medium delivers them in order.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use cw_core::error::TransportError;
use cw_core::FrameTransport;
use cw_protocol::{FrameAssembler, FrameCodec, LENGTH_PREFIX_SIZE};

const RECV_BUFFER_SIZE: usize = 64 * 1024;

struct RecvState {
    assembler: FrameAssembler,
    scratch: Vec<u8>,
}

/// Frame transport over a connected reliable-UDP socket
pub struct ReliableUdpTransport {
    target: Option<String>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    recv: Mutex<RecvState>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl ReliableUdpTransport {
    /// Create a transport that will bind an ephemeral port and connect the
    /// socket to `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            target: Some(format!("{}:{}", host.into(), port)),
            socket: Mutex::new(None),
            recv: Mutex::new(RecvState {
                assembler: FrameAssembler::new(),
                scratch: vec![0u8; RECV_BUFFER_SIZE],
            }),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Wrap a socket supplied by the platform's reliable-UDP stack
    ///
    /// The socket must already be connected to its remote peer.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            target: None,
            socket: Mutex::new(Some(Arc::new(socket))),
            recv: Mutex::new(RecvState {
                assembler: FrameAssembler::new(),
                scratch: vec![0u8; RECV_BUFFER_SIZE],
            }),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// The bound local address
    pub async fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        let socket = self.shared_socket().await?;
        Ok(socket.local_addr()?)
    }

    async fn shared_socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl FrameTransport for ReliableUdpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.closed.is_cancelled() {
            return Err(TransportError::ConnectFailed(
                "transport already closed".to_string(),
            ));
        }

        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            let target = self
                .target
                .as_deref()
                .ok_or(TransportError::NotConnected)?;
            let socket = UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            socket
                .connect(target)
                .await
                .map_err(|e| TransportError::ConnectFailed(format!("{target}: {e}")))?;
            tracing::debug!(%target, "reliable-udp transport connected");
            *guard = Some(Arc::new(socket));
        }

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let socket = self.shared_socket().await?;

        let mut packed = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
        FrameCodec::new().encode(frame, &mut packed)?;

        socket.send(&packed).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::ConnectionLost(e.to_string())
        })?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Ok(Bytes::new());
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let socket = self.shared_socket().await?;
        let mut state = self.recv.lock().await;
        let RecvState { assembler, scratch } = &mut *state;

        loop {
            match assembler.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::Protocol(e));
                }
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(Bytes::new()),
                received = socket.recv(scratch) => {
                    let n = received.map_err(|e| {
                        self.connected.store(false, Ordering::SeqCst);
                        TransportError::ConnectionLost(e.to_string())
                    })?;
                    assembler.extend(&scratch[..n]);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();
        self.socket.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected_pair() -> (ReliableUdpTransport, ReliableUdpTransport) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        let a = ReliableUdpTransport::from_socket(a);
        let b = ReliableUdpTransport::from_socket(b);
        a.connect().await.unwrap();
        b.connect().await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (a, b) = connected_pair().await;

        a.send_frame(Bytes::from_static(b"datagram frame")).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap().as_ref(), b"datagram frame");
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let (a, _b) = connected_pair().await;
        let a = Arc::new(a);

        let receiver = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.recv_frame().await })
        };

        tokio::task::yield_now().await;
        a.close().await.unwrap();

        let frame = receiver.await.unwrap().unwrap();
        assert!(frame.is_empty());
    }
}
