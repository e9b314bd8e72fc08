//! TCP transports
//!
//! Stream sockets do not preserve message boundaries, so both directions run
//! the shared length-prefix codec: frames are packed on send and reassembled
//! from raw reads on receive. `TcpTransport` dials out; `TcpServerTransport`
//! binds and serves exactly one peer, which the owning session then holds
//! for its lifetime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use cw_core::error::TransportError;
use cw_core::FrameTransport;
use cw_protocol::{FrameAssembler, FrameCodec, LENGTH_PREFIX_SIZE};

struct ReadState {
    io: OwnedReadHalf,
    assembler: FrameAssembler,
}

/// Connection state shared by the dialing and accepting TCP transports
struct StreamIo {
    reader: Mutex<Option<ReadState>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl StreamIo {
    fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    async fn attach(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(ReadState {
            io: read_half,
            assembler: FrameAssembler::new(),
        });
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut packed = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
        FrameCodec::new().encode(frame, &mut packed)?;

        writer.write_all(&packed).await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            TransportError::ConnectionLost(e.to_string())
        })
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Ok(Bytes::new());
        }

        let mut guard = self.reader.lock().await;
        let state = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let ReadState { io, assembler } = state;

        loop {
            match assembler.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    // Protocol violation (oversized frame); the stream can no
                    // longer be trusted to frame correctly.
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::Protocol(e));
                }
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(Bytes::new()),
                read = io.read_buf(assembler.buffer_mut()) => {
                    let n = read.map_err(|e| {
                        self.connected.store(false, Ordering::SeqCst);
                        TransportError::ConnectionLost(e.to_string())
                    })?;
                    if n == 0 {
                        self.connected.store(false, Ordering::SeqCst);
                        if assembler.is_empty() {
                            return Ok(Bytes::new());
                        }
                        return Err(TransportError::ConnectionLost(
                            "connection closed mid-frame".to_string(),
                        ));
                    }
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();

        let mut writer = self.writer.lock().await;
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
        drop(writer);

        self.reader.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }
}

/// Client-side TCP transport
pub struct TcpTransport {
    addr: String,
    io: StreamIo,
}

impl TcpTransport {
    /// Create a transport that will dial `host:port`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host.into(), port),
            io: StreamIo::new(),
        }
    }
}

#[async_trait]
impl FrameTransport for TcpTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.io.is_connected() {
            return Ok(());
        }

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", self.addr, e)))?;

        tracing::debug!(addr = %self.addr, "tcp transport connected");
        self.io.attach(stream).await;
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.io.send_frame(frame).await
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        self.io.recv_frame().await
    }

    fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.io.close().await
    }
}

/// Server-side TCP transport serving a single peer
pub struct TcpServerTransport {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    io: StreamIo,
}

impl TcpServerTransport {
    /// Bind the listening socket; the peer is accepted in `connect`
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        tracing::debug!(%local_addr, "tcp server transport bound");
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            io: StreamIo::new(),
        })
    }

    /// The bound address, useful when binding to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl FrameTransport for TcpServerTransport {
    /// Accept exactly one peer and bind this transport to it
    async fn connect(&self) -> Result<(), TransportError> {
        if self.io.is_connected() {
            return Ok(());
        }

        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotConnected)?;

        let (stream, peer) = tokio::select! {
            _ = self.io.closed.cancelled() => return Err(TransportError::Closed),
            accepted = listener.accept() => accepted
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?,
        };

        tracing::debug!(%peer, "accepted tcp peer");
        self.io.attach(stream).await;
        Ok(())
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        self.io.send_frame(frame).await
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        self.io.recv_frame().await
    }

    fn is_connected(&self) -> bool {
        self.io.is_connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.io.close().await
    }
}
