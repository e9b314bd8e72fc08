//! WebSocket transports
//!
//! Frames keep the same length-prefix packing inside binary WebSocket
//! messages that the stream transports use on raw sockets, so peers see an
//! identical byte stream regardless of medium and the reassembly codec is
//! shared verbatim. Incoming message chunks are appended to the accumulator
//! and drained as complete frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::codec::Encoder;
use tokio_util::sync::CancellationToken;

use cw_core::error::TransportError;
use cw_core::FrameTransport;
use cw_protocol::{FrameAssembler, FrameCodec, LENGTH_PREFIX_SIZE};

struct SourceState<S> {
    stream: SplitStream<WebSocketStream<S>>,
    assembler: FrameAssembler,
}

/// Connection state shared by the client and server WebSocket transports
struct WsIo<S> {
    sink: Mutex<Option<SplitSink<WebSocketStream<S>, WsMessage>>>,
    source: Mutex<Option<SourceState<S>>>,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl<S> WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            source: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    async fn attach(&self, ws: WebSocketStream<S>) {
        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock().await = Some(SourceState {
            stream,
            assembler: FrameAssembler::new(),
        });
        self.connected.store(true, Ordering::SeqCst);
    }

    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut packed = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + frame.len());
        FrameCodec::new().encode(frame, &mut packed)?;

        sink.send(WsMessage::Binary(packed.to_vec()))
            .await
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                TransportError::ConnectionLost(e.to_string())
            })
    }

    async fn recv_frame(&self) -> Result<Bytes, TransportError> {
        if self.closed.is_cancelled() {
            return Ok(Bytes::new());
        }

        let mut guard = self.source.lock().await;
        let state = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let SourceState { stream, assembler } = state;

        loop {
            match assembler.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::Protocol(e));
                }
            }

            let message = tokio::select! {
                _ = self.closed.cancelled() => return Ok(Bytes::new()),
                next = stream.next() => next,
            };

            match message {
                Some(Ok(WsMessage::Binary(data))) => assembler.extend(&data),
                Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close(_))) | None => {
                    self.connected.store(false, Ordering::SeqCst);
                    if assembler.is_empty() {
                        return Ok(Bytes::new());
                    }
                    return Err(TransportError::ConnectionLost(
                        "websocket closed mid-frame".to_string(),
                    ));
                }
                Some(Ok(other)) => {
                    tracing::warn!("ignoring non-binary websocket message: {:?}", other);
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::ConnectionLost(e.to_string()));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.cancel();

        let mut sink = self.sink.lock().await;
        if let Some(mut half) = sink.take() {
            let _ = half.send(WsMessage::Close(None)).await;
            let _ = half.close().await;
        }
        drop(sink);

        self.source.lock().await.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }
}

/// Client-side WebSocket transport
pub struct WebSocketTransport {
    url: String,
    io: WsIo<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    /// Create a transport that will dial the given `ws://` or `wss://` URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            io: WsIo::new(),
        }
    }
}

#[async_trait]
impl FrameTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.io.is_connected() {
            return Ok(());
        }

        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {}", self.url, e)))?;

        tracing::debug!(url = %self.url, "websocket transport connected");
        self.io.attach(ws).await;
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

/// Server-side WebSocket transport serving a single peer
pub struct WebSocketServerTransport {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    io: WsIo<TcpStream>,
}

impl WebSocketServerTransport {
    /// Bind the listening socket; the peer is accepted in `connect`
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            io: WsIo::new(),
        })
    }

    /// The bound address, useful when binding to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl FrameTransport for WebSocketServerTransport {
    /// Accept exactly one peer and complete the WebSocket handshake
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

        let ws = accept_async(stream)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("handshake with {peer}: {e}")))?;

        tracing::debug!(%peer, "accepted websocket peer");
        self.io.attach(ws).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_websocket_frame_roundtrip() {
        let server = WebSocketServerTransport::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://127.0.0.1:{}/rpc", server.local_addr().port());

        let accept = tokio::spawn(async move {
            server.connect().await.unwrap();
            server
        });

        let client = WebSocketTransport::new(url);
        client.connect().await.unwrap();
        let server = accept.await.unwrap();

        client.send_frame(Bytes::from_static(b"over ws")).await.unwrap();
        assert_eq!(server.recv_frame().await.unwrap().as_ref(), b"over ws");

        // Larger than a single network read, must still arrive as one frame
        let big = Bytes::from(vec![7u8; 256 * 1024]);
        server.send_frame(big.clone()).await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap(), big);

        client.close().await.unwrap();
        assert!(server.recv_frame().await.unwrap().is_empty());
    }
}
