//! Frame transport contract
//!
//! The boundary every concrete transport (loopback, TCP, WebSocket,
//! reliable-UDP) and every wrapper (security codec) must satisfy. Callers
//! only ever see whole frames; how a medium chunks bytes underneath is the
//! implementation's problem.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TransportError;

/// Abstraction over a connection that exchanges whole frames
///
/// Implementations provide interior synchronization: one logical sender and
/// one logical receiver may operate concurrently through `&self`. A session
/// owns its transport exclusively; no two sessions share one instance.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Establish the connection
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one complete frame
    async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive one complete frame, blocking until it is fully available
    ///
    /// An empty frame signals orderly peer closure; the owning loop must
    /// terminate without treating it as an error.
    async fn recv_frame(&self) -> Result<Bytes, TransportError>;

    /// Whether the connection is currently usable
    fn is_connected(&self) -> bool;

    /// Close the connection
    ///
    /// Idempotent. Releases resources and unblocks any in-flight receive
    /// with the closure signal.
    async fn close(&self) -> Result<(), TransportError>;
}
