//! cw-transport: Concrete frame transports for callwire
//!
//! Every transport here satisfies the [`FrameTransport`] contract from
//! `cw-core`: whole frames in, whole frames out, an empty frame as the
//! orderly-closure signal. Stream-like media (TCP, WebSocket, reliable-UDP)
//! share the length-prefix reassembly codec from `cw-protocol`; the security
//! codec wraps any of them transparently.

pub mod factory;
pub mod loopback;
pub mod reliable_udp;
pub mod secure;
pub mod tcp;
pub mod websocket;

pub use cw_core::FrameTransport;
pub use factory::{build_transport, secured};
pub use loopback::LoopbackTransport;
pub use reliable_udp::ReliableUdpTransport;
pub use secure::{SecureTransport, SecurityCodec};
pub use tcp::{TcpServerTransport, TcpTransport};
pub use websocket::{WebSocketServerTransport, WebSocketTransport};
