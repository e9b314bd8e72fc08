//! Config-driven transport construction
//!
//! Builds the concrete client-side transport for a [`TransportConfig`] and
//! wraps it in [`SecureTransport`] whenever any security feature is enabled,
//! so sessions never special-case the codec. The loopback kind has no remote
//! peer; its paired endpoint is returned alongside for the server session to
//! own.

use std::sync::Arc;

use cw_core::config::{SecurityConfig, TransportConfig};
use cw_core::error::SecurityError;
use cw_core::FrameTransport;

use crate::loopback::LoopbackTransport;
use crate::reliable_udp::ReliableUdpTransport;
use crate::secure::SecureTransport;
use crate::tcp::TcpTransport;
use crate::websocket::WebSocketTransport;

/// Build a transport from configuration
///
/// Returns the client transport and, for the loopback kind only, the paired
/// server endpoint (already wrapped with the same security settings).
pub fn build_transport(
    transport: &TransportConfig,
    security: &SecurityConfig,
) -> Result<(Arc<dyn FrameTransport>, Option<Arc<dyn FrameTransport>>), SecurityError> {
    match transport {
        TransportConfig::Loopback => {
            let (client, server) = LoopbackTransport::pair();
            Ok((
                secured(Arc::new(client), security)?,
                Some(secured(Arc::new(server), security)?),
            ))
        }
        TransportConfig::Tcp { host, port } => {
            let client = TcpTransport::new(host.clone(), *port);
            Ok((secured(Arc::new(client), security)?, None))
        }
        TransportConfig::Websocket { url } => {
            let client = WebSocketTransport::new(url.clone());
            Ok((secured(Arc::new(client), security)?, None))
        }
        TransportConfig::ReliableUdp { host, port } => {
            let client = ReliableUdpTransport::new(host.clone(), *port);
            Ok((secured(Arc::new(client), security)?, None))
        }
    }
}

/// Wrap a transport with the security codec when any feature is enabled
pub fn secured(
    inner: Arc<dyn FrameTransport>,
    security: &SecurityConfig,
) -> Result<Arc<dyn FrameTransport>, SecurityError> {
    if !security.is_enabled() {
        return Ok(inner);
    }
    Ok(Arc::new(SecureTransport::from_config(inner, security)?))
}
