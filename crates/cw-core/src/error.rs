//! Core error types for callwire
//!
//! The taxonomy separates connection-fatal failures (transport, security,
//! protocol violations) from per-call failures (remote status, cancellation)
//! that never affect other in-flight calls on the same session.

use std::fmt;
use std::path::PathBuf;

use cw_protocol::{ProtocolError, RpcStatus};
use thiserror::Error;

/// Top-level error type for the callwire ecosystem
#[derive(Error, Debug)]
pub enum CwError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Security codec error
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport-level errors
///
/// All of these are fatal to the owning session: the receive/dispatch loop
/// terminates, every outstanding call fails with the same cause, and the
/// disconnect notification fires exactly once.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    /// Operation attempted before connect or after close
    #[error("Not connected")]
    NotConnected,

    /// Connection dropped unexpectedly
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Transport was closed locally
    #[error("Transport closed")]
    Closed,

    /// Security codec rejected a frame
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Wire protocol violation
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Security codec errors
#[derive(Error, Debug)]
pub enum SecurityError {
    /// HMAC verification failed; the frame was tampered with or garbled.
    /// Decryption is never attempted on unauthenticated data.
    #[error("Frame authentication failed")]
    AuthenticationFailed,

    /// Encryption enabled without key material
    #[error("Encryption enabled but no key provided")]
    MissingKey,

    /// Key material could not be decoded
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    /// Master key must be 16, 24, or 32 bytes
    #[error("Encryption key must be 16, 24, or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Encrypted frame shorter than IV + tag
    #[error("Encrypted frame too small: {size} bytes")]
    TruncatedFrame { size: usize },

    /// Decrypted block is missing the flags byte
    #[error("Security header missing")]
    MissingHeader,

    /// Cipher failure (bad padding, bad key)
    #[error("Cipher error: {0}")]
    Cipher(String),

    /// Compression failure
    #[error("Compression failed: {0}")]
    Compress(String),

    /// Decompression failure
    #[error("Decompression failed: {0}")]
    Decompress(String),
}

/// Why a client session stopped receiving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the connection in an orderly fashion
    Closed,
    /// Session was stopped locally
    Stopped,
    /// Transport or protocol failure
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "connection closed by peer"),
            DisconnectReason::Stopped => write!(f, "session stopped"),
            DisconnectReason::Error(message) => write!(f, "{message}"),
        }
    }
}

/// Errors surfaced to a single caller of `call`
#[derive(Error, Debug)]
pub enum CallError {
    /// Transport failed while sending the request
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Envelope encoding/decoding failed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Server answered with a non-Ok status; other in-flight calls are
    /// unaffected
    #[error("Remote call failed with status {status:?}: {}", .message.as_deref().unwrap_or("<no message>"))]
    Remote {
        status: RpcStatus,
        message: Option<String>,
    },

    /// The caller's cancellation signal fired before the response arrived
    #[error("Call canceled")]
    Canceled,

    /// The session disconnected while the call was outstanding
    #[error("Disconnected: {0}")]
    Disconnected(DisconnectReason),

    /// Argument or result (de)serialization failed
    #[error("Serializer error: {0}")]
    Serializer(#[from] SerializerError),
}

/// Server session errors
#[derive(Error, Debug)]
pub enum ServerError {
    /// Handlers must be registered before the dispatch loop starts
    #[error("Server already started")]
    AlreadyStarted,

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Payload serializer errors
#[derive(Error, Debug)]
pub enum SerializerError {
    /// Binary codec failure
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON codec failure
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
