//! cw-core: Core abstractions and configuration for callwire
//!
//! This crate provides the transport contract, error taxonomy, payload
//! serializer seam, and configuration structures shared by the transport
//! implementations and the RPC sessions.

pub mod config;
pub mod error;
pub mod serializer;
pub mod traits;

pub use error::CwError;
pub use serializer::{BincodeSerializer, JsonSerializer, RpcSerializer};
pub use traits::FrameTransport;
