//! cw-protocol: Wire protocol for callwire RPC
//!
//! This crate defines the binary protocol shared by every callwire peer: the
//! length-prefixed frame format with its reassembly codec, and the
//! request/response envelopes carried inside frames.

pub mod envelope;
pub mod error;
pub mod frame;

pub use envelope::{RequestEnvelope, ResponseEnvelope, RpcStatus};
pub use error::ProtocolError;
pub use frame::{FrameAssembler, FrameCodec, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE};
