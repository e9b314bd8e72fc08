//! cw-rpc: RPC sessions for callwire
//!
//! The client session multiplexes concurrent calls over one transport by
//! correlation id; the server session dispatches requests to a registry of
//! handlers. Both are transport-agnostic: anything satisfying the
//! `FrameTransport` contract from `cw-core`, wrapped or not in the security
//! codec, plugs in unchanged.

pub mod client;
pub mod handler;
pub mod server;

pub use client::RpcClient;
pub use handler::{handler_fn, FnHandler, HandlerResult, MethodKey, RpcHandler};
pub use server::RpcServer;
