//! Handler registry types
//!
//! A handler serves one `(service_id, method_id)` pair. Generated binder
//! code registers one handler per service method; `handler_fn` adapts plain
//! async closures, and `RpcServer::register_typed` layers the payload
//! serializer on top for typed signatures.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use bytes::Bytes;
use cw_protocol::RequestEnvelope;

/// Outcome of a handler invocation: the serialized result, or a failure the
/// dispatch loop reports back as an `Exception` status
pub type HandlerResult = Result<Bytes, anyhow::Error>;

/// A registered service method
///
/// Handlers may suspend (perform their own I/O) during execution. A failure
/// is contained per request; it never terminates the connection.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Serve one request
    async fn invoke(&self, request: RequestEnvelope) -> HandlerResult;
}

/// Registry key identifying one service method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub service_id: i32,
    pub method_id: i32,
}

impl MethodKey {
    /// Create a new key
    pub fn new(service_id: i32, method_id: i32) -> Self {
        Self {
            service_id,
            method_id,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_id, self.method_id)
    }
}

impl From<(i32, i32)> for MethodKey {
    fn from((service_id, method_id): (i32, i32)) -> Self {
        Self::new(service_id, method_id)
    }
}

/// Adapter turning an async closure into an [`RpcHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> RpcHandler for FnHandler<F>
where
    F: Fn(RequestEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn invoke(&self, request: RequestEnvelope) -> HandlerResult {
        (self.f)(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_key_display() {
        assert_eq!(MethodKey::new(1, 2).to_string(), "1:2");
        assert_eq!(MethodKey::from((9, 9)).to_string(), "9:9");
    }

    #[tokio::test]
    async fn test_fn_handler_invokes_closure() {
        let handler = handler_fn(|request: RequestEnvelope| async move {
            Ok(Bytes::from(format!("saw {} bytes", request.payload.len())))
        });

        let request = RequestEnvelope {
            request_id: 1,
            service_id: 1,
            method_id: 1,
            payload: Bytes::from_static(b"abc"),
        };

        let result = handler.invoke(request).await.unwrap();
        assert_eq!(result.as_ref(), b"saw 3 bytes");
    }
}
