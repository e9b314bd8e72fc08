//! Server RPC session
//!
//! One session owns one connected transport and a handler registry keyed by
//! `(service_id, method_id)`. The registry is populated before `start` and
//! read-only afterwards. The dispatch loop awaits each handler to completion
//! before reading the next frame, so exactly one request is in flight per
//! connection and responses leave in request order.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cw_core::error::ServerError;
use cw_core::{BincodeSerializer, FrameTransport, RpcSerializer};
use cw_protocol::{RequestEnvelope, ResponseEnvelope};

use crate::handler::{handler_fn, HandlerResult, MethodKey, RpcHandler};

/// Server side of an RPC session
pub struct RpcServer {
    transport: Arc<dyn FrameTransport>,
    handlers: HashMap<MethodKey, Arc<dyn RpcHandler>>,
    shutdown: CancellationToken,
    dispatch_task: Option<JoinHandle<()>>,
    started: bool,
}

impl RpcServer {
    /// Create a server over a transport
    pub fn new(transport: Arc<dyn FrameTransport>) -> Self {
        Self {
            transport,
            handlers: HashMap::new(),
            shutdown: CancellationToken::new(),
            dispatch_task: None,
            started: false,
        }
    }

    /// Register a handler for one service method
    ///
    /// Registration is only permitted before `start`; the dispatch loop
    /// reads the registry without synchronization.
    pub fn register(
        &mut self,
        service_id: i32,
        method_id: i32,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }
        self.handlers
            .insert(MethodKey::new(service_id, method_id), handler);
        Ok(())
    }

    /// Register an async closure as a handler
    pub fn register_fn<F, Fut>(
        &mut self,
        service_id: i32,
        method_id: i32,
        f: F,
    ) -> Result<(), ServerError>
    where
        F: Fn(RequestEnvelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(service_id, method_id, Arc::new(handler_fn(f)))
    }

    /// Register a handler with typed argument and result
    ///
    /// Payloads go through the default binary serializer; this is the shape
    /// generated binder code uses.
    pub fn register_typed<A, R, F, Fut>(
        &mut self,
        service_id: i32,
        method_id: i32,
        f: F,
    ) -> Result<(), ServerError>
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, anyhow::Error>> + Send + 'static,
    {
        self.register_fn(service_id, method_id, move |request: RequestEnvelope| {
            let invocation = BincodeSerializer
                .deserialize::<A>(&request.payload)
                .map(|arg| f(arg));
            async move {
                match invocation {
                    Ok(fut) => {
                        let value = fut.await?;
                        Ok(Bytes::from(BincodeSerializer.serialize(&value)?))
                    }
                    Err(e) => Err(anyhow::Error::new(e)),
                }
            }
        })
    }

    /// Connect the transport and launch the dispatch loop
    pub async fn start(&mut self) -> Result<(), ServerError> {
        if self.started {
            return Err(ServerError::AlreadyStarted);
        }

        self.transport.connect().await?;
        self.started = true;

        let handlers = Arc::new(self.handlers.clone());
        let transport = Arc::clone(&self.transport);
        let shutdown = self.shutdown.clone();
        self.dispatch_task = Some(tokio::spawn(dispatch_loop(transport, handlers, shutdown)));

        tracing::debug!(handlers = self.handlers.len(), "server session started");
        Ok(())
    }

    /// Cancel the dispatch loop, await its termination, and close the
    /// transport
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.dispatch_task.take() {
            let _ = task.await;
        }
        let _ = self.transport.close().await;
    }
}

/// Background task: receive, dispatch, respond, one request at a time
async fn dispatch_loop(
    transport: Arc<dyn FrameTransport>,
    handlers: Arc<HashMap<MethodKey, Arc<dyn RpcHandler>>>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = transport.recv_frame() => match received {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!("dispatch loop receive failed: {e}");
                    break;
                }
            },
        };

        if frame.is_empty() {
            tracing::debug!("peer closed connection");
            break;
        }

        let request = match RequestEnvelope::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Protocol violation; the stream cannot be resynchronized
                tracing::error!("invalid request envelope: {e}");
                break;
            }
        };

        let response = handle_request(&handlers, request).await;

        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("failed to encode response envelope: {e}");
                break;
            }
        };

        if let Err(e) = transport.send_frame(encoded).await {
            tracing::warn!("failed to send response: {e}");
            break;
        }
    }

    let _ = transport.close().await;
}

async fn handle_request(
    handlers: &HashMap<MethodKey, Arc<dyn RpcHandler>>,
    request: RequestEnvelope,
) -> ResponseEnvelope {
    let key = MethodKey::new(request.service_id, request.method_id);
    let request_id = request.request_id;

    let Some(handler) = handlers.get(&key) else {
        tracing::debug!(%key, request_id, "no handler registered");
        return ResponseEnvelope::not_found(request_id, format!("No handler for {key}"));
    };

    // Run the handler in its own task so a panic is contained as a join
    // error instead of taking down the dispatch loop.
    let handler = Arc::clone(handler);
    let invocation = tokio::spawn(async move { handler.invoke(request).await });

    match invocation.await {
        Ok(Ok(payload)) => ResponseEnvelope::ok(request_id, payload),
        Ok(Err(e)) => {
            tracing::debug!(%key, request_id, error = %e, "handler failed");
            ResponseEnvelope::exception(request_id, format!("{e:#}"))
        }
        Err(e) => {
            tracing::error!(%key, request_id, "handler panicked");
            ResponseEnvelope::exception(request_id, format!("Handler panicked: {e}"))
        }
    }
}
