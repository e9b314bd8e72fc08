//! Client RPC session
//!
//! One session owns one connected transport. Many tasks may call
//! concurrently; a background receive loop resolves completions by
//! correlation id, so responses may return in any order. The pending-call
//! map is the only shared mutable structure.
//!
//! # Lifecycle
//!
//! A client moves Idle → Running → Stopped and is not reusable after
//! `stop`. When the receive loop exits, for any reason, every outstanding
//! call fails with the same terminal cause and the disconnect notification
//! fires exactly once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cw_core::error::{CallError, DisconnectReason, TransportError};
use cw_core::{BincodeSerializer, FrameTransport, RpcSerializer};
use cw_protocol::{RequestEnvelope, ResponseEnvelope, RpcStatus};

/// State shared between callers and the receive loop
struct ClientShared {
    transport: Arc<dyn FrameTransport>,
    /// Outstanding calls awaiting their response, keyed by correlation id
    pending: DashMap<u32, oneshot::Sender<ResponseEnvelope>>,
    next_id: AtomicU32,
    shutdown: CancellationToken,
    /// Set once, to the terminal cause, when the receive loop exits
    disconnect: watch::Sender<Option<DisconnectReason>>,
}

impl ClientShared {
    /// Allocate a correlation id, skipping ids still outstanding
    ///
    /// The 32-bit counter wraps; skipping live entries prevents a wrapped id
    /// from colliding with a call that never completed.
    fn allocate_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect.borrow().clone()
    }

    /// Terminate the session: publish the cause, then fail every
    /// outstanding call with it
    ///
    /// Publishing before draining means a caller either observes the cause
    /// directly or has its completion slot dropped by the drain; no call is
    /// ever left unresolved. Runs exactly once because the receive loop
    /// exits exactly once.
    fn finish(&self, reason: DisconnectReason) {
        tracing::debug!(%reason, "client session disconnected");
        self.disconnect.send_replace(Some(reason));

        let ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            // Dropping the sender wakes the caller, which then reads the
            // published cause.
            self.pending.remove(&id);
        }
    }
}

/// Client side of an RPC session
///
/// `S` is the payload serializer used by [`RpcClient::call_typed`]; raw
/// `call` is serializer-agnostic.
pub struct RpcClient<S = BincodeSerializer> {
    shared: Arc<ClientShared>,
    serializer: S,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient<BincodeSerializer> {
    /// Create a client over a transport with the default binary serializer
    pub fn new(transport: Arc<dyn FrameTransport>) -> Self {
        Self::with_serializer(transport, BincodeSerializer)
    }
}

impl<S: RpcSerializer> RpcClient<S> {
    /// Create a client with an explicit payload serializer
    pub fn with_serializer(transport: Arc<dyn FrameTransport>, serializer: S) -> Self {
        let (disconnect, _) = watch::channel(None);
        Self {
            shared: Arc::new(ClientShared {
                transport,
                pending: DashMap::new(),
                next_id: AtomicU32::new(1),
                shutdown: CancellationToken::new(),
                disconnect,
            }),
            serializer,
            recv_task: Mutex::new(None),
        }
    }

    /// Connect the transport and launch the receive loop
    ///
    /// Starting an already-running session is a no-op.
    pub async fn start(&self) -> Result<(), TransportError> {
        let mut task = self.recv_task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        self.shared.transport.connect().await?;
        *task = Some(tokio::spawn(receive_loop(Arc::clone(&self.shared))));

        tracing::debug!("client session started");
        Ok(())
    }

    /// Observe the disconnect notification
    ///
    /// The value transitions from `None` to `Some(cause)` exactly once, when
    /// the session terminates.
    pub fn subscribe_disconnect(&self) -> watch::Receiver<Option<DisconnectReason>> {
        self.shared.disconnect.subscribe()
    }

    /// Invoke a remote method with raw payload bytes
    pub async fn call(
        &self,
        service_id: i32,
        method_id: i32,
        payload: Bytes,
    ) -> Result<Bytes, CallError> {
        self.call_with_cancel(service_id, method_id, payload, &CancellationToken::new())
            .await
    }

    /// Invoke a remote method, aborting locally when `cancel` fires
    ///
    /// Cancellation cannot un-send an already-transmitted request; the
    /// server may still process it, and its late response is dropped
    /// silently. Callers compose deadlines by cancelling this token.
    pub async fn call_with_cancel(
        &self,
        service_id: i32,
        method_id: i32,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Bytes, CallError> {
        if let Some(reason) = self.shared.disconnect_reason() {
            return Err(CallError::Disconnected(reason));
        }

        let request_id = self.shared.allocate_request_id();
        let (slot, waiter) = oneshot::channel();

        // Register before sending so a reply that races the send still finds
        // its entry.
        self.shared.pending.insert(request_id, slot);

        // The receive loop publishes the cause before draining the map, so
        // either we observe the cause here or the drain observes our entry.
        if let Some(reason) = self.shared.disconnect_reason() {
            self.shared.pending.remove(&request_id);
            return Err(CallError::Disconnected(reason));
        }

        let result = self
            .dispatch_call(request_id, service_id, method_id, payload, cancel, waiter)
            .await;

        // Every exit path removes the entry; a success already had it
        // removed by the receive loop.
        self.shared.pending.remove(&request_id);
        result
    }

    async fn dispatch_call(
        &self,
        request_id: u32,
        service_id: i32,
        method_id: i32,
        payload: Bytes,
        cancel: &CancellationToken,
        mut waiter: oneshot::Receiver<ResponseEnvelope>,
    ) -> Result<Bytes, CallError> {
        let request = RequestEnvelope {
            request_id,
            service_id,
            method_id,
            payload,
        };
        let frame = request.encode()?;
        self.shared.transport.send_frame(frame).await?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CallError::Canceled),
            received = &mut waiter => match received {
                Ok(response) => response,
                Err(_) => {
                    let reason = self
                        .shared
                        .disconnect_reason()
                        .unwrap_or(DisconnectReason::Closed);
                    return Err(CallError::Disconnected(reason));
                }
            },
        };

        match response.status {
            RpcStatus::Ok => Ok(response.payload),
            status => Err(CallError::Remote {
                status,
                message: response.error_message,
            }),
        }
    }

    /// Invoke a remote method with typed argument and result
    ///
    /// An argument-less method takes `&()`, which serializes to the empty
    /// payload.
    pub async fn call_typed<A, R>(
        &self,
        service_id: i32,
        method_id: i32,
        arg: &A,
    ) -> Result<R, CallError>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let payload = Bytes::from(self.serializer.serialize(arg)?);
        let response = self.call(service_id, method_id, payload).await?;
        Ok(self.serializer.deserialize(&response)?)
    }

    /// Cancel the receive loop, await its termination, and close the
    /// transport
    ///
    /// Safe to call even if `start` never completed.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        if let Some(task) = self.recv_task.lock().await.take() {
            let _ = task.await;
        }
        let _ = self.shared.transport.close().await;
    }
}

/// Background task resolving completions by correlation id
async fn receive_loop(shared: Arc<ClientShared>) {
    let reason = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break DisconnectReason::Stopped,
            received = shared.transport.recv_frame() => match received {
                Ok(frame) => frame,
                Err(e) => break DisconnectReason::Error(e.to_string()),
            },
        };

        if frame.is_empty() {
            break DisconnectReason::Closed;
        }

        let response = match ResponseEnvelope::decode(&frame) {
            Ok(response) => response,
            Err(e) => break DisconnectReason::Error(format!("invalid response envelope: {e}")),
        };

        match shared.pending.remove(&response.request_id) {
            Some((_, slot)) => {
                // The caller may have given up (canceled) between lookup and
                // delivery; that failure is equally a silent drop.
                let _ = slot.send(response);
            }
            None => {
                // Already canceled or otherwise resolved
                tracing::debug!(
                    request_id = response.request_id,
                    "dropping response with no pending call"
                );
            }
        }
    };

    shared.finish(reason);
    // Fatal causes (protocol violation, authentication failure, I/O error)
    // must not leave a half-dead connection behind.
    let _ = shared.transport.close().await;
}
