//! JSON RPC client that multiplexes any number of concurrent requests over a single transport.
//!
//! Every request gets the next integer id and a oneshot channel that is parked in the pending set
//! until something resolves it.  A single background task owns the read half of the transport
//! and is the only thing that ever reads from it; it matches each response to its pending
//! request by id and nothing else, so responses can arrive in any order.
//!
//! Exactly one of these things resolves each pending request:
//!
//! - the matching response (success or error) from the server
//! - the caller's own deadline expiring
//! - the client being closed, either deliberately or because the stream ended
//!
//! Whichever gets there first removes the request from the pending set under the lock, which is
//! what guarantees a request is never resolved twice.  Anything that arrives later for the same id
//! finds nothing pending and is discarded.
use crate::error::{ClientError, FramingError};
use crate::shared::{
    as_request_id, ErrorCode, OutgoingNotification, OutgoingRequest, OutgoingResponse, RequestId,
    RpcErrorObject, ServerMessage, TwoPointZero,
};
use crate::transport::{MessageReader, MessageWriter};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::*;

type CompletionSlot = oneshot::Sender<Result<Value, ClientError>>;

/// A request that has been sent and is waiting for its answer
#[derive(Debug)]
struct PendingRequest {
    method: String,
    slot: CompletionSlot,
}

/// The one piece of shared mutable state in the client.
#[derive(Debug)]
struct PendingState {
    /// The id the next request will get.  Starts at 1 and only ever goes up.
    next_id: RequestId,
    pending: HashMap<RequestId, PendingRequest>,

    /// Set once the client is closed, with the error every later call will fail with
    closed: Option<ClientError>,
}

struct Inner {
    state: Mutex<PendingState>,

    /// `None` once the client is closed, so the other side sees EOF on its input
    writer: tokio::sync::Mutex<Option<Box<dyn MessageWriter>>>,

    /// Tells the read loop to stop
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PendingState> {
        // Nothing that runs under this lock can leave the state half-updated, so a poisoned lock
        // is still safe to use
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolve every pending request with `error` and refuse all new ones.
    ///
    /// Only the first call has any effect; the reason the client was closed never changes.
    fn close(&self, error: ClientError) {
        let drained = {
            let mut state = self.state();
            if state.closed.is_some() {
                return;
            }
            state.closed = Some(error.clone());
            std::mem::take(&mut state.pending)
        };

        debug!(pending = drained.len(), %error, "Closing JSON RPC client");
        for (id, request) in drained {
            trace!(id, method = %request.method, "Failing pending request");
            let _ = request.slot.send(Err(error.clone()));
        }

        self.shutdown.cancel();

        // If some caller is in the middle of a write then it holds the lock.  In that case the
        // writer is dropped along with the client instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
    }

    /// Remove a request from the pending set without resolving it, if it's still there.
    fn abandon(&self, id: RequestId) -> Option<PendingRequest> {
        self.state().pending.remove(&id)
    }

    fn dispatch(self: &Arc<Self>, message: ServerMessage) {
        match message {
            ServerMessage::Response { id, payload } => {
                let request = as_request_id(&id).and_then(|id| self.abandon(id));
                match request {
                    Some(request) => {
                        trace!(%id, method = %request.method, ok = payload.is_ok(), "Resolving pending request");
                        // The receiver might have given up already, which is fine
                        let _ = request.slot.send(payload.map_err(ClientError::Rpc));
                    }
                    None => {
                        debug!(%id, "Discarding response that doesn't match any pending request");
                    }
                }
            }
            ServerMessage::Notification { method, .. } => {
                debug!(%method, "Ignoring notification from server");
            }
            ServerMessage::Request { id, method, .. } => {
                debug!(%id, %method, "Server sent a request");
                let (result, error) = if method == "ping" {
                    (Some(serde_json::json!({})), None)
                } else {
                    (
                        None,
                        Some(RpcErrorObject::from_code(ErrorCode::MethodNotFound)),
                    )
                };

                // Answer from a separate task, so the read loop never waits on the writer.  A
                // server that blocks writing its output while we block writing its input would
                // otherwise deadlock both sides.
                let inner = self.clone();
                tokio::spawn(async move {
                    let response = OutgoingResponse {
                        jsonrpc: TwoPointZero,
                        id: &id,
                        result,
                        error,
                    };
                    let outcome = match serde_json::to_vec(&response) {
                        Ok(bytes) => inner.write(&bytes).await,
                        Err(e) => Err(ClientError::Serialize(Arc::new(e))),
                    };
                    if let Err(e) = outcome {
                        warn!(%id, %method, error = %e, "Failed to answer server request");
                    }
                });
            }
            ServerMessage::Invalid(value) => {
                warn!(message = %value, "Discarding message that isn't valid JSON RPC");
            }
        }
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or_else(|| self.closed_error())?;
        writer
            .write_message(bytes)
            .await
            .map_err(|e| ClientError::lost(format!("error writing to server: {e}")))
    }

    fn closed_error(&self) -> ClientError {
        self.state()
            .closed
            .clone()
            .unwrap_or(ClientError::ConnectionClosed)
    }
}

/// Removes a request from the pending set if the caller stops waiting for it, whether because the
/// deadline passed or the caller's future was dropped.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(request) = self.inner.abandon(self.id) {
            trace!(id = self.id, method = %request.method, "Caller stopped waiting for request");
        }
    }
}

/// Handle to a JSON RPC connection.  Cheap to clone; all clones share the same connection.
#[derive(Clone)]
pub struct JsonRpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JsonRpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("JsonRpcClient")
            .field("next_id", &state.next_id)
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl JsonRpcClient {
    /// Start a client on a transport.
    ///
    /// This spawns the read loop on the current tokio runtime.  The loop owns `reader` until the
    /// client is closed, the stream ends, or the last handle to the client is dropped.
    pub fn new(reader: impl MessageReader + 'static, writer: impl MessageWriter + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(PendingState {
                next_id: 1,
                pending: HashMap::new(),
                closed: None,
            }),
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            Box::new(reader),
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    /// Invoke `method` on the server and wait for its answer.
    ///
    /// If `timeout` is given and passes without an answer, the request is retired with
    /// [`ClientError::Timeout`] and its id is never used again; an answer arriving afterwards is
    /// silently discarded.  The deadline starts when this is called and covers everything: waiting
    /// behind other writers, writing the request, and waiting for the answer.
    ///
    /// A request that times out part way through being written leaves an unknown fraction of a
    /// frame on the wire, so the connection is given up as lost as well.
    #[instrument(skip(self, params))]
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, ClientError> {
        let deadline = timeout.map(|after| Instant::now() + after);
        let timed_out = |id: Option<RequestId>| ClientError::Timeout {
            method: method.to_string(),
            id,
            after: timeout.unwrap_or_default(),
        };

        let (id, receiver, guard) = {
            // Allocate the id while holding the writer, so ids also go out on the wire in
            // increasing order
            let Some(mut writer_lock) = before(deadline, self.inner.writer.lock()).await else {
                warn!(?timeout, "Request timed out waiting to be written");
                return Err(timed_out(None));
            };

            let (id, receiver) = {
                let mut state = self.inner.state();
                if let Some(error) = &state.closed {
                    return Err(error.clone());
                }
                let id = state.next_id;
                state.next_id += 1;

                let (slot, receiver) = oneshot::channel();
                state.pending.insert(
                    id,
                    PendingRequest {
                        method: method.to_string(),
                        slot,
                    },
                );
                (id, receiver)
            };

            // From here on, bailing out for any reason takes the request back out of the pending
            // set
            let guard = PendingGuard {
                inner: &self.inner,
                id,
            };

            let request = OutgoingRequest {
                jsonrpc: TwoPointZero,
                id,
                method,
                params: params.as_ref(),
            };
            let bytes =
                serde_json::to_vec(&request).map_err(|e| ClientError::Serialize(Arc::new(e)))?;

            let writer = writer_lock
                .as_mut()
                .ok_or_else(|| self.inner.closed_error())?;
            let written = before(deadline, writer.write_message(&bytes)).await;
            match written {
                Some(written) => written
                    .map_err(|e| ClientError::lost(format!("error writing to server: {e}")))?,
                None => {
                    warn!(
                        id,
                        ?timeout,
                        "Request timed out while being written; giving up on the connection"
                    );
                    self.inner
                        .close(ClientError::lost("timed out part way through writing a request"));
                    // `close` can't take the writer while we hold it
                    *writer_lock = None;
                    return Err(timed_out(Some(id)));
                }
            }

            (id, receiver, guard)
        };

        debug!(id, "Request sent");

        let Some(outcome) = before(deadline, receiver).await else {
            warn!(id, ?timeout, "Request timed out");
            drop(guard);
            return Err(timed_out(Some(id)));
        };
        drop(guard);

        // The sender half is only ever dropped unresolved when the whole client goes away
        outcome.unwrap_or_else(|_| Err(self.inner.closed_error()))
    }

    /// Send a notification to the server.  There is no answer to wait for.
    #[instrument(skip(self, params))]
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        if let Some(error) = self.close_reason() {
            return Err(error);
        }

        let notification = OutgoingNotification {
            jsonrpc: TwoPointZero,
            method,
            params: params.as_ref(),
        };
        let bytes =
            serde_json::to_vec(&notification).map_err(|e| ClientError::Serialize(Arc::new(e)))?;
        self.inner.write(&bytes).await
    }

    /// Close the client deliberately.  Every caller still waiting gets
    /// [`ClientError::ConnectionClosed`], as does every later call.
    ///
    /// Closing an already-closed client does nothing.
    pub fn close(&self) {
        self.inner.close(ClientError::ConnectionClosed);
    }

    /// Close the client because the connection is known to be gone, for example because the
    /// process on the other end exited.
    pub fn connection_lost(&self, reason: impl Into<String>) {
        self.inner.close(ClientError::lost(reason));
    }

    /// If the client is closed, the error that calls fail with.
    pub fn close_reason(&self) -> Option<ClientError> {
        self.inner.state().closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.close_reason().is_some()
    }

    /// Wait until the client is closed, for whatever reason
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await
    }

    /// The number of requests currently waiting for an answer
    pub fn pending_count(&self) -> usize {
        self.inner.state().pending.len()
    }
}

/// Wait for `future`, giving up once `deadline` passes if there is one.
async fn before<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

/// The one and only reader of the transport.
///
/// Holds only a weak reference to the client, so that dropping every client handle ends the loop
/// rather than the loop keeping the client alive forever.
async fn read_loop(
    mut reader: Box<dyn MessageReader>,
    inner: Weak<Inner>,
    shutdown: CancellationToken,
) {
    let reason = loop {
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Client closed; stopping read loop");
                return;
            }
            result = reader.read_message() => result,
        };

        let Some(inner) = inner.upgrade() else {
            debug!("Client dropped; stopping read loop");
            return;
        };

        match result {
            Ok(Some(message)) => inner.dispatch(ServerMessage::from_value(message)),
            Ok(None) => break "server closed its output stream".to_string(),
            Err(e @ FramingError::Malformed { .. }) => {
                warn!(error = %e, "Skipping malformed frame from server");
            }
            Err(e) => break format!("error reading from server: {e}"),
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.close(ClientError::lost(reason));
    }
}
