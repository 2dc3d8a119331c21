//! JSON-RPC 2.0 over line-delimited JSON.
//!
//! The client role sends requests with monotonically increasing integer ids
//! and parks a oneshot per id in [`PendingCalls`]. The backend may also call
//! back into us: a message carrying both `id` and `method` is a server
//! request, answered through [`RpcPeer::respond`] with the same id.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::{io::AsyncRead, sync::oneshot};
use tokio_util::codec::FramedRead;

use crate::codec::{FrameWriter, JsonLineCodec};

/// Method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error while handling a request.
pub const INTERNAL_ERROR: i64 = -32603;

/// Client-assigned request id.
pub type RequestId = u64;

/// RPC error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("RPC call '{0}' timed out")]
    Timeout(String),
    #[error("RPC call cancelled")]
    Cancelled,
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RpcError {
    fn from_error_object(error: &Value) -> Self {
        Self::Remote {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(INTERNAL_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            data: error.get("data").cloned(),
        }
    }
}

/// Outcome delivered to a pending call.
pub type CallOutcome = Result<Value, RpcError>;

/// One inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Backend calling back into the client; must be answered.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// Answer to one of our requests.
    Response { id: RequestId, outcome: CallOutcome },
    /// Fire-and-forget message from the backend.
    Notification { method: String, params: Value },
    /// Anything else.
    Invalid(Value),
}

impl Incoming {
    /// Classify a decoded message.
    #[must_use]
    pub fn classify(message: Value) -> Self {
        let Some(obj) = message.as_object() else {
            return Self::Invalid(message);
        };
        let id = obj.get("id").filter(|id| !id.is_null());
        let method = obj.get("method").and_then(Value::as_str);
        let result = obj.get("result");
        let error = obj.get("error");

        match (id, method, result, error) {
            (Some(id), Some(method), None, None) => Self::Request {
                id: id.clone(),
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
            },
            (Some(id), _, Some(result), None) => match response_id(id) {
                Some(id) => Self::Response {
                    id,
                    outcome: Ok(result.clone()),
                },
                None => Self::Invalid(message),
            },
            (Some(id), _, None, Some(error)) => match response_id(id) {
                Some(id) => Self::Response {
                    id,
                    outcome: Err(RpcError::from_error_object(error)),
                },
                None => Self::Invalid(message),
            },
            (None, Some(method), _, _) => Self::Notification {
                method: method.to_string(),
                params: obj.get("params").cloned().unwrap_or(Value::Null),
            },
            _ => Self::Invalid(message),
        }
    }
}

fn response_id(id: &Value) -> Option<RequestId> {
    id.as_u64()
        .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

/// Table of outstanding calls keyed by request id.
///
/// Each entry is removed exactly once: by its response, by its timeout, or
/// by [`PendingCalls::reject_all`].
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<RequestId, oneshot::Sender<CallOutcome>>>,
}

impl PendingCalls {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, oneshot::Sender<CallOutcome>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a call and return the receiver its outcome arrives on.
    pub fn register(&self, id: RequestId) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        rx
    }

    /// Deliver an outcome. Returns `false` for unknown ids.
    pub fn resolve(&self, id: RequestId, outcome: CallOutcome) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            return false;
        };
        // The caller may have stopped waiting; the entry is gone either way.
        let _ = tx.send(outcome);
        true
    }

    /// Drop a call without delivering anything.
    pub fn remove(&self, id: RequestId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Reject every outstanding call with [`RpcError::Cancelled`].
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Cancelled));
        }
        count
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Client side of a JSON-RPC connection.
#[derive(Clone)]
pub struct RpcPeer {
    writer: FrameWriter,
    pending: Arc<PendingCalls>,
    next_id: Arc<AtomicU64>,
    default_timeout: Duration,
}

impl RpcPeer {
    /// Create a peer writing frames to `writer`.
    #[must_use]
    pub fn new(writer: FrameWriter, default_timeout: Duration) -> Self {
        Self {
            writer,
            pending: Arc::new(PendingCalls::default()),
            next_id: Arc::new(AtomicU64::new(1)),
            default_timeout,
        }
    }

    /// Call `method` with the default timeout.
    ///
    /// # Errors
    /// Returns the remote error, a timeout, a cancellation from [`RpcPeer::close`],
    /// or a transport failure.
    pub async fn call(&self, method: &str, params: Value) -> CallOutcome {
        self.call_with_timeout(method, params, self.default_timeout)
            .await
    }

    /// Call `method`, giving up after `timeout`.
    ///
    /// # Errors
    /// See [`RpcPeer::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> CallOutcome {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(id);
        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::debug!(id, method, "Sending RPC request");
        if let Err(e) = self.writer.send(&frame).await {
            self.pending.remove(id);
            return Err(RpcError::Transport(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::Cancelled),
            Err(_) => {
                self.pending.remove(id);
                tracing::warn!(id, method, ?timeout, "RPC call timed out");
                Err(RpcError::Timeout(method.to_string()))
            }
        }
    }

    /// Send a notification.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        self.send(&json!({"jsonrpc": "2.0", "method": method, "params": params}))
            .await
    }

    /// Answer a server request.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn respond(&self, id: Value, result: Value) -> Result<(), RpcError> {
        self.send(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
            .await
    }

    /// Answer a server request with an error.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn respond_error(&self, id: Value, code: i64, message: &str) -> Result<(), RpcError> {
        self.send(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": code, "message": message},
        }))
        .await
    }

    async fn send(&self, frame: &Value) -> Result<(), RpcError> {
        self.writer
            .send(frame)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Route a response to its pending call.
    pub fn resolve(&self, id: RequestId, outcome: CallOutcome) -> bool {
        self.pending.resolve(id, outcome)
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Reject all outstanding calls and close the writer. Idempotent.
    pub async fn close(&self) -> usize {
        let rejected = self.pending.reject_all();
        self.writer.close().await;
        rejected
    }
}

/// Handler for backend-initiated traffic.
#[async_trait]
pub trait RpcService: Send + Sync {
    /// A server request. Must eventually be answered with the same `id`.
    async fn on_request(&self, id: Value, method: String, params: Value);

    /// A notification.
    async fn on_notification(&self, method: String, params: Value);

    /// The inbound stream ended.
    async fn on_closed(&self);
}

/// Read frames from `reader` until EOF, dispatching each by shape.
pub async fn serve<R>(reader: R, peer: RpcPeer, service: Arc<dyn RpcService>)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, JsonLineCodec::new());

    while let Some(item) = framed.next().await {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("RPC stream read failed: {e}");
                break;
            }
        };

        match Incoming::classify(message) {
            Incoming::Response { id, outcome } => {
                if !peer.resolve(id, outcome) {
                    tracing::warn!(id, "Response for unknown request");
                }
            }
            Incoming::Request { id, method, params } => {
                tracing::debug!(%id, %method, "Server request");
                service.on_request(id, method, params).await;
            }
            Incoming::Notification { method, params } => {
                service.on_notification(method, params).await;
            }
            Incoming::Invalid(value) => {
                tracing::warn!(%value, "Ignoring message that is not JSON-RPC");
            }
        }
    }

    service.on_closed().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    use super::*;

    #[test]
    fn classifies_by_shape() {
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": 7, "method": "fs/read_text_file", "params": {}})),
            Incoming::Request { method, .. } if method == "fs/read_text_file"
        ));
        assert_eq!(
            Incoming::classify(json!({"id": 3, "result": {"ok": true}})),
            Incoming::Response {
                id: 3,
                outcome: Ok(json!({"ok": true}))
            }
        );
        assert!(matches!(
            Incoming::classify(json!({"id": "4", "error": {"code": -32000, "message": "nope"}})),
            Incoming::Response { id: 4, outcome: Err(RpcError::Remote { code: -32000, .. }) }
        ));
        assert!(matches!(
            Incoming::classify(json!({"method": "session/update", "params": {"x": 1}})),
            Incoming::Notification { method, .. } if method == "session/update"
        ));
        assert!(matches!(
            Incoming::classify(json!({"id": 1, "result": 1, "error": {}})),
            Incoming::Invalid(_)
        ));
        assert!(matches!(Incoming::classify(json!([1, 2])), Incoming::Invalid(_)));
    }

    #[test]
    fn pending_entries_resolve_once() {
        let pending = PendingCalls::default();
        let mut rx = pending.register(1);
        assert!(pending.resolve(1, Ok(json!(1))));
        assert!(!pending.resolve(1, Ok(json!(2))));
        assert_eq!(rx.try_recv().unwrap(), Ok(json!(1)));
    }

    #[tokio::test]
    async fn close_rejects_every_outstanding_call_once() {
        let (client, _server) = tokio::io::duplex(4096);
        let peer = RpcPeer::new(FrameWriter::new(client), Duration::from_secs(30));

        let first = tokio::spawn({
            let peer = peer.clone();
            async move { peer.call("a", json!({})).await }
        });
        let second = tokio::spawn({
            let peer = peer.clone();
            async move { peer.call("b", json!({})).await }
        });

        while peer.pending_len() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(peer.close().await, 2);
        assert_eq!(peer.close().await, 0);
        assert_eq!(first.await.unwrap(), Err(RpcError::Cancelled));
        assert_eq!(second.await.unwrap(), Err(RpcError::Cancelled));
        assert_eq!(peer.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_call_is_removed() {
        let (client, _server) = tokio::io::duplex(4096);
        let peer = RpcPeer::new(FrameWriter::new(client), Duration::from_millis(100));

        let outcome = peer.call("slow", json!({})).await;
        assert_eq!(outcome, Err(RpcError::Timeout("slow".into())));
        assert_eq!(peer.pending_len(), 0);
        assert!(!peer.resolve(1, Ok(Value::Null)));
    }

    struct Echo {
        peer: RpcPeer,
        closed: tokio::sync::Notify,
    }

    #[async_trait]
    impl RpcService for Echo {
        async fn on_request(&self, id: Value, method: String, _params: Value) {
            self.peer.respond(id, json!({"method": method})).await.unwrap();
        }

        async fn on_notification(&self, _method: String, _params: Value) {}

        async fn on_closed(&self) {
            self.closed.notify_one();
        }
    }

    #[tokio::test]
    async fn serve_answers_server_requests_and_routes_responses() {
        let (client_out, server_in) = tokio::io::duplex(4096);
        let (mut server_out, client_in) = tokio::io::duplex(4096);

        let peer = RpcPeer::new(FrameWriter::new(client_out), Duration::from_secs(5));
        let echo = Arc::new(Echo {
            peer: peer.clone(),
            closed: tokio::sync::Notify::new(),
        });
        tokio::spawn(serve(client_in, peer.clone(), echo.clone()));

        let call = tokio::spawn({
            let peer = peer.clone();
            async move { peer.call("initialize", json!({})).await }
        });

        let mut server_lines = BufReader::new(server_in).lines();
        let request: Value =
            serde_json::from_str(&server_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["id"], 1);

        server_out
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":99,\"method\":\"ping\"}\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ready\":true}}\n")
            .await
            .unwrap();

        let reply: Value =
            serde_json::from_str(&server_lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["id"], 99);
        assert_eq!(reply["result"]["method"], "ping");
        assert_eq!(call.await.unwrap(), Ok(json!({"ready": true})));

        drop(server_out);
        echo.closed.notified().await;
    }
}
