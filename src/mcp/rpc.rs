//! JSON-RPC plumbing shared by the stdio and event-stream transports:
//! request id allocation, response correlation, inbound classification and
//! notification hand-off.

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::types::{JSONRPC_VERSION, JsonRpcErrorObject, Notification};

/// Callback invoked for every push notification an endpoint sends.
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// JSON-RPC "method not found".
const METHOD_NOT_FOUND: i64 = -32601;

type Waiter = oneshot::Sender<Result<Value>>;

/// In-flight requests keyed by JSON-RPC id.
#[derive(Debug)]
pub(crate) struct PendingRequests {
    endpoint: String,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl PendingRequests {
    pub(crate) fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn register(&self, id: u64) -> oneshot::Receiver<Result<Value>> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id, tx);
        rx
    }

    pub(crate) async fn forget(&self, id: u64) {
        self.waiters.lock().await.remove(&id);
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }

    pub(crate) async fn complete(&self, id: u64, outcome: Result<Value>) {
        if let Some(tx) = self.waiters.lock().await.remove(&id) {
            let _ = tx.send(outcome);
        } else {
            tracing::debug!(endpoint = %self.endpoint, id, "response for unknown request id");
        }
    }

    /// Fail every waiter, e.g. when the connection drops.
    pub(crate) async fn fail_all(&self, make_error: impl Fn() -> Error) {
        let drained: Vec<(u64, Waiter)> = self.waiters.lock().await.drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }

    /// Wait for the response to `id`, honouring the timeout and the
    /// caller's cancellation token.
    pub(crate) async fn wait(
        &self,
        id: u64,
        method: &str,
        rx: oneshot::Receiver<Result<Value>>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, rx) => match res {
                Err(_elapsed) => Err(Error::Timeout { method: method.to_string(), after: timeout }),
                Ok(Err(_dropped)) => Err(Error::connection(&self.endpoint, "response channel dropped")),
                Ok(Ok(result)) => result,
            },
        };

        if matches!(outcome, Err(Error::Cancelled | Error::Timeout { .. })) {
            self.forget(id).await;
        }
        outcome
    }
}

/// Holds the notification callback of one transport.
#[derive(Default)]
pub(crate) struct NotificationSlot {
    handler: OnceLock<NotificationHandler>,
}

impl std::fmt::Debug for NotificationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSlot")
            .field("registered", &self.handler.get().is_some())
            .finish()
    }
}

impl NotificationSlot {
    /// Register the callback; only the first registration wins.
    pub(crate) fn set(&self, handler: NotificationHandler) -> bool {
        self.handler.set(handler).is_ok()
    }

    pub(crate) fn deliver(&self, endpoint: &str, notification: Notification) {
        match self.handler.get() {
            Some(handler) => handler(notification),
            None => tracing::debug!(
                endpoint = %endpoint,
                method = %notification.method,
                "no notification handler registered, dropping"
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

/// A message received from an endpoint.
#[derive(Debug)]
pub(crate) enum Inbound {
    Response { id: u64, outcome: Result<Value> },
    Notification(Notification),
    Request { id: Value, method: String },
}

/// Classify one JSON-RPC message; `None` for anything that is not one.
pub(crate) fn classify(text: &str) -> Option<Inbound> {
    let raw: RawMessage = serde_json::from_str(text).ok()?;

    match (raw.id, raw.method) {
        (Some(id), Some(method)) => Some(Inbound::Request { id, method }),
        (None, Some(method)) => Some(Inbound::Notification(Notification {
            method,
            params: raw.params,
        })),
        (Some(id), None) => {
            let id = id.as_u64()?;
            let outcome = match raw.error {
                Some(err) => Err(Error::Rpc {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Some(Inbound::Response { id, outcome })
        }
        (None, None) => None,
    }
}

/// Reply to a server-initiated request. Only `ping` is supported.
pub(crate) fn reply_to_request(id: Value, method: &str) -> Value {
    if method == "ping" {
        json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": {} })
    } else {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": { "code": METHOD_NOT_FOUND, "message": format!("method not supported: {method}") }
        })
    }
}

/// Route one inbound text frame. Returns a reply that must be sent back
/// to the endpoint, if any.
pub(crate) async fn route_inbound(
    endpoint: &str,
    text: &str,
    pending: &PendingRequests,
    notifications: &NotificationSlot,
) -> Option<Value> {
    match classify(text) {
        Some(Inbound::Response { id, outcome }) => {
            pending.complete(id, outcome).await;
            None
        }
        Some(Inbound::Notification(notification)) => {
            notifications.deliver(endpoint, notification);
            None
        }
        Some(Inbound::Request { id, method }) => {
            tracing::debug!(endpoint = %endpoint, method = %method, "server request");
            Some(reply_to_request(id, &method))
        }
        None => {
            tracing::debug!(endpoint = %endpoint, line = %text, "ignoring non JSON-RPC output");
            None
        }
    }
}
