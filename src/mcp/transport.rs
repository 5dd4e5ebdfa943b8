//! Transport abstraction over the two endpoint kinds.
//!
//! A [`Transport`] is one live connection. A [`Connector`] opens fresh
//! transports; the connection manager calls it on every (re)connect.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::mcp::config::{EndpointConfig, EndpointKind};
pub use crate::mcp::rpc::NotificationHandler;
use crate::mcp::sse::SseTransport;
use crate::mcp::stdio::StdioTransport;
use crate::mcp::types::{
    CallToolResult, InitializeResult, JsonObject, ListToolsResult, OperationDescriptor,
    PROTOCOL_VERSION,
};

/// Default per-request timeout when neither the caller nor the endpoint
/// configuration sets one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-call options: an optional timeout and a cancellation token.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CallContext {
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn cancelled_by(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The caller's timeout, or `default` when none was set.
    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// A live bidirectional channel to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Capability negotiation; must be the first request.
    async fn initialize(&self, ctx: &CallContext) -> Result<InitializeResult>;

    /// All operations the endpoint advertises.
    async fn list_operations(&self, ctx: &CallContext) -> Result<Vec<OperationDescriptor>>;

    /// Invoke `operation` with `arguments`.
    async fn call(
        &self,
        operation: &str,
        arguments: Option<JsonObject>,
        ctx: &CallContext,
    ) -> Result<CallToolResult>;

    /// Ask the endpoint to push updates for `uri`.
    async fn subscribe(&self, uri: &str, ctx: &CallContext) -> Result<()>;

    /// Register the callback that receives push notifications.
    fn on_notification(&self, handler: NotificationHandler);

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Opens new transports for one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// Connector that picks the transport from the endpoint kind.
#[derive(Debug, Clone)]
pub struct EndpointConnector {
    config: EndpointConfig,
}

impl EndpointConnector {
    pub fn new(config: EndpointConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }
}

#[async_trait]
impl Connector for EndpointConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let timeout = self.config.timeout().unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        tracing::debug!(endpoint = %self.config.name, kind = self.config.kind.label(), "opening transport");
        let transport: Arc<dyn Transport> = match &self.config.kind {
            EndpointKind::Subprocess { command, args, env } => Arc::new(StdioTransport::spawn(
                &self.config.name,
                command,
                args,
                env,
                timeout,
            )?),
            EndpointKind::EventStream { base_url, headers } => Arc::new(
                SseTransport::connect(&self.config.name, base_url, headers, timeout).await?,
            ),
        };
        Ok(transport)
    }
}

/// Request/notify primitives a transport provides to the shared MCP
/// method helpers below.
#[async_trait]
pub(crate) trait RpcLink: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn request(&self, method: &str, params: Option<Value>, ctx: &CallContext)
    -> Result<Value>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;
}

pub(crate) async fn initialize<L: RpcLink + ?Sized>(
    link: &L,
    ctx: &CallContext,
) -> Result<InitializeResult> {
    let params = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": format!("{}-client", link.endpoint()),
            "version": env!("CARGO_PKG_VERSION")
        }
    });

    let result = link.request("initialize", Some(params), ctx).await?;
    let init: InitializeResult = serde_json::from_value(result)?;
    link.notify("notifications/initialized", None).await?;
    Ok(init)
}

pub(crate) async fn list_operations<L: RpcLink + ?Sized>(
    link: &L,
    ctx: &CallContext,
) -> Result<Vec<OperationDescriptor>> {
    let mut out = Vec::new();
    let mut cursor: Option<String> = None;

    loop {
        let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
        let result = link.request("tools/list", params, ctx).await?;
        let page: ListToolsResult = serde_json::from_value(result)?;
        out.extend(page.tools);

        match page.next_cursor {
            Some(next) if !next.is_empty() => cursor = Some(next),
            _ => break,
        }
    }

    Ok(out)
}

pub(crate) async fn call_operation<L: RpcLink + ?Sized>(
    link: &L,
    operation: &str,
    arguments: Option<JsonObject>,
    ctx: &CallContext,
) -> Result<CallToolResult> {
    let params = json!({
        "name": operation,
        "arguments": arguments.unwrap_or_default()
    });
    let result = link.request("tools/call", Some(params), ctx).await?;
    Ok(serde_json::from_value(result)?)
}

pub(crate) async fn subscribe<L: RpcLink + ?Sized>(
    link: &L,
    uri: &str,
    ctx: &CallContext,
) -> Result<()> {
    link.request("resources/subscribe", Some(json!({ "uri": uri })), ctx)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;

    /// Link that answers from a script and records what was sent.
    #[derive(Default)]
    struct ScriptedLink {
        sent: Mutex<Vec<(String, Option<Value>)>>,
        responses: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl RpcLink for ScriptedLink {
        fn endpoint(&self) -> &str {
            "scripted"
        }

        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
            _ctx: &CallContext,
        ) -> Result<Value> {
            self.sent.lock().unwrap().push((method.to_string(), params));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(Error::Protocol("script exhausted".to_string()));
            }
            Ok(responses.remove(0))
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
            self.sent.lock().unwrap().push((method.to_string(), params));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_initialize_sends_handshake_and_initialized() {
        let link = ScriptedLink::default();
        link.responses.lock().unwrap().push(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "time", "version": "1.2.0" }
        }));

        let init = initialize(&link, &CallContext::default()).await.unwrap();
        assert_eq!(init.server_info.unwrap().name, "time");

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent[0].0, "initialize");
        let params = sent[0].1.as_ref().unwrap();
        assert_eq!(params["clientInfo"]["name"], json!("scripted-client"));
        assert_eq!(sent[1].0, "notifications/initialized");
    }

    #[tokio::test]
    async fn test_list_operations_follows_cursor() {
        let link = ScriptedLink::default();
        link.responses.lock().unwrap().extend([
            json!({ "tools": [{ "name": "a", "inputSchema": {} }], "nextCursor": "page-2" }),
            json!({ "tools": [{ "name": "b", "inputSchema": {} }] }),
        ]);

        let ops = list_operations(&link, &CallContext::default()).await.unwrap();
        let names: Vec<&str> = ops.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let sent = link.sent.lock().unwrap();
        assert_eq!(sent[0].1, None);
        assert_eq!(sent[1].1, Some(json!({ "cursor": "page-2" })));
    }

    #[tokio::test]
    async fn test_call_operation_defaults_to_empty_arguments() {
        let link = ScriptedLink::default();
        link.responses
            .lock()
            .unwrap()
            .push(json!({ "content": [{ "type": "text", "text": "12:00" }] }));

        let result = call_operation(&link, "now", None, &CallContext::default())
            .await
            .unwrap();
        assert!(!result.is_error);

        let sent = link.sent.lock().unwrap();
        assert_eq!(
            sent[0].1,
            Some(json!({ "name": "now", "arguments": {} }))
        );
    }

    #[test]
    fn test_call_context_timeout_or() {
        let ctx = CallContext::default();
        assert_eq!(ctx.timeout_or(Duration::from_secs(3)), Duration::from_secs(3));
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        assert_eq!(ctx.timeout_or(Duration::from_secs(3)), Duration::from_secs(1));
    }
}
