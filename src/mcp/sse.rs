//! Event-stream transport.
//!
//! A long-lived `GET` on the base URL carries server pushes as SSE. The
//! first `endpoint` event names the URL that requests are POSTed to;
//! responses and notifications come back as `message` events.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{
    StatusCode,
    header::{ACCEPT, HeaderMap, HeaderName, HeaderValue},
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::mcp::rpc::{NotificationHandler, NotificationSlot, PendingRequests, route_inbound};
use crate::mcp::transport::{self, CallContext, RpcLink, Transport};
use crate::mcp::types::{
    CallToolResult, InitializeResult, JsonObject, JsonRpcNotification, JsonRpcRequest,
    OperationDescriptor,
};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Parse one SSE frame (the text between two blank lines).
///
/// Returns `None` for frames without any `data:` line (comments, retry
/// hints, keep-alives).
pub fn parse_sse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Option<String> = None;

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.to_string()),
            "data" => match data.as_mut() {
                Some(d) => {
                    d.push('\n');
                    d.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            _ => {}
        }
    }

    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data?,
    })
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/// Split a byte stream into SSE events. A trailing partial frame is
/// discarded when the stream ends.
pub fn sse_events<S, B, E>(endpoint: String, bytes: S) -> impl Stream<Item = Result<SseEvent>> + Send
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: Display + Send,
{
    async_stream::try_stream! {
        let mut buf = Vec::<u8>::new();

        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(|e| Error::connection(&endpoint, format!("event stream read failed: {e}")))?;
            buf.extend(chunk.as_ref().iter().copied().filter(|b| *b != b'\r'));

            while let Some(pos) = find_double_newline(&buf) {
                let frame = buf.drain(..pos + 2).collect::<Vec<_>>();
                let text = String::from_utf8_lossy(&frame);
                if let Some(event) = parse_sse_frame(&text) {
                    yield event;
                }
            }
        }
    }
}

fn build_headers(endpoint: &str, headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| Error::Config(format!("endpoint '{endpoint}': invalid header name '{k}': {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| Error::Config(format!("endpoint '{endpoint}': invalid value for header '{k}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Classify a non-success POST status.
fn status_error(endpoint: &str, status: StatusCode) -> Error {
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE || status.is_server_error() {
        Error::connection(endpoint, format!("POST returned HTTP {status}"))
    } else {
        Error::Protocol(format!("endpoint '{endpoint}' rejected request: HTTP {status}"))
    }
}

/// Sends JSON-RPC messages to the endpoint's POST URL.
#[derive(Debug)]
struct Poster {
    name: String,
    http: reqwest::Client,
    url: Url,
    headers: HeaderMap,
}

impl Poster {
    async fn post(&self, body: &impl serde::Serialize) -> Result<()> {
        let resp = self
            .http
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(body)
            .send()
            .await
            .map_err(|e| Error::connection(&self.name, format!("POST failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(status_error(&self.name, status))
        }
    }
}

#[derive(Debug)]
pub struct SseTransport {
    name: String,
    poster: Arc<Poster>,
    pending: Arc<PendingRequests>,
    notifications: Arc<NotificationSlot>,
    alive: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    default_timeout: Duration,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event. The
    /// handshake is left to [`Transport::initialize`].
    pub async fn connect(
        name: &str,
        base_url: &str,
        headers: &HashMap<String, String>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("endpoint '{name}': invalid base URL '{base_url}': {e}")))?;
        let headers = build_headers(name, headers)?;
        let http = reqwest::Client::new();

        let resp = http
            .get(base.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| Error::connection(name, format!("event stream request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::connection(
                name,
                format!("event stream returned HTTP {}", resp.status()),
            ));
        }

        let mut events = Box::pin(sse_events(name.to_string(), resp.bytes_stream()));

        let wait_endpoint = async {
            while let Some(event) = events.next().await {
                let event = event?;
                if event.event == "endpoint" {
                    let target = event.data.trim();
                    return base.join(target).map_err(|e| {
                        Error::Protocol(format!("endpoint '{name}' sent invalid POST URL '{target}': {e}"))
                    });
                }
                tracing::debug!(endpoint = %name, event = %event.event, "event before endpoint, ignoring");
            }
            Err(Error::connection(name, "event stream closed before endpoint event"))
        };
        let post_url = tokio::time::timeout(default_timeout, wait_endpoint)
            .await
            .map_err(|_elapsed| Error::connection(name, "timed out waiting for endpoint event"))??;

        tracing::debug!(endpoint = %name, url = %post_url, "event stream ready");

        let poster = Arc::new(Poster {
            name: name.to_string(),
            http,
            url: post_url,
            headers,
        });
        let pending = Arc::new(PendingRequests::new(name));
        let notifications = Arc::new(NotificationSlot::default());
        let alive = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let reader_name = name.to_string();
        let reader_poster = Arc::clone(&poster);
        let reader_pending = Arc::clone(&pending);
        let reader_notifications = Arc::clone(&notifications);
        let reader_alive = Arc::clone(&alive);
        let reader_cancel = cancel.clone();
        let reader = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = reader_cancel.cancelled() => break,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(event)) if event.event == "message" => {
                        if let Some(reply) = route_inbound(
                            &reader_name,
                            &event.data,
                            &reader_pending,
                            &reader_notifications,
                        )
                        .await
                        {
                            if let Err(e) = reader_poster.post(&reply).await {
                                tracing::warn!(endpoint = %reader_name, error = %e, "failed to answer server request");
                            }
                        }
                    }
                    Some(Ok(event)) => {
                        tracing::debug!(endpoint = %reader_name, event = %event.event, "ignoring event");
                    }
                    Some(Err(e)) => {
                        tracing::warn!(endpoint = %reader_name, error = %e, "event stream failed");
                        break;
                    }
                    None => break,
                }
            }

            tracing::info!(endpoint = %reader_name, "event stream closed");
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending
                .fail_all(|| Error::connection(&reader_name, "event stream closed"))
                .await;
        });

        Ok(Self {
            name: name.to_string(),
            poster,
            pending,
            notifications,
            alive,
            cancel,
            reader,
            default_timeout,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::connection(&self.name, "event stream is closed"))
        }
    }
}

#[async_trait]
impl RpcLink for SseTransport {
    fn endpoint(&self) -> &str {
        &self.name
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &CallContext,
    ) -> Result<Value> {
        // Register before the liveness check: the reader marks the link
        // dead before failing every registered waiter.
        let id = self.pending.next_id();
        let rx = self.pending.register(id).await;
        if let Err(e) = self.ensure_alive() {
            self.pending.forget(id).await;
            return Err(e);
        }
        if let Err(e) = self.poster.post(&JsonRpcRequest::new(id, method, params)).await {
            self.pending.forget(id).await;
            return Err(e);
        }

        self.pending
            .wait(id, method, rx, ctx.timeout_or(self.default_timeout), &ctx.cancel)
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_alive()?;
        self.poster.post(&JsonRpcNotification::new(method, params)).await
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn initialize(&self, ctx: &CallContext) -> Result<InitializeResult> {
        transport::initialize(self, ctx).await
    }

    async fn list_operations(&self, ctx: &CallContext) -> Result<Vec<OperationDescriptor>> {
        transport::list_operations(self, ctx).await
    }

    async fn call(
        &self,
        operation: &str,
        arguments: Option<JsonObject>,
        ctx: &CallContext,
    ) -> Result<CallToolResult> {
        transport::call_operation(self, operation, arguments, ctx).await
    }

    async fn subscribe(&self, uri: &str, ctx: &CallContext) -> Result<()> {
        transport::subscribe(self, uri, ctx).await
    }

    fn on_notification(&self, handler: NotificationHandler) {
        if !self.notifications.set(handler) {
            tracing::warn!(endpoint = %self.name, "notification handler already registered");
        }
    }

    async fn close(&self) -> Result<()> {
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.pending
            .fail_all(|| Error::Closed(self.name.clone()))
            .await;
        tracing::debug!(endpoint = %self.name, "event-stream transport closed");
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.reader.abort();
    }
}
