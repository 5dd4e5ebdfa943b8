//! Subprocess transport: newline-delimited JSON-RPC over a child's
//! stdin/stdout. Stderr lines are forwarded to the log.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::{
    io::AsyncWriteExt,
    process::{Child, Command},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::codec::{FramedRead, LinesCodec};

use crate::error::{Error, Result};
use crate::mcp::rpc::{NotificationHandler, NotificationSlot, PendingRequests, route_inbound};
use crate::mcp::transport::{self, CallContext, RpcLink, Transport};
use crate::mcp::types::{
    CallToolResult, InitializeResult, JsonObject, JsonRpcNotification, JsonRpcRequest,
    OperationDescriptor,
};

/// Upper bound for one JSON-RPC line from the child.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub struct StdioTransport {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    pending: Arc<PendingRequests>,
    notifications: Arc<NotificationSlot>,
    alive: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
    default_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the endpoint process and start the reader/writer tasks.
    /// The handshake is left to [`Transport::initialize`].
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::connection(name, format!("failed to spawn '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::connection(name, "missing stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::connection(name, "missing stdout"))?;
        let stderr = child.stderr.take();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let pending = Arc::new(PendingRequests::new(name));
        let notifications = Arc::new(NotificationSlot::default());
        let alive = Arc::new(AtomicBool::new(true));
        let mut tasks = Vec::with_capacity(3);

        // Writer task: each JSON-RPC message is a single line, newline-terminated.
        let writer_name = name.to_string();
        let writer_alive = Arc::clone(&alive);
        let writer_pending = Arc::clone(&pending);
        tasks.push(tokio::spawn(async move {
            let mut w = stdin;
            while let Some(line) = rx.recv().await {
                let write = async {
                    w.write_all(line.as_bytes()).await?;
                    w.write_all(b"\n").await?;
                    w.flush().await
                };
                if let Err(e) = write.await {
                    tracing::warn!(endpoint = %writer_name, error = %e, "stdin write failed");
                    writer_alive.store(false, Ordering::SeqCst);
                    writer_pending
                        .fail_all(|| Error::connection(&writer_name, format!("stdin closed: {e}")))
                        .await;
                    break;
                }
            }
        }));

        // Reader task: route responses, notifications and server requests.
        let reader_name = name.to_string();
        let reader_alive = Arc::clone(&alive);
        let reader_pending = Arc::clone(&pending);
        let reader_notifications = Arc::clone(&notifications);
        let reply_tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines =
                FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(endpoint = %reader_name, error = %e, "stdout read failed");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(reply) =
                    route_inbound(&reader_name, line, &reader_pending, &reader_notifications).await
                {
                    let _ = reply_tx.send(reply.to_string());
                }
            }

            tracing::info!(endpoint = %reader_name, "endpoint stdout closed");
            reader_alive.store(false, Ordering::SeqCst);
            reader_pending
                .fail_all(|| Error::connection(&reader_name, "process exited or closed stdout"))
                .await;
        }));

        if let Some(stderr) = stderr {
            let stderr_name = name.to_string();
            tasks.push(tokio::spawn(async move {
                let mut lines = FramedRead::new(stderr, LinesCodec::new());
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!(endpoint = %stderr_name, "stderr: {line}");
                }
            }));
        }

        tracing::debug!(endpoint = %name, command = %command, ?args, "spawned endpoint process");

        Ok(Self {
            name: name.to_string(),
            tx,
            pending,
            notifications,
            alive,
            child: Mutex::new(Some(child)),
            tasks,
            default_timeout,
        })
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::connection(&self.name, "endpoint process is not running"))
        }
    }

    fn send_line(&self, msg: &impl serde::Serialize) -> Result<()> {
        let line = serde_json::to_string(msg)?;
        self.tx
            .send(line)
            .map_err(|e| Error::connection(&self.name, format!("stdio writer task ended: {e}")))
    }
}

#[async_trait]
impl RpcLink for StdioTransport {
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
        if let Err(e) = self.send_line(&JsonRpcRequest::new(id, method, params)) {
            self.pending.forget(id).await;
            return Err(e);
        }

        self.pending
            .wait(id, method, rx, ctx.timeout_or(self.default_timeout), &ctx.cancel)
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_alive()?;
        self.send_line(&JsonRpcNotification::new(method, params))
    }
}

#[async_trait]
impl Transport for StdioTransport {
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
        for task in &self.tasks {
            task.abort();
        }
        self.pending
            .fail_all(|| Error::Closed(self.name.clone()))
            .await;

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(endpoint = %self.name, error = %e, "kill failed, process already gone");
            }
        }
        tracing::debug!(endpoint = %self.name, "stdio transport closed");
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
