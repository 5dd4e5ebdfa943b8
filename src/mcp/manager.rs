//! Per-endpoint connection manager.
//!
//! Owns the live [`Transport`] of one endpoint and keeps it alive across
//! failures. Callers never wait for a reconnect: a call without a live
//! transport fails fast with [`Error::NotConnected`] and schedules a
//! reconnect on the background loop.

use std::{
    sync::{
        Arc, Mutex as StdMutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::transport::{CallContext, Connector, Transport};
use crate::mcp::types::{CallToolResult, JsonObject, Notification, OperationDescriptor};

/// Observable lifecycle of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    Terminated,
}

/// Linear backoff: attempt `n` waits `n * backoff_unit` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_unit: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub reconnect: ReconnectPolicy,
    /// Capacity of the notification outbox.
    pub outbox_capacity: usize,
    /// Bound for the `initialize` handshake and the diagnostic listing.
    pub handshake_timeout: Duration,
    /// List operations after connecting and log them.
    pub list_on_connect: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            outbox_capacity: 16,
            handshake_timeout: Duration::from_secs(15),
            list_on_connect: true,
        }
    }
}

/// Fans push notifications out to every live subscriber stream. Each
/// stream has its own bounded buffer.
#[derive(Debug)]
struct Outbox {
    endpoint: String,
    capacity: usize,
    /// `None` once closed.
    subscribers: StdMutex<Option<Vec<mpsc::Sender<Notification>>>>,
}

impl Outbox {
    fn new(endpoint: &str, capacity: usize) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            capacity: capacity.max(1),
            subscribers: StdMutex::new(Some(Vec::new())),
        }
    }

    /// Never blocks; a stream whose buffer is full misses the notification.
    fn push(&self, notification: Notification) {
        let mut guard = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = guard.as_mut() else {
            tracing::debug!(endpoint = %self.endpoint, method = %notification.method, "outbox closed, dropping notification");
            return;
        };

        subscribers.retain(|tx| !tx.is_closed());
        if subscribers.is_empty() {
            tracing::debug!(endpoint = %self.endpoint, method = %notification.method, "no subscriber, dropping notification");
            return;
        }

        for tx in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(n)) = tx.try_send(notification.clone()) {
                tracing::warn!(endpoint = %self.endpoint, method = %n.method, "notification outbox full, dropping");
            }
        }
    }

    /// A fresh receiving end, or `None` once closed.
    fn attach(&self) -> Option<mpsc::Receiver<Notification>> {
        let mut guard = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let subscribers = guard.as_mut()?;
        subscribers.retain(|tx| !tx.is_closed());
        let (tx, rx) = mpsc::channel(self.capacity);
        subscribers.push(tx);
        Some(rx)
    }

    /// Drop every sender so all streams end. Returns `false` when already
    /// closed.
    fn close(&self) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

#[derive(Debug)]
struct Inner {
    name: String,
    connector: Arc<dyn Connector>,
    settings: ManagerSettings,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    connect_lock: Mutex<()>,
    signal_tx: mpsc::Sender<()>,
    outbox: Arc<Outbox>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    lifetime: CancellationToken,
    closed: AtomicBool,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Terminated || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    /// Queue a reconnect. A full slot means one is already pending.
    fn signal_reconnect(&self) -> bool {
        self.signal_tx.try_send(()).is_ok()
    }

    async fn has_transport(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Open, handshake and install a fresh transport. Serialized per
    /// manager; the previous transport is closed first.
    async fn connect(&self, phase: ConnectionState) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.lifetime.is_cancelled() {
            return Err(Error::Closed(self.name.clone()));
        }
        self.set_state(phase);

        let previous = self.transport.write().await.take();
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::debug!(endpoint = %self.name, error = %e, "closing previous transport failed");
            }
        }

        let opened = tokio::select! {
            () = self.lifetime.cancelled() => Err(Error::Closed(self.name.clone())),
            opened = self.open() => opened,
        };

        match opened {
            Ok(transport) => {
                *self.transport.write().await = Some(transport);
                self.attempts.store(0, Ordering::SeqCst);
                self.set_state(ConnectionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<Arc<dyn Transport>> {
        let transport = self.connector.connect().await?;
        let ctx = CallContext::with_timeout(self.settings.handshake_timeout)
            .cancelled_by(self.lifetime.child_token());

        let init = match transport.initialize(&ctx).await {
            Ok(init) => init,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        tracing::info!(
            endpoint = %self.name,
            server = init.server_info.as_ref().map_or("unknown", |s| s.name.as_str()),
            protocol_version = %init.protocol_version,
            "endpoint initialized"
        );

        if self.settings.list_on_connect {
            match transport.list_operations(&ctx).await {
                Ok(ops) => {
                    tracing::info!(endpoint = %self.name, count = ops.len(), "operations available");
                    for op in &ops {
                        tracing::debug!(
                            endpoint = %self.name,
                            operation = %op.name,
                            description = op.description.as_deref().unwrap_or_default(),
                            "operation"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint = %self.name, error = %e, "listing operations after connect failed");
                }
            }
        }

        let outbox = Arc::clone(&self.outbox);
        transport.on_notification(Arc::new(move |n| outbox.push(n)));
        Ok(transport)
    }

    /// Drop `failed` if it is still the live transport and schedule a
    /// reconnect. Returns `err` for the caller.
    async fn connection_lost(&self, failed: &Arc<dyn Transport>, err: Error) -> Error {
        let dropped = {
            let mut guard = self.transport.write().await;
            if guard.as_ref().is_some_and(|t| Arc::ptr_eq(t, failed)) {
                guard.take()
            } else {
                None
            }
        };
        if let Some(transport) = dropped {
            self.set_state(ConnectionState::Disconnected);
            let _ = transport.close().await;
        }

        tracing::warn!(endpoint = %self.name, error = %err, "connection lost, scheduling reconnect");
        self.signal_reconnect();
        err
    }

    fn drain_signals(signals: &mut mpsc::Receiver<()>) {
        while signals.try_recv().is_ok() {}
    }

    async fn reconnect_loop(self: Arc<Self>, mut signals: mpsc::Receiver<()>) {
        let policy = self.settings.reconnect;

        loop {
            let signal = tokio::select! {
                () = self.lifetime.cancelled() => break,
                signal = signals.recv() => signal,
            };
            if signal.is_none() {
                break;
            }
            if self.has_transport().await {
                tracing::debug!(endpoint = %self.name, "already connected, ignoring reconnect signal");
                continue;
            }

            let mut reconnected = false;
            for attempt in 1..=policy.max_attempts {
                self.attempts.store(attempt, Ordering::SeqCst);
                tracing::info!(endpoint = %self.name, attempt, max_attempts = policy.max_attempts, "reconnecting");

                match self.connect(ConnectionState::Reconnecting).await {
                    Ok(()) => {
                        tracing::info!(endpoint = %self.name, attempt, "reconnected");
                        reconnected = true;
                        break;
                    }
                    Err(Error::Closed(_)) => return,
                    Err(e) => {
                        tracing::warn!(endpoint = %self.name, attempt, error = %e, "reconnect attempt failed");
                        if attempt == policy.max_attempts {
                            tracing::error!(
                                endpoint = %self.name,
                                attempts = policy.max_attempts,
                                "reconnect attempts exhausted, waiting for next signal"
                            );
                            break;
                        }
                        tokio::select! {
                            () = self.lifetime.cancelled() => return,
                            () = tokio::time::sleep(policy.backoff(attempt)) => {}
                        }
                    }
                }
            }

            // After a success, queued signals are left for the transport check.
            if !reconnected {
                Self::drain_signals(&mut signals);
            }
        }

        tracing::debug!(endpoint = %self.name, "reconnect loop stopped");
    }
}

/// Keeps one endpoint connected and routes calls to it.
///
/// Must be created inside a tokio runtime: construction spawns the
/// reconnect loop. Dropping the manager stops the loop.
#[derive(Debug)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        settings: ManagerSettings,
    ) -> Self {
        let name = name.into();
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(Inner {
            outbox: Arc::new(Outbox::new(&name, settings.outbox_capacity)),
            name,
            connector,
            settings,
            transport: RwLock::new(None),
            connect_lock: Mutex::new(()),
            signal_tx,
            state_tx,
            attempts: AtomicU32::new(0),
            lifetime: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        tokio::spawn(Arc::clone(&inner).reconnect_loop(signal_rx));
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Current reconnect attempt, 0 when connected or idle after success.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Connect and handshake. On failure the reconnect loop takes over and
    /// the error is returned.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        match self.inner.connect(ConnectionState::Connecting).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !matches!(e, Error::Closed(_)) {
                    tracing::warn!(endpoint = %self.inner.name, error = %e, "initial connect failed");
                    self.inner.signal_reconnect();
                }
                Err(e)
            }
        }
    }

    pub async fn invoke(
        &self,
        operation: &str,
        arguments: Option<JsonObject>,
        ctx: &CallContext,
    ) -> Result<CallToolResult> {
        let transport = self.live_transport().await?;
        match transport.call(operation, arguments, ctx).await {
            Err(e) if e.is_connection() => Err(self.inner.connection_lost(&transport, e).await),
            other => other,
        }
    }

    /// All operations of the endpoint, every page.
    pub async fn list_operations(&self, ctx: &CallContext) -> Result<Vec<OperationDescriptor>> {
        let transport = self.live_transport().await?;
        match transport.list_operations(ctx).await {
            Err(e) if e.is_connection() => Err(self.inner.connection_lost(&transport, e).await),
            other => other,
        }
    }

    /// Subscribe to `uri` and return a stream of the endpoint's push
    /// notifications. Every call sends `resources/subscribe` and gets its
    /// own stream; each live stream sees every notification.
    pub async fn subscribe(
        &self,
        uri: &str,
        ctx: &CallContext,
    ) -> Result<ReceiverStream<Notification>> {
        let transport = self.live_transport().await?;
        // Endpoints may notify immediately after the reply.
        let rx = self
            .inner
            .outbox
            .attach()
            .ok_or_else(|| Error::Closed(self.inner.name.clone()))?;

        match transport.subscribe(uri, ctx).await {
            Ok(()) => Ok(ReceiverStream::new(rx)),
            Err(e) if e.is_connection() => Err(self.inner.connection_lost(&transport, e).await),
            Err(e) => Err(e),
        }
    }

    /// Queue a reconnect; `false` when one is already pending.
    pub fn request_reconnect(&self) -> bool {
        self.inner.signal_reconnect()
    }

    pub fn pending_reconnects(&self) -> usize {
        self.inner.signal_tx.max_capacity() - self.inner.signal_tx.capacity()
    }

    /// Close and clear the live transport without terminating the manager.
    pub async fn disconnect(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        let transport = self.inner.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::debug!(endpoint = %self.inner.name, error = %e, "close during disconnect failed");
            }
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Stop the reconnect loop, end the notification stream and close the
    /// transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.lifetime.cancel();

        let _guard = self.inner.connect_lock.lock().await;
        self.inner.outbox.close();
        let transport = self.inner.transport.write().await.take();
        let result = match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        };
        self.inner.set_state(ConnectionState::Terminated);
        tracing::info!(endpoint = %self.inner.name, "connection manager closed");
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(Error::Closed(self.inner.name.clone()))
        } else {
            Ok(())
        }
    }

    async fn live_transport(&self) -> Result<Arc<dyn Transport>> {
        self.ensure_open()?;
        let live = self.inner.transport.read().await.as_ref().map(Arc::clone);
        live.ok_or_else(|| {
            self.inner.signal_reconnect();
            Error::NotConnected {
                endpoint: self.inner.name.clone(),
            }
        })
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}
