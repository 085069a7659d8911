//! The transport-agnostic adapter core.
//!
//! Everything above the wire lives here: request/reply correlation against a
//! pending-request table, the MCP handshake, the retry supervisor, and the
//! integration of the circuit breaker and rolling statistics. The transport
//! below only knows how to move framed bytes.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    tokio::sync::{Mutex, RwLock, mpsc, oneshot, watch},
    tracing::{debug, info, warn},
};

use junction_protocol::{
    ClientCapabilities, ClientInfo, GATEWAY_NAME, InboundMessage, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    PromptDef, PromptsListResult, ResourceDef, ResourcesListResult, ServerInfo, ToolDef,
    ToolsListResult,
};

use crate::{
    breaker::{BreakerConfig, BreakerStatus, CircuitBreaker},
    config::{BackendConfig, TransportKind},
    error::{Error, Result},
    sse::SseTransport,
    stats::{AdapterStats, StatsSnapshot},
    stdio::{StderrTail, StdioTransport},
    transport::{Transport, TransportEvent},
};

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
const RETRY_JITTER_FRACTION: f64 = 0.1;
/// Uptime after which a crash is treated as fresh rather than a continuation
/// of the previous failure streak.
const RETRY_RESET_UPTIME: Duration = Duration::from_secs(30);

// ── Public types ─────────────────────────────────────────────────────

/// Lifecycle state of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Stopped,
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Capability set cached from a backend's handshake.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    pub tools: Vec<ToolDef>,
    pub resources: Vec<ResourceDef>,
    pub prompts: Vec<PromptDef>,
    pub server_info: Option<ServerInfo>,
}

/// A server-initiated notification surfaced to whoever wired the slot.
#[derive(Debug, Clone)]
pub struct BackendNotification {
    pub backend: String,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

/// Admin-surface snapshot of one adapter.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub id: String,
    pub transport: TransportKind,
    pub health: Health,
    pub connected: bool,
    pub circuit: BreakerStatus,
    pub retry_attempts: u32,
    pub stats: StatsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Vec<String>>,
}

// ── Pending-request table ────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum CancelReason {
    Stopped,
    TransportLost,
}

enum PendingOutcome {
    Reply(JsonRpcResponse),
    Cancelled(CancelReason),
}

struct PendingEntry {
    tx: oneshot::Sender<PendingOutcome>,
    started: Instant,
}

// ── Adapter ──────────────────────────────────────────────────────────

/// One backend: a transport plus the JSON-RPC session state above it.
pub struct Adapter {
    config: BackendConfig,
    transport: Arc<dyn Transport>,
    pending: StdMutex<HashMap<u64, PendingEntry>>,
    next_id: AtomicU64,
    health: watch::Sender<Health>,
    capabilities: RwLock<Option<Capabilities>>,
    breaker: StdMutex<CircuitBreaker>,
    stats: StdMutex<AdapterStats>,
    retry_attempts: AtomicU32,
    recovering: AtomicBool,
    connected_at: StdMutex<Option<Instant>>,
    notify_slot: StdMutex<Option<mpsc::UnboundedSender<BackendNotification>>>,
    supervisor: StdMutex<Option<tokio::task::JoinHandle<()>>>,
    start_lock: Mutex<()>,
    stderr_tail: Option<Arc<StdMutex<StderrTail>>>,
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("id", &self.config.id)
            .finish()
    }
}

impl Adapter {
    /// Build an adapter with the transport its configuration names.
    pub fn build(config: BackendConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match config.transport {
            TransportKind::Stdio => {
                let transport = StdioTransport::new(&config, events_tx);
                let tail = transport.stderr_tail();
                Ok(Self::with_transport(
                    config,
                    Arc::new(transport),
                    events_rx,
                    Some(tail),
                ))
            }
            TransportKind::Sse => {
                let transport = SseTransport::new(&config, events_tx)?;
                Ok(Self::with_transport(
                    config,
                    Arc::new(transport),
                    events_rx,
                    None,
                ))
            }
        }
    }

    /// Wire an adapter over an arbitrary transport. This is the seam the
    /// tests inject fakes through; `build` is the production path.
    pub fn with_transport(
        config: BackendConfig,
        transport: Arc<dyn Transport>,
        events_rx: mpsc::UnboundedReceiver<TransportEvent>,
        stderr_tail: Option<Arc<StdMutex<StderrTail>>>,
    ) -> Arc<Self> {
        let (health, _) = watch::channel(Health::Stopped);
        let adapter = Arc::new(Self {
            config,
            transport,
            pending: StdMutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            health,
            capabilities: RwLock::new(None),
            breaker: StdMutex::new(CircuitBreaker::new(BreakerConfig::default())),
            stats: StdMutex::new(AdapterStats::default()),
            retry_attempts: AtomicU32::new(0),
            recovering: AtomicBool::new(false),
            connected_at: StdMutex::new(None),
            notify_slot: StdMutex::new(None),
            supervisor: StdMutex::new(None),
            start_lock: Mutex::new(()),
            stderr_tail,
        });
        adapter.spawn_event_loop(events_rx);
        adapter
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn health(&self) -> Health {
        *self.health.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Install the notification wiring. One slot, set at registration time.
    pub fn set_notification_sender(&self, tx: mpsc::UnboundedSender<BackendNotification>) {
        *self.lock_sync(&self.notify_slot) = Some(tx);
    }

    pub async fn capabilities(&self) -> Option<Capabilities> {
        self.capabilities.read().await.clone()
    }

    /// Flip the cached health to unhealthy (used by the registry's probe).
    pub fn mark_unhealthy(&self) {
        self.set_health(Health::Unhealthy);
    }

    pub fn status(&self) -> AdapterStatus {
        AdapterStatus {
            id: self.config.id.clone(),
            transport: self.config.transport,
            health: self.health(),
            connected: self.is_connected(),
            circuit: self.lock_sync(&self.breaker).status(),
            retry_attempts: self.retry_attempts.load(Ordering::SeqCst),
            stats: self.lock_sync(&self.stats).snapshot(),
            stderr: self
                .stderr_tail
                .as_ref()
                .map(|tail| self.lock_sync(tail).snapshot()),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the transport and run the MCP handshake. Idempotent on an
    /// already-healthy adapter.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.start_lock.lock().await;
        if self.is_connected() && self.health() == Health::Healthy {
            return Ok(());
        }

        self.set_health(Health::Starting);
        if let Err(e) = self.transport.start().await {
            self.lock_sync(&self.stats).note_fault(e.to_string());
            self.set_health(Health::Unhealthy);
            return Err(e);
        }
        self.lock_sync(&self.stats).mark_connected();
        *self.lock_sync(&self.connected_at) = Some(Instant::now());

        match self.handshake().await {
            Ok(()) => {
                self.set_health(Health::Healthy);
                info!(backend = %self.config.id, "backend healthy");
                Ok(())
            }
            Err(e) => {
                self.lock_sync(&self.stats).note_fault(e.to_string());
                self.transport.stop().await;
                self.lock_sync(&self.stats).mark_disconnected();
                *self.lock_sync(&self.connected_at) = None;
                self.set_health(Health::Unhealthy);
                Err(e)
            }
        }
    }

    /// Stop the adapter: cancel in-flight awaiters first, then tear the
    /// transport down.
    pub async fn stop(&self) {
        info!(backend = %self.config.id, "stopping adapter");
        if let Some(handle) = self.lock_sync(&self.supervisor).take() {
            handle.abort();
        }
        self.recovering.store(false, Ordering::SeqCst);
        self.cancel_pending(CancelReason::Stopped);
        self.transport.stop().await;
        self.lock_sync(&self.stats).mark_disconnected();
        *self.lock_sync(&self.connected_at) = None;
        self.set_health(Health::Stopped);
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Send a request and await the matching reply. The response is returned
    /// verbatim; a backend-reported `error` object is an `Ok` response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        self.request_with_options(method, params, true).await
    }

    /// Fire-and-forget notification.
    pub async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        debug!(backend = %self.config.id, %method, "-> backend (notification)");
        self.transport.send_raw(&frame).await
    }

    /// Liveness probe used by the registry: a `ping` that bypasses the
    /// breaker, failing on transport errors and error replies alike.
    pub async fn probe(&self) -> Result<()> {
        let resp = self.request_with_options("ping", None, false).await?;
        if let Some(err) = resp.error {
            return Err(Error::Protocol(format!(
                "ping failed: {} ({})",
                err.message, err.code
            )));
        }
        Ok(())
    }

    async fn request_with_options(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        guarded: bool,
    ) -> Result<JsonRpcResponse> {
        if guarded {
            self.lock_sync(&self.breaker)
                .try_acquire()
                .map_err(Error::CircuitOpen)?;
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.lock_sync(&self.pending).insert(
            id,
            PendingEntry {
                tx,
                started: Instant::now(),
            },
        );

        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        debug!(backend = %self.config.id, %method, id, "-> backend");

        if let Err(e) = self.transport.send_raw(&frame).await {
            self.lock_sync(&self.pending).remove(&id);
            self.lock_sync(&self.breaker).record_failure();
            self.lock_sync(&self.stats)
                .record_error(None, e.to_string());
            return Err(e);
        }

        let deadline = self.config.request_timeout();
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(PendingOutcome::Reply(resp))) => Ok(resp),
            Ok(Ok(PendingOutcome::Cancelled(CancelReason::Stopped))) => Err(Error::Stopped),
            Ok(Ok(PendingOutcome::Cancelled(CancelReason::TransportLost))) => Err(
                Error::TransportLost("connection lost with requests in flight".into()),
            ),
            Ok(Err(_)) => Err(Error::TransportLost("request dropped".into())),
            Err(_elapsed) => {
                // Evict the entry; a reply racing the deadline may already
                // have resolved it, in which case the outcome stands as
                // recorded and only the caller sees the timeout.
                let evicted = self.lock_sync(&self.pending).remove(&id).is_some();
                if evicted {
                    self.lock_sync(&self.breaker).record_failure();
                    self.lock_sync(&self.stats).record_error(
                        Some(deadline.as_secs_f64() * 1000.0),
                        format!("request '{method}' timed out"),
                    );
                }
                Err(Error::RequestTimeout {
                    method: method.to_string(),
                    seconds: deadline.as_secs(),
                })
            }
        }
    }

    // ── Handshake ────────────────────────────────────────────────────

    async fn handshake(&self) -> Result<()> {
        // A repeated initialize over a live session is a no-op; the cached
        // capability set stands.
        if self.capabilities.read().await.is_some() && self.health() == Health::Healthy {
            return Ok(());
        }

        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: GATEWAY_NAME.into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let resp = match self
            .request_with_options("initialize", Some(serde_json::to_value(&params)?), false)
            .await
        {
            Ok(resp) => resp,
            Err(Error::RequestTimeout { seconds, .. }) => {
                return Err(Error::HandshakeTimeout { seconds });
            }
            Err(e) => return Err(e),
        };

        if let Some(err) = resp.error {
            return Err(Error::Protocol(format!(
                "initialize failed: {} ({})",
                err.message, err.code
            )));
        }
        let result: InitializeResult = serde_json::from_value(
            resp.result
                .ok_or_else(|| Error::Protocol("initialize returned no result".into()))?,
        )?;

        info!(
            backend = %self.config.id,
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "backend initialized"
        );

        self.notify("notifications/initialized", None).await?;

        // Fetch only the groups the backend advertises. A failing list call
        // leaves that group empty; the backend is healthy regardless.
        let mut caps = Capabilities {
            server_info: Some(result.server_info),
            ..Capabilities::default()
        };
        if result.capabilities.tools.is_some() {
            match self.fetch_list::<ToolsListResult>("tools/list").await {
                Ok(r) => caps.tools = r.tools,
                Err(e) => {
                    warn!(backend = %self.config.id, error = %e, "tools/list failed, capability set is partial");
                }
            }
        }
        if result.capabilities.resources.is_some() {
            match self.fetch_list::<ResourcesListResult>("resources/list").await {
                Ok(r) => caps.resources = r.resources,
                Err(e) => {
                    warn!(backend = %self.config.id, error = %e, "resources/list failed, capability set is partial");
                }
            }
        }
        if result.capabilities.prompts.is_some() {
            match self.fetch_list::<PromptsListResult>("prompts/list").await {
                Ok(r) => caps.prompts = r.prompts,
                Err(e) => {
                    warn!(backend = %self.config.id, error = %e, "prompts/list failed, capability set is partial");
                }
            }
        }

        debug!(
            backend = %self.config.id,
            tools = caps.tools.len(),
            resources = caps.resources.len(),
            prompts = caps.prompts.len(),
            "capabilities cached"
        );
        *self.capabilities.write().await = Some(caps);
        Ok(())
    }

    async fn fetch_list<T: serde::de::DeserializeOwned + Default>(
        &self,
        method: &str,
    ) -> Result<T> {
        let resp = self.request_with_options(method, None, false).await?;
        if let Some(err) = resp.error {
            return Err(Error::Protocol(format!(
                "{method} failed: {} ({})",
                err.message, err.code
            )));
        }
        match resp.result {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(T::default()),
        }
    }

    // ── Inbound dispatch ─────────────────────────────────────────────

    fn spawn_event_loop(self: &Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<TransportEvent>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let Some(adapter) = weak.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::Frame(line) => adapter.handle_frame(&line),
                    TransportEvent::Closed { reason } => adapter.handle_transport_closed(reason),
                }
            }
        });
    }

    fn handle_frame(&self, line: &str) {
        let msg: InboundMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(backend = %self.config.id, error = %e, line = %line, "discarding unparseable frame");
                return;
            }
        };

        if let Some(id) = msg.reply_id() {
            let Some(entry) = self.lock_sync(&self.pending).remove(&id) else {
                warn!(backend = %self.config.id, id, "reply for unknown request id");
                return;
            };
            let latency_ms = entry.started.elapsed().as_secs_f64() * 1000.0;
            let response = msg.into_response();
            match &response.error {
                Some(err) => {
                    self.lock_sync(&self.breaker).record_failure();
                    self.lock_sync(&self.stats).record_error(
                        Some(latency_ms),
                        format!("backend error {}: {}", err.code, err.message),
                    );
                }
                None => {
                    self.lock_sync(&self.breaker).record_success();
                    self.lock_sync(&self.stats).record_success(latency_ms);
                }
            }
            let _ = entry.tx.send(PendingOutcome::Reply(response));
            return;
        }

        if let Some(method) = msg.method {
            debug!(backend = %self.config.id, %method, "backend notification");
            let slot = self.lock_sync(&self.notify_slot).clone();
            if let Some(tx) = slot {
                let _ = tx.send(BackendNotification {
                    backend: self.config.id.clone(),
                    method,
                    params: msg.params,
                });
            }
            return;
        }

        debug!(backend = %self.config.id, line = %line, "frame with neither id nor method");
    }

    // ── Retry supervisor ─────────────────────────────────────────────

    fn handle_transport_closed(self: &Arc<Self>, reason: String) {
        warn!(backend = %self.config.id, %reason, "transport lost");
        {
            let mut stats = self.lock_sync(&self.stats);
            stats.note_fault(reason);
            stats.mark_disconnected();
        }
        self.cancel_pending(CancelReason::TransportLost);

        if self.health() != Health::Healthy {
            // Start-time failures are handled by the caller of start().
            return;
        }

        // A backend that ran cleanly for a while earns a fresh retry budget.
        let uptime = self
            .lock_sync(&self.connected_at)
            .take()
            .map(|t| t.elapsed());
        if uptime.is_some_and(|u| u >= RETRY_RESET_UPTIME) {
            self.retry_attempts.store(0, Ordering::SeqCst);
        }

        self.set_health(Health::Unhealthy);
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        let adapter = Arc::clone(self);
        let handle = tokio::spawn(async move { adapter.run_recovery().await });
        *self.lock_sync(&self.supervisor) = Some(handle);
    }

    async fn run_recovery(self: Arc<Self>) {
        loop {
            let attempt = self.retry_attempts.load(Ordering::SeqCst);
            if attempt >= self.config.max_retries {
                warn!(
                    backend = %self.config.id,
                    attempts = attempt,
                    "retries exhausted, backend is terminally unhealthy"
                );
                self.set_health(Health::Unhealthy);
                self.recovering.store(false, Ordering::SeqCst);
                return;
            }

            let delay = retry_delay(attempt);
            info!(
                backend = %self.config.id,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling restart"
            );
            tokio::time::sleep(delay).await;
            self.retry_attempts.fetch_add(1, Ordering::SeqCst);

            match self.start().await {
                Ok(()) => {
                    info!(backend = %self.config.id, "backend recovered");
                    self.recovering.store(false, Ordering::SeqCst);
                    return;
                }
                Err(e) => {
                    warn!(backend = %self.config.id, error = %e, "restart attempt failed");
                }
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn cancel_pending(&self, reason: CancelReason) {
        let entries: Vec<PendingEntry> = self
            .lock_sync(&self.pending)
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if !entries.is_empty() {
            debug!(backend = %self.config.id, count = entries.len(), reason = ?reason, "cancelling in-flight requests");
        }
        for entry in entries {
            let _ = entry.tx.send(PendingOutcome::Cancelled(reason));
        }
    }

    fn set_health(&self, health: Health) {
        self.health.send_replace(health);
    }

    /// Lock a std mutex, surviving poisoning (a panicked holder leaves the
    /// plain data usable).
    fn lock_sync<'a, T>(&self, mutex: &'a StdMutex<T>) -> std::sync::MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `min(max, base * 2^attempt)` plus uniform jitter up to 10% of the base.
fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_DELAY.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let capped = exp.min(RETRY_MAX_DELAY.as_secs_f64());
    let jitter = rand::random::<f64>() * RETRY_JITTER_FRACTION * RETRY_BASE_DELAY.as_secs_f64();
    Duration::from_secs_f64(capped + jitter)
}
