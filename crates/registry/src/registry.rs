//! The registry: owner of every backend adapter.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use {
    serde::Serialize,
    tokio::sync::{RwLock, mpsc},
    tracing::{debug, info, warn},
};

use junction_adapter::{
    Adapter, AdapterStatus, BackendConfig, BackendNotification, Health,
};
use junction_protocol::{PromptDef, ResourceDef, ToolDef};

use crate::error::{Error, Result};

/// Health transitions kept per backend.
const TRANSITION_HISTORY: usize = 100;

/// One observed health transition.
#[derive(Debug, Clone)]
struct Transition {
    from: Health,
    to: Health,
    at: Instant,
}

/// Serializable view of a transition for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionView {
    pub from: Health,
    pub to: Health,
    pub age_secs: u64,
}

/// Emitted whenever a backend's health changes between probe ticks.
#[derive(Debug, Clone)]
pub struct HealthChange {
    pub backend: String,
    pub from: Health,
    pub to: Health,
}

/// A capability record annotated with its origin backend.
#[derive(Debug, Clone)]
pub struct MergedEntry<T> {
    pub backend: String,
    pub item: T,
}

/// The merged catalog across all healthy backends, in registration order.
#[derive(Debug, Clone, Default)]
pub struct MergedCapabilities {
    pub tools: Vec<MergedEntry<ToolDef>>,
    pub resources: Vec<MergedEntry<ResourceDef>>,
    pub prompts: Vec<MergedEntry<PromptDef>>,
}

/// Admin-surface snapshot of one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub adapter: AdapterStatus,
    pub transitions: Vec<TransitionView>,
}

struct Inner {
    adapters: HashMap<String, Arc<Adapter>>,
    /// Registration order; drives the merge so catalogs are reproducible.
    order: Vec<String>,
    transitions: HashMap<String, VecDeque<Transition>>,
    last_health: HashMap<String, Health>,
}

/// Owns the mapping from backend identifier to adapter.
pub struct Registry {
    inner: RwLock<Inner>,
    notifications: StdMutex<Option<mpsc::UnboundedSender<BackendNotification>>>,
    health_changes: StdMutex<Option<mpsc::UnboundedSender<HealthChange>>>,
    probe_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                adapters: HashMap::new(),
                order: Vec::new(),
                transitions: HashMap::new(),
                last_health: HashMap::new(),
            }),
            notifications: StdMutex::new(None),
            health_changes: StdMutex::new(None),
            probe_task: StdMutex::new(None),
        }
    }

    /// Wire the fan-out slot for server-initiated backend notifications.
    /// Applies to backends registered after the call.
    pub fn set_notification_sender(&self, tx: mpsc::UnboundedSender<BackendNotification>) {
        *lock(&self.notifications) = Some(tx);
    }

    /// Wire the fan-out slot for health-change events.
    pub fn set_health_change_sender(&self, tx: mpsc::UnboundedSender<HealthChange>) {
        *lock(&self.health_changes) = Some(tx);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Admit a backend: build its adapter, install wiring, insert it and,
    /// unless lazy start is requested, attempt a synchronous start. A start
    /// failure is logged but the backend stays registered (unhealthy).
    pub async fn register(&self, config: BackendConfig) -> Result<()> {
        let id = config.id.clone();
        {
            let inner = self.inner.read().await;
            if inner.adapters.contains_key(&id) {
                return Err(Error::DuplicateId(id));
            }
        }

        let lazy = config.lazy_start;
        let adapter = Adapter::build(config)?;
        if let Some(tx) = lock(&self.notifications).clone() {
            adapter.set_notification_sender(tx);
        }

        {
            let mut inner = self.inner.write().await;
            if inner.adapters.contains_key(&id) {
                return Err(Error::DuplicateId(id));
            }
            inner.adapters.insert(id.clone(), Arc::clone(&adapter));
            inner.order.push(id.clone());
            inner.last_health.insert(id.clone(), adapter.health());
        }
        info!(backend = %id, lazy, "backend registered");

        if !lazy
            && let Err(e) = adapter.start().await
        {
            warn!(backend = %id, error = %e, "initial start failed, backend stays registered");
        }
        self.record_health_changes().await;
        Ok(())
    }

    /// Stop and remove a backend. Returns false if it was not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let adapter = {
            let mut inner = self.inner.write().await;
            inner.order.retain(|o| o != id);
            inner.transitions.remove(id);
            inner.last_health.remove(id);
            inner.adapters.remove(id)
        };
        match adapter {
            Some(adapter) => {
                adapter.stop().await;
                info!(backend = %id, "backend unregistered");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Adapter>> {
        self.inner.read().await.adapters.get(id).cloned()
    }

    pub async fn backend_ids(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    /// The lazy-start hot path: look the adapter up and, if its transport is
    /// down, start it before returning.
    pub async fn adapter_ensure_started(&self, id: &str) -> Result<Arc<Adapter>> {
        let adapter = self
            .get(id)
            .await
            .ok_or_else(|| Error::UnknownBackend(id.to_string()))?;
        if !adapter.is_connected() {
            adapter.start().await?;
        }
        Ok(adapter)
    }

    /// Stop every adapter concurrently, then clear the map.
    pub async fn shutdown(&self) {
        if let Some(task) = lock(&self.probe_task).take() {
            task.abort();
        }
        let adapters: Vec<Arc<Adapter>> = {
            let mut inner = self.inner.write().await;
            inner.order.clear();
            inner.transitions.clear();
            inner.last_health.clear();
            inner.adapters.drain().map(|(_, a)| a).collect()
        };
        info!(backends = adapters.len(), "registry shutting down");
        futures::future::join_all(adapters.iter().map(|a| a.stop())).await;
    }

    // ── Capability merge ─────────────────────────────────────────────

    /// Merge the capability sets of every healthy backend. Order within a
    /// backend follows the backend's own ordering; across backends it
    /// follows registration order.
    pub async fn merged_capabilities(&self) -> MergedCapabilities {
        let snapshot: Vec<(String, Arc<Adapter>)> = {
            let inner = self.inner.read().await;
            inner
                .order
                .iter()
                .filter_map(|id| {
                    inner
                        .adapters
                        .get(id)
                        .map(|a| (id.clone(), Arc::clone(a)))
                })
                .collect()
        };

        let mut merged = MergedCapabilities::default();
        for (id, adapter) in snapshot {
            if adapter.health() != Health::Healthy {
                continue;
            }
            let Some(caps) = adapter.capabilities().await else {
                continue;
            };
            merged.tools.extend(caps.tools.into_iter().map(|item| MergedEntry {
                backend: id.clone(),
                item,
            }));
            merged
                .resources
                .extend(caps.resources.into_iter().map(|item| MergedEntry {
                    backend: id.clone(),
                    item,
                }));
            merged
                .prompts
                .extend(caps.prompts.into_iter().map(|item| MergedEntry {
                    backend: id.clone(),
                    item,
                }));
        }
        merged
    }

    // ── Health checks ────────────────────────────────────────────────

    /// Install the periodic liveness probe.
    pub fn start_health_checks(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(registry) = weak.upgrade() else {
                    break;
                };
                registry.probe_all().await;
            }
        });
        *lock(&self.probe_task) = Some(task);
    }

    /// Probe every non-stopped adapter once and record transitions.
    pub async fn probe_all(&self) {
        let snapshot: Vec<Arc<Adapter>> = {
            let inner = self.inner.read().await;
            inner.adapters.values().cloned().collect()
        };

        for adapter in snapshot {
            if adapter.health() == Health::Stopped {
                continue;
            }
            let alive = adapter.is_connected() && adapter.probe().await.is_ok();
            if !alive && adapter.health() == Health::Healthy {
                warn!(backend = %adapter.id(), "liveness probe failed");
                adapter.mark_unhealthy();
            }
        }

        self.record_health_changes().await;
    }

    /// Compare each adapter's health against the last recorded value; push
    /// changes into the capped history and emit health-changed events.
    async fn record_health_changes(&self) {
        let mut changes = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let ids: Vec<String> = inner.order.clone();
            for id in ids {
                let Some(current) = inner.adapters.get(&id).map(|a| a.health()) else {
                    continue;
                };
                let prev = inner.last_health.insert(id.clone(), current);
                if let Some(prev) = prev
                    && prev != current
                {
                    debug!(backend = %id, from = %prev, to = %current, "health changed");
                    let history = inner.transitions.entry(id.clone()).or_default();
                    if history.len() >= TRANSITION_HISTORY {
                        history.pop_front();
                    }
                    history.push_back(Transition {
                        from: prev,
                        to: current,
                        at: Instant::now(),
                    });
                    changes.push(HealthChange {
                        backend: id,
                        from: prev,
                        to: current,
                    });
                }
            }
        }
        if changes.is_empty() {
            return;
        }
        let slot = lock(&self.health_changes).clone();
        if let Some(tx) = slot {
            for change in changes {
                let _ = tx.send(change);
            }
        }
    }

    // ── Status ───────────────────────────────────────────────────────

    pub async fn status(&self) -> Vec<BackendStatus> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| {
                let adapter = inner.adapters.get(id)?;
                let transitions = inner
                    .transitions
                    .get(id)
                    .map(|history| {
                        history
                            .iter()
                            .map(|t| TransitionView {
                                from: t.from,
                                to: t.to,
                                age_secs: t.at.elapsed().as_secs(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Some(BackendStatus {
                    adapter: adapter.status(),
                    transitions,
                })
            })
            .collect()
    }
}

#[cfg(any(test, feature = "testing"))]
impl Registry {
    /// Insert a pre-built adapter directly, bypassing config construction.
    /// Test support only.
    pub async fn insert_for_tests(&self, adapter: Arc<Adapter>) {
        let id = adapter.id().to_string();
        let mut inner = self.inner.write().await;
        inner.adapters.insert(id.clone(), Arc::clone(&adapter));
        inner.order.push(id.clone());
        inner.last_health.insert(id, adapter.health());
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
