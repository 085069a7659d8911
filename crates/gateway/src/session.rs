//! Client sessions.
//!
//! One session per active client event-stream, identified by a random id.
//! A periodic sweeper evicts sessions idle past the configured timeout.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use {
    axum::response::sse::Event,
    serde::Serialize,
    tokio::sync::mpsc,
    tracing::{debug, info},
};

/// Floor for the sweep cadence; `min(timeout / 2, 60 s)`.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Admin-surface view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: String,
    pub age_secs: u64,
    pub idle_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
}

pub struct ClientSession {
    pub id: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    sender: mpsc::UnboundedSender<Event>,
}

impl ClientSession {
    /// Push an event onto this session's stream. Delivery to a closed
    /// stream silently no-ops.
    fn send(&self, event: Event) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Owns all live client sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, ClientSession>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Mint a session bound to the given event sender.
    pub fn create(&self, sender: mpsc::UnboundedSender<Event>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();
        let session = ClientSession {
            id: id.clone(),
            created_at: now,
            last_activity: now,
            client_name: None,
            client_version: None,
            sender,
        };
        self.write().insert(id.clone(), session);
        info!(session = %id, "session created");
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Refresh last-activity. Returns false for an unknown session.
    pub fn touch(&self, id: &str) -> bool {
        match self.write().get_mut(id) {
            Some(session) => {
                session.last_activity = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record the client-reported name/version from its `initialize`.
    pub fn set_client_info(&self, id: &str, name: Option<String>, version: Option<String>) {
        if let Some(session) = self.write().get_mut(id) {
            session.client_name = name;
            session.client_version = version;
        }
    }

    /// The client-reported name/version recorded from `initialize`.
    pub fn client_info(&self, id: &str) -> Option<(Option<String>, Option<String>)> {
        self.read()
            .get(id)
            .map(|s| (s.client_name.clone(), s.client_version.clone()))
    }

    /// Serializable view of every live session for the admin surface.
    pub fn snapshot(&self) -> Vec<SessionView> {
        self.read()
            .values()
            .map(|s| SessionView {
                id: s.id.clone(),
                age_secs: s.created_at.elapsed().as_secs(),
                idle_secs: s.last_activity.elapsed().as_secs(),
                client_name: s.client_name.clone(),
                client_version: s.client_version.clone(),
            })
            .collect()
    }

    pub fn remove(&self, id: &str) {
        if self.write().remove(id).is_some() {
            info!(session = %id, "session removed");
        }
    }

    /// Deliver an event to one session. No-ops silently when the session is
    /// gone or its stream is closed.
    pub fn send_to(&self, id: &str, event: Event) -> bool {
        self.read().get(id).map(|s| s.send(event)).unwrap_or(false)
    }

    /// Deliver an event to every session; the builder runs once per
    /// receiver because events are single-use.
    pub fn broadcast_with(&self, build: impl Fn() -> Event) {
        for session in self.read().values() {
            session.send(build());
        }
    }

    /// Evict sessions whose last activity is older than the timeout.
    pub fn sweep(&self) -> usize {
        let timeout = self.timeout;
        let mut sessions = self.write();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_activity.elapsed() <= timeout;
            if !keep {
                debug!(session = %id, "session timed out");
            }
            keep
        });
        before - sessions.len()
    }

    pub fn sweep_interval(&self) -> Duration {
        (self.timeout / 2).min(MAX_SWEEP_INTERVAL)
    }

    /// Install the periodic session sweep.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let interval = self.sweep_interval();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let evicted = manager.sweep();
                if evicted > 0 {
                    info!(evicted, "swept idle sessions");
                }
            }
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ClientSession>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}
