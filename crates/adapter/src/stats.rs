//! Rolling per-adapter statistics for the admin surface.

use std::time::Instant;

use serde::Serialize;

/// Weight of the newest sample in the latency moving average.
const LATENCY_ALPHA: f64 = 0.2;

#[derive(Default)]
pub struct AdapterStats {
    total_requests: u64,
    total_errors: u64,
    avg_latency_ms: f64,
    last_request_at: Option<Instant>,
    last_error_at: Option<Instant>,
    last_error: Option<String>,
    connected_since: Option<Instant>,
}

/// Serializable snapshot of [`AdapterStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub total_errors: u64,
    pub avg_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_age_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
}

impl AdapterStats {
    pub fn record_success(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.observe_latency(latency_ms);
        self.last_request_at = Some(Instant::now());
    }

    pub fn record_error(&mut self, latency_ms: Option<f64>, message: impl Into<String>) {
        self.total_requests += 1;
        self.total_errors += 1;
        if let Some(ms) = latency_ms {
            self.observe_latency(ms);
        }
        let now = Instant::now();
        self.last_request_at = Some(now);
        self.last_error_at = Some(now);
        self.last_error = Some(message.into());
    }

    /// Note a fault that is not tied to a single request (transport loss).
    pub fn note_fault(&mut self, message: impl Into<String>) {
        self.last_error_at = Some(Instant::now());
        self.last_error = Some(message.into());
    }

    pub fn mark_connected(&mut self) {
        self.connected_since = Some(Instant::now());
    }

    pub fn mark_disconnected(&mut self) {
        self.connected_since = None;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_requests: self.total_requests,
            total_errors: self.total_errors,
            avg_latency_ms: self.avg_latency_ms,
            last_request_age_secs: self.last_request_at.map(|t| t.elapsed().as_secs()),
            last_error_age_secs: self.last_error_at.map(|t| t.elapsed().as_secs()),
            last_error: self.last_error.clone(),
            uptime_secs: self.connected_since.map(|t| t.elapsed().as_secs()),
        }
    }

    fn observe_latency(&mut self, sample_ms: f64) {
        if self.total_requests <= 1 {
            self.avg_latency_ms = sample_ms;
        } else {
            self.avg_latency_ms =
                self.avg_latency_ms * (1.0 - LATENCY_ALPHA) + sample_ms * LATENCY_ALPHA;
        }
    }
}
