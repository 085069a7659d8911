//! Per-backend circuit breaker.
//!
//! Closed passes traffic through; open rejects without touching the
//! transport; half-open passes traffic while watching for consecutive
//! successes. Opening requires both the consecutive-failure threshold and a
//! minimum observed request volume.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open required to close it.
    pub success_threshold: u32,
    /// Time the circuit stays open before the next request may probe.
    pub recovery_timeout: Duration,
    /// Minimum observed requests before the circuit may open at all.
    pub volume_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            volume_threshold: 10,
        }
    }
}

/// Serializable snapshot for the admin surface and circuit-open error data.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_requests: u64,
    pub seconds_in_state: u64,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_requests: u64,
    last_state_change: Instant,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            last_state_change: Instant::now(),
        }
    }

    /// Admission check for an outgoing request. An open circuit transitions
    /// to half-open once the recovery timeout has elapsed; otherwise the
    /// request is rejected with the current status.
    pub fn try_acquire(&mut self) -> Result<(), BreakerStatus> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                if self.last_state_change.elapsed() >= self.config.recovery_timeout {
                    self.transition(CircuitState::HalfOpen);
                    Ok(())
                } else {
                    Err(self.status())
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.total_requests += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        if self.state == CircuitState::HalfOpen
            && self.consecutive_successes >= self.config.success_threshold
        {
            self.transition(CircuitState::Closed);
        }
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        match self.state {
            CircuitState::HalfOpen => self.transition(CircuitState::Open),
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold
                    && self.total_requests >= self.config.volume_threshold
                {
                    self.transition(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn status(&self) -> BreakerStatus {
        BreakerStatus {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            total_requests: self.total_requests,
            seconds_in_state: self.last_state_change.elapsed().as_secs(),
        }
    }

    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            self.state = to;
            self.last_state_change = Instant::now();
            self.consecutive_failures = 0;
            self.consecutive_successes = 0;
        }
    }
}
