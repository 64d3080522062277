//! Per-job-type circuit breakers.
//!
//! Breaker state is process-local and advisory: it only shapes back-pressure,
//! so losing it on restart is harmless. The cool-down is checked lazily on
//! access; there is no background timer.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// How long after the last failure an open breaker closes again
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BreakerState {
    failure_count: u32,
    last_failure_at: Option<Instant>,
    is_open: bool,
}

impl BreakerState {
    const fn closed() -> Self {
        Self {
            failure_count: 0,
            last_failure_at: None,
            is_open: false,
        }
    }
}

/// Snapshot of one breaker for dashboards.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub job_type: String,
    pub failure_count: u32,
    pub is_open: bool,
    /// Milliseconds since the most recent failure
    pub last_failure_ms_ago: Option<u64>,
}

/// Tracks consecutive failures per job type.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    states: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether jobs of this type should be deferred right now.
    ///
    /// An open breaker whose cool-down has elapsed is reset here.
    pub fn is_open(&self, job_type: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = states.get_mut(job_type) else {
            return false;
        };
        self.expire(state, Instant::now());
        state.is_open
    }

    /// Job types whose breaker is currently open.
    pub fn open_types(&self) -> Vec<String> {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut open: Vec<String> = states
            .iter_mut()
            .filter_map(|(job_type, state)| {
                self.expire(state, now);
                state.is_open.then(|| job_type.clone())
            })
            .collect();
        open.sort();
        open
    }

    pub fn record_success(&self, job_type: &str) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = states.get_mut(job_type) {
            *state = BreakerState::closed();
        }
    }

    /// Count a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&self, job_type: &str) -> bool {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let state = states
            .entry(job_type.to_string())
            .or_insert_with(BreakerState::closed);

        self.expire(state, now);
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);

        if !state.is_open && state.failure_count >= self.config.failure_threshold {
            state.is_open = true;
            return true;
        }
        false
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<CircuitSnapshot> = states
            .iter_mut()
            .map(|(job_type, state)| {
                self.expire(state, now);
                CircuitSnapshot {
                    job_type: job_type.clone(),
                    failure_count: state.failure_count,
                    is_open: state.is_open,
                    last_failure_ms_ago: state
                        .last_failure_at
                        .map(|at| now.saturating_duration_since(at).as_millis() as u64),
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        snapshots
    }

    fn expire(&self, state: &mut BreakerState, now: Instant) {
        let cooled = state
            .last_failure_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.config.cooldown);
        if state.is_open && cooled {
            *state = BreakerState::closed();
        }
    }
}
