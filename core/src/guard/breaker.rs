//! Per-action circuit breaker
//!
//! Keyed by action signature (capability + action). Repeated failures trip
//! the circuit open; after a cooldown a single half-open probe is allowed,
//! and a success closes the circuit again.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::GuardDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failure_threshold,
            cooldown,
        }
    }

    /// Check whether a request for this signature may proceed. An open
    /// circuit whose cooldown has elapsed transitions to half-open and
    /// allows one probe.
    pub fn check(&self, signature: &str) -> GuardDecision {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(signature.to_string())
            .or_insert_with(BreakerEntry::new);

        match entry.state {
            CircuitState::Closed => GuardDecision::allow("circuit closed"),
            CircuitState::HalfOpen => GuardDecision::allow("circuit half-open, probe allowed"),
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    GuardDecision::allow("circuit half-open, probe allowed")
                } else {
                    GuardDecision::deny(format!(
                        "Circuit breaker open for {} ({} consecutive failures)",
                        signature, entry.consecutive_failures
                    ))
                }
            }
        }
    }

    pub fn state(&self, signature: &str) -> CircuitState {
        self.entries
            .lock()
            .get(signature)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Record a successful outcome: closes a half-open circuit, resets the
    /// failure count.
    pub fn record_success(&self, signature: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(signature.to_string())
            .or_insert_with(BreakerEntry::new);
        entry.consecutive_failures = 0;
        entry.state = CircuitState::Closed;
        entry.opened_at = None;
    }

    /// Record a failed outcome: a half-open probe failure reopens the
    /// circuit; in closed state repeated failures trip it open.
    pub fn record_failure(&self, signature: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(signature.to_string())
            .or_insert_with(BreakerEntry::new);
        entry.consecutive_failures += 1;

        if entry.state == CircuitState::HalfOpen
            || entry.consecutive_failures >= self.failure_threshold
        {
            entry.state = CircuitState::Open;
            entry.opened_at = Some(Instant::now());
            tracing::warn!(signature, failures = entry.consecutive_failures, "circuit opened");
        }
    }
}
