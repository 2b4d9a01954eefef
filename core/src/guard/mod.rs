//! Guard subsystem
//!
//! Three independent pre-execution checks gate every side-effecting action:
//! a per-action circuit breaker, a per-agent budget ledger, and a
//! mutual-exclusion lock keyed by action target. Each returns an allow/deny
//! decision with a reason; any single denial short-circuits execution.

pub mod breaker;
pub mod budget;
pub mod lock;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::Priority;
use crate::config::{BreakerConfig, RuntimeConfig};

pub use breaker::{CircuitBreaker, CircuitState};
pub use budget::BudgetLedger;
pub use lock::ActionLock;

/// Outcome of a single guard check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: String,
}

impl GuardDecision {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

/// All three guards, evaluated together before the Act phase executes a step
pub struct Guards {
    pub breaker: Arc<CircuitBreaker>,
    pub budget: Arc<BudgetLedger>,
    pub lock: Arc<ActionLock>,
}

/// Result of a preflight evaluation. When allowed, the caller holds the
/// action lock for `target` and must release it on every path.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub allowed: bool,
    /// Denial reasons from every guard that said no
    pub denials: Vec<String>,
}

impl Guards {
    pub fn new(breaker_config: &BreakerConfig, token_budget: u64) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(
                breaker_config.failure_threshold,
                breaker_config.cooldown(),
            )),
            budget: Arc::new(BudgetLedger::new(token_budget)),
            lock: Arc::new(ActionLock::new()),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(&config.breaker, config.token_budget)
    }

    /// Evaluate all three guards for one planned step. The lock is only
    /// acquired when the breaker and budget both allow; on denial nothing is
    /// held.
    pub fn preflight(
        &self,
        agent_id: &str,
        signature: &str,
        target: &str,
        priority: Priority,
        estimated_tokens: u64,
    ) -> Preflight {
        let mut denials = Vec::new();

        let breaker = self.breaker.check(signature);
        if !breaker.allowed {
            denials.push(breaker.reason);
        }

        let budget = self.budget.check(agent_id, estimated_tokens);
        if !budget.allowed {
            denials.push(budget.reason);
        }

        if denials.is_empty() {
            let lock = self.lock.acquire(target, agent_id, priority);
            if !lock.allowed {
                denials.push(lock.reason);
            }
        }

        if !denials.is_empty() {
            tracing::info!(agent_id, signature, ?denials, "preflight blocked");
        }

        Preflight {
            allowed: denials.is_empty(),
            denials,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;

    fn guards() -> Guards {
        Guards::new(
            &BreakerConfig {
                failure_threshold: 2,
                cooldown_ms: 50,
            },
            100,
        )
    }

    #[test]
    fn test_preflight_allows_then_holds_lock() {
        let guards = guards();
        let first = guards.preflight("a", "mail:send", "mail", Priority::Normal, 10);
        assert!(first.allowed);

        // Same target contested until release
        let second = guards.preflight("b", "mail:send", "mail", Priority::Normal, 10);
        assert!(!second.allowed);

        guards.lock.release("mail", "a");
        let third = guards.preflight("b", "mail:send", "mail", Priority::Normal, 10);
        assert!(third.allowed);
    }

    #[test]
    fn test_open_breaker_denies_without_touching_lock() {
        let guards = guards();
        guards.breaker.record_failure("mail:send");
        guards.breaker.record_failure("mail:send");

        let preflight = guards.preflight("a", "mail:send", "mail", Priority::Normal, 10);
        assert!(!preflight.allowed);
        assert!(preflight.denials.iter().any(|r| r.contains("Circuit breaker")));

        // Lock must not be held after a breaker denial
        let other = guards.lock.acquire("mail", "b", Priority::Normal);
        assert!(other.allowed);
    }

    #[test]
    fn test_budget_denial_is_independent() {
        let guards = guards();
        guards.budget.charge("a", 100);

        let preflight = guards.preflight("a", "mail:send", "mail", Priority::Normal, 1);
        assert!(!preflight.allowed);
        assert!(preflight.denials.iter().any(|r| r.contains("budget")));
    }
}
