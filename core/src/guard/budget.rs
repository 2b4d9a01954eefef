//! Per-agent token budget ledger
//!
//! Tracks consumed tokens against a ceiling. Denies once the estimated next
//! spend would exceed the remaining budget, independent of the other guards.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::GuardDecision;

pub struct BudgetLedger {
    spent: Mutex<HashMap<String, u64>>,
    ceiling: u64,
}

impl BudgetLedger {
    pub fn new(ceiling: u64) -> Self {
        Self {
            spent: Mutex::new(HashMap::new()),
            ceiling,
        }
    }

    /// Check whether the agent can afford an estimated spend
    pub fn check(&self, agent_id: &str, estimated_tokens: u64) -> GuardDecision {
        let spent = self.spent(agent_id);
        let remaining = self.ceiling.saturating_sub(spent);

        if estimated_tokens > remaining {
            GuardDecision::deny(format!(
                "budget exhausted for {}: {} of {} tokens spent, {} requested",
                agent_id, spent, self.ceiling, estimated_tokens
            ))
        } else {
            GuardDecision::allow(format!("{remaining} tokens remaining"))
        }
    }

    /// Record actual consumption
    pub fn charge(&self, agent_id: &str, tokens: u64) {
        *self.spent.lock().entry(agent_id.to_string()).or_insert(0) += tokens;
    }

    pub fn spent(&self, agent_id: &str) -> u64 {
        self.spent.lock().get(agent_id).copied().unwrap_or(0)
    }

    pub fn remaining(&self, agent_id: &str) -> u64 {
        self.ceiling.saturating_sub(self.spent(agent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denies_when_exhausted() {
        let ledger = BudgetLedger::new(100);
        assert!(ledger.check("a", 100).allowed);

        ledger.charge("a", 90);
        assert!(ledger.check("a", 10).allowed);
        let decision = ledger.check("a", 11);
        assert!(!decision.allowed);
        assert!(decision.reason.contains("budget exhausted"));
    }

    #[test]
    fn test_budgets_are_per_agent() {
        let ledger = BudgetLedger::new(50);
        ledger.charge("a", 50);

        assert!(!ledger.check("a", 1).allowed);
        assert!(ledger.check("b", 50).allowed);
        assert_eq!(ledger.remaining("b"), 50);
    }
}
