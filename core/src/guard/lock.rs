//! Mutual-exclusion lock keyed by action target
//!
//! At most one in-flight action per contested target. A request is denied
//! while an equal- or higher-priority holder is active; a strictly
//! higher-priority request preempts the holder. The holder must release
//! explicitly, on the failure path as well.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::GuardDecision;
use crate::bus::Priority;

#[derive(Debug, Clone)]
pub struct LockHolder {
    pub agent_id: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ActionLock {
    holders: Mutex<HashMap<String, LockHolder>>,
}

impl ActionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the lock on `target`
    pub fn acquire(&self, target: &str, agent_id: &str, priority: Priority) -> GuardDecision {
        let mut holders = self.holders.lock();

        match holders.get(target) {
            None => {
                holders.insert(
                    target.to_string(),
                    LockHolder {
                        agent_id: agent_id.to_string(),
                        priority,
                        acquired_at: Utc::now(),
                    },
                );
                GuardDecision::allow(format!("lock acquired on {target}"))
            }
            Some(holder) if holder.agent_id == agent_id => {
                GuardDecision::allow(format!("lock already held on {target}"))
            }
            Some(holder) if priority > holder.priority => {
                let displaced = holder.agent_id.clone();
                holders.insert(
                    target.to_string(),
                    LockHolder {
                        agent_id: agent_id.to_string(),
                        priority,
                        acquired_at: Utc::now(),
                    },
                );
                tracing::info!(target, %displaced, "lock preempted by higher priority");
                GuardDecision::allow(format!(
                    "lock on {target} preempted from lower-priority holder {displaced}"
                ))
            }
            Some(holder) => GuardDecision::deny(format!(
                "lock on {} held by {} at {:?} priority",
                target, holder.agent_id, holder.priority
            )),
        }
    }

    /// Release the lock if this agent holds it
    pub fn release(&self, target: &str, agent_id: &str) {
        let mut holders = self.holders.lock();
        if holders
            .get(target)
            .map(|h| h.agent_id == agent_id)
            .unwrap_or(false)
        {
            holders.remove(target);
        }
    }

    pub fn holder(&self, target: &str) -> Option<LockHolder> {
        self.holders.lock().get(target).cloned()
    }
}
