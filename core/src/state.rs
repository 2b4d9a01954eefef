//! Agent runtime state
//!
//! The authoritative record of every deployed agent: identity, autonomy mode,
//! goal stack, thinking log, lifecycle, heartbeat, and the approval queue
//! used when an autonomy mode requires confirmation before acting. All
//! mutations are last-writer-wins under a single lock.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::AgentSpec;
use crate::error::{ColonyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutonomyMode {
    FullAuto,
    #[default]
    AskFirst,
    Suggest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Deployed,
    Thinking,
    Acting,
    Healing,
    Waiting,
    Retired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub priority: u32,
    pub status: GoalStatus,
}

/// Control-loop phase, also used to tag thinking-log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Observe,
    Reason,
    Plan,
    Act,
    Reflect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtEntry {
    pub phase: Phase,
    pub content: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub task: String,
    pub autonomy: AutonomyMode,
    pub lifecycle: Lifecycle,
    pub goals: Vec<Goal>,
    pub thinking: Vec<ThoughtEntry>,
    pub error_count: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub capability_ids: Vec<String>,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// An action (or batch) awaiting explicit user confirmation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    pub payload: Value,
    pub status: ApprovalStatus,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    agents: HashMap<String, Agent>,
    approvals: Vec<ApprovalRequest>,
}

/// Store of all deployed agents plus the approval queue
#[derive(Default)]
pub struct AgentStore {
    inner: Mutex<StoreInner>,
}

impl AgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy a new agent. Fails if the id is already taken.
    pub fn deploy(&self, spec: &AgentSpec) -> Result<Agent> {
        let id = slugify(&spec.name);
        let mut inner = self.inner.lock();
        if inner.agents.contains_key(&id) {
            return Err(ColonyError::AgentAlreadyDeployed(id));
        }

        let now = Utc::now();
        let agent = Agent {
            id: id.clone(),
            name: spec.name.clone(),
            task: spec.task.clone(),
            autonomy: spec.autonomy,
            lifecycle: Lifecycle::Deployed,
            goals: Vec::new(),
            thinking: Vec::new(),
            error_count: 0,
            last_heartbeat: now,
            capability_ids: spec.capabilities.clone(),
            deployed_at: now,
        };
        inner.agents.insert(id, agent.clone());
        tracing::info!(agent_id = %agent.id, "agent deployed");
        Ok(agent)
    }

    /// Mark an agent retired. Retired agents never re-enter the loop.
    pub fn retire(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |agent| agent.lifecycle = Lifecycle::Retired)
    }

    /// Remove a retired agent's record entirely
    pub fn remove(&self, agent_id: &str) {
        self.inner.lock().agents.remove(agent_id);
    }

    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.inner.lock().agents.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.inner.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn set_lifecycle(&self, agent_id: &str, lifecycle: Lifecycle) -> Result<()> {
        self.update(agent_id, |agent| agent.lifecycle = lifecycle)
    }

    /// Push a goal onto the agent's stack. Rejects a duplicate active goal id.
    pub fn push_goal(&self, agent_id: &str, goal: Goal) -> Result<()> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ColonyError::AgentNotFound(agent_id.to_string()))?;

        if agent
            .goals
            .iter()
            .any(|g| g.id == goal.id && g.status == GoalStatus::Active)
        {
            return Err(ColonyError::DuplicateGoal {
                agent_id: agent_id.to_string(),
                goal_id: goal.id,
            });
        }
        agent.goals.push(goal);
        Ok(())
    }

    pub fn complete_goal(&self, agent_id: &str, goal_id: &str) -> Result<()> {
        self.update(agent_id, |agent| {
            if let Some(goal) = agent
                .goals
                .iter_mut()
                .find(|g| g.id == goal_id && g.status == GoalStatus::Active)
            {
                goal.status = GoalStatus::Completed;
            }
        })
    }

    /// Append to the agent's thinking log
    pub fn record_thought(
        &self,
        agent_id: &str,
        phase: Phase,
        content: impl Into<String>,
        duration_ms: u64,
    ) -> Result<()> {
        let content = content.into();
        self.update(agent_id, move |agent| {
            agent.thinking.push(ThoughtEntry {
                phase,
                content,
                duration_ms,
                timestamp: Utc::now(),
            });
        })
    }

    pub fn heartbeat(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |agent| agent.last_heartbeat = Utc::now())
    }

    pub fn bump_error(&self, agent_id: &str) -> Result<()> {
        self.update(agent_id, |agent| agent.error_count += 1)
    }

    fn update(&self, agent_id: &str, f: impl FnOnce(&mut Agent)) -> Result<()> {
        let mut inner = self.inner.lock();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| ColonyError::AgentNotFound(agent_id.to_string()))?;
        f(agent);
        Ok(())
    }

    // =========================================================================
    // Approval queue
    // =========================================================================

    pub fn queue_approval(
        &self,
        agent_id: &str,
        description: impl Into<String>,
        payload: Value,
    ) -> ApprovalRequest {
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            description: description.into(),
            payload,
            status: ApprovalStatus::Pending,
            reason: None,
            created_at: Utc::now(),
        };
        self.inner.lock().approvals.push(request.clone());
        request
    }

    pub fn approve(&self, approval_id: &str) -> Result<ApprovalRequest> {
        self.resolve_approval(approval_id, ApprovalStatus::Approved, None)
    }

    pub fn reject(&self, approval_id: &str, reason: impl Into<String>) -> Result<ApprovalRequest> {
        self.resolve_approval(approval_id, ApprovalStatus::Rejected, Some(reason.into()))
    }

    fn resolve_approval(
        &self,
        approval_id: &str,
        status: ApprovalStatus,
        reason: Option<String>,
    ) -> Result<ApprovalRequest> {
        let mut inner = self.inner.lock();
        let request = inner
            .approvals
            .iter_mut()
            .find(|r| r.id == approval_id)
            .ok_or_else(|| ColonyError::ApprovalNotFound(approval_id.to_string()))?;
        request.status = status;
        request.reason = reason;
        Ok(request.clone())
    }

    pub fn pending_approvals(&self, agent_id: Option<&str>) -> Vec<ApprovalRequest> {
        self.inner
            .lock()
            .approvals
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .filter(|r| agent_id.map(|id| r.agent_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }
}

fn slugify(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> AgentSpec {
        AgentSpec {
            name: name.to_string(),
            task: "watch the queue".to_string(),
            autonomy: AutonomyMode::FullAuto,
            capabilities: vec!["mail".to_string()],
        }
    }

    #[test]
    fn test_deploy_and_duplicate() {
        let store = AgentStore::new();
        let agent = store.deploy(&spec("Ops Watcher")).unwrap();
        assert_eq!(agent.id, "ops-watcher");
        assert_eq!(agent.lifecycle, Lifecycle::Deployed);

        let err = store.deploy(&spec("Ops Watcher"));
        assert!(matches!(err, Err(ColonyError::AgentAlreadyDeployed(_))));
    }

    #[test]
    fn test_duplicate_active_goal_rejected() {
        let store = AgentStore::new();
        let agent = store.deploy(&spec("a")).unwrap();
        let goal = Goal {
            id: "g1".to_string(),
            description: "triage".to_string(),
            priority: 1,
            status: GoalStatus::Active,
        };

        store.push_goal(&agent.id, goal.clone()).unwrap();
        let err = store.push_goal(&agent.id, goal.clone());
        assert!(matches!(err, Err(ColonyError::DuplicateGoal { .. })));

        // Completing the goal frees the id
        store.complete_goal(&agent.id, "g1").unwrap();
        store.push_goal(&agent.id, goal).unwrap();
    }

    #[test]
    fn test_thinking_log_appends() {
        let store = AgentStore::new();
        let agent = store.deploy(&spec("a")).unwrap();

        store
            .record_thought(&agent.id, Phase::Observe, "2 unread", 12)
            .unwrap();
        store
            .record_thought(&agent.id, Phase::Reason, "quiet shift", 90)
            .unwrap();

        let agent = store.get(&agent.id).unwrap();
        assert_eq!(agent.thinking.len(), 2);
        assert_eq!(agent.thinking[0].phase, Phase::Observe);
    }

    #[test]
    fn test_retire_then_remove() {
        let store = AgentStore::new();
        let agent = store.deploy(&spec("a")).unwrap();

        store.retire(&agent.id).unwrap();
        assert_eq!(store.get(&agent.id).unwrap().lifecycle, Lifecycle::Retired);

        store.remove(&agent.id);
        assert!(store.get(&agent.id).is_none());
    }

    #[test]
    fn test_approval_queue() {
        let store = AgentStore::new();
        let agent = store.deploy(&spec("a")).unwrap();

        let request = store.queue_approval(&agent.id, "send mail", serde_json::json!({}));
        assert_eq!(store.pending_approvals(Some(&agent.id)).len(), 1);

        store.approve(&request.id).unwrap();
        assert!(store.pending_approvals(Some(&agent.id)).is_empty());

        let err = store.reject("missing", "why");
        assert!(matches!(err, Err(ColonyError::ApprovalNotFound(_))));
    }
}
