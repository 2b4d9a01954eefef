//! Autonomous loop scheduler
//!
//! One cancellable control loop per active agent, driving the
//! Observe → Reason → Plan → Act → Reflect cycle. The registry guarantees at
//! most one live loop per agent id; stopping cancels the inter-cycle wait.

pub mod cycle;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::runtime::AgentRuntime;
use crate::state::Lifecycle;

pub use cycle::{ActionType, PlannedAction};

struct LoopHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Tracks the set of running agent loops
#[derive(Default)]
pub struct LoopRegistry {
    loops: Mutex<HashMap<String, LoopHandle>>,
}

impl LoopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a loop for an agent. A no-op returning false when a loop is
    /// already running for that id or the agent cannot be scheduled.
    pub fn start(&self, runtime: Arc<AgentRuntime>, agent_id: &str) -> bool {
        match runtime.agents.get(agent_id) {
            Some(agent) if agent.lifecycle != Lifecycle::Retired => {}
            _ => return false,
        }

        let mut loops = self.loops.lock();
        loops.retain(|_, h| !h.handle.is_finished());
        if loops.contains_key(agent_id) {
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(cycle::run_loop(
            runtime,
            agent_id.to_string(),
            token.clone(),
        ));
        loops.insert(agent_id.to_string(), LoopHandle { token, handle });
        tracing::info!(agent_id, "loop started");
        true
    }

    /// Cancel an agent's loop. The current wait is interrupted; an in-flight
    /// cycle finishes on its own.
    pub fn stop(&self, agent_id: &str) -> bool {
        let removed = self.loops.lock().remove(agent_id);
        match removed {
            Some(handle) => {
                handle.token.cancel();
                tracing::info!(agent_id, "loop stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let mut loops = self.loops.lock();
        for (agent_id, handle) in loops.drain() {
            handle.token.cancel();
            tracing::info!(%agent_id, "loop stopped");
        }
    }

    pub fn is_running(&self, agent_id: &str) -> bool {
        let mut loops = self.loops.lock();
        loops.retain(|_, h| !h.handle.is_finished());
        loops.contains_key(agent_id)
    }

    pub fn running(&self) -> Vec<String> {
        let mut loops = self.loops.lock();
        loops.retain(|_, h| !h.handle.is_finished());
        let mut ids: Vec<String> = loops.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentSpec, RuntimeConfig};
    use crate::llm::StubModel;
    use crate::state::AutonomyMode;

    fn runtime() -> Arc<AgentRuntime> {
        let config = RuntimeConfig {
            loop_interval_ms: 20,
            step_timeout_ms: 500,
            ..RuntimeConfig::default()
        };
        Arc::new(AgentRuntime::new(config, Arc::new(StubModel::new())))
    }

    fn deploy(runtime: &AgentRuntime, name: &str) -> String {
        runtime
            .agents
            .deploy(&AgentSpec {
                name: name.to_string(),
                task: "idle around".to_string(),
                autonomy: AutonomyMode::Suggest,
                capabilities: vec![],
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_single_loop_per_agent() {
        let runtime = runtime();
        let agent_id = deploy(&runtime, "solo");
        let registry = LoopRegistry::new();

        assert!(registry.start(runtime.clone(), &agent_id));
        assert!(!registry.start(runtime.clone(), &agent_id));
        assert_eq!(registry.running(), vec![agent_id.clone()]);

        registry.stop(&agent_id);
        assert!(!registry.is_running(&agent_id));
    }

    #[tokio::test]
    async fn test_stop_then_start_yields_one_loop() {
        let runtime = runtime();
        let agent_id = deploy(&runtime, "solo");
        let registry = LoopRegistry::new();

        assert!(registry.start(runtime.clone(), &agent_id));
        assert!(registry.stop(&agent_id));
        assert!(registry.start(runtime.clone(), &agent_id));
        assert_eq!(registry.running().len(), 1);

        registry.stop_all();
    }

    #[tokio::test]
    async fn test_unknown_or_retired_agent_never_starts() {
        let runtime = runtime();
        let registry = LoopRegistry::new();
        assert!(!registry.start(runtime.clone(), "ghost"));

        let agent_id = deploy(&runtime, "done");
        runtime.agents.retire(&agent_id).unwrap();
        assert!(!registry.start(runtime.clone(), &agent_id));
    }
}
