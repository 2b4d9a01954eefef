//! Runtime context
//!
//! Owns every piece of shared state (bus, memory, capabilities, guards,
//! agent records, repair log, workflows) and wires them together. No ambient
//! globals; multiple independent runtimes can coexist in one process.

use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::config::RuntimeConfig;
use crate::bus::MessageBus;
use crate::guard::Guards;
use crate::healing::HealingEngine;
use crate::llm::ChatModel;
use crate::memory::MemoryStore;
use crate::state::AgentStore;
use crate::workflow::{WorkflowExecutor, WorkflowStore};

pub struct AgentRuntime {
    pub config: RuntimeConfig,
    pub bus: Arc<MessageBus>,
    pub memory: Arc<MemoryStore>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub guards: Guards,
    pub agents: Arc<AgentStore>,
    pub healer: HealingEngine,
    pub workflows: Arc<WorkflowStore>,
    pub executor: WorkflowExecutor,
    pub model: Arc<dyn ChatModel>,
}

impl AgentRuntime {
    pub fn new(config: RuntimeConfig, model: Arc<dyn ChatModel>) -> Self {
        let capabilities = Arc::new(CapabilityRegistry::new(config.mock_fallback));
        let guards = Guards::from_config(&config);
        let healer = HealingEngine::new(capabilities.clone(), config.retry.clone())
            .with_model(model.clone(), config.model.model.clone());
        let executor = WorkflowExecutor::new(
            capabilities.clone(),
            model.clone(),
            config.model.model.clone(),
        );

        Self {
            config,
            bus: Arc::new(MessageBus::new()),
            memory: Arc::new(MemoryStore::new()),
            capabilities,
            guards,
            agents: Arc::new(AgentStore::new()),
            healer,
            workflows: Arc::new(WorkflowStore::new()),
            executor,
            model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubModel;

    #[test]
    fn test_runtimes_are_isolated() {
        let a = AgentRuntime::new(RuntimeConfig::default(), Arc::new(StubModel::new()));
        let b = AgentRuntime::new(RuntimeConfig::default(), Arc::new(StubModel::new()));

        a.bus.publish("x", "t", "only in a", crate::bus::Priority::Normal);
        assert_eq!(a.bus.log_len(), 1);
        assert_eq!(b.bus.log_len(), 0);
    }
}
