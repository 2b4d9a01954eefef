//! The Observe → Reason → Plan → Act → Reflect cycle
//!
//! Every phase degrades to a safe default when the model is unavailable or
//! returns something unparseable; the loop always completes a cycle. An
//! uncaught error anywhere sends the agent through the healing path and back
//! to waiting.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::bus::Priority;
use crate::error::{ColonyError, Result};
use crate::llm::{ChatMessage, ChatRequest};
use crate::runtime::AgentRuntime;
use crate::state::{Agent, AutonomyMode, GoalStatus, Lifecycle, Phase};
use crate::workflow::exec::extract_json;
use crate::workflow::WorkflowError;

/// Topic every agent publishes its cycle summary to
pub const COORDINATION_TOPIC: &str = "colony.coordination";
/// Topic healing reports are published to
pub const HEALING_TOPIC: &str = "colony.healing";

const NO_REASONING: &str = "no reasoning available";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Tool,
    Connector,
    Workflow,
    Message,
    #[default]
    None,
}

/// One action proposed by the Plan phase
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlannedAction {
    #[serde(default, alias = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub workflow: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub description: String,
}

impl PlannedAction {
    fn none(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Circuit-breaker signature for this action
    fn signature(&self) -> String {
        match self.action_type {
            ActionType::Tool | ActionType::Connector => format!(
                "{}:{}",
                self.capability.as_deref().unwrap_or("unknown"),
                self.action.as_deref().unwrap_or("unknown"),
            ),
            ActionType::Workflow => {
                format!("workflow:{}", self.workflow.as_deref().unwrap_or("unknown"))
            }
            ActionType::Message => {
                format!("message:{}", self.topic.as_deref().unwrap_or(COORDINATION_TOPIC))
            }
            ActionType::None => "none".to_string(),
        }
    }

    /// Lock target: the contested external resource
    fn target(&self) -> String {
        match self.action_type {
            ActionType::Tool | ActionType::Connector => {
                self.capability.clone().unwrap_or_else(|| "unknown".to_string())
            }
            ActionType::Workflow => self.workflow.clone().unwrap_or_else(|| "unknown".to_string()),
            ActionType::Message => self
                .topic
                .clone()
                .unwrap_or_else(|| COORDINATION_TOPIC.to_string()),
            ActionType::None => "none".to_string(),
        }
    }

    fn estimated_tokens(&self) -> u64 {
        let params = serde_json::to_string(&self.params)
            .map(|s| s.len())
            .unwrap_or(0);
        let content = self.content.as_ref().map(String::len).unwrap_or(0);
        ((params + content) as u64).div_ceil(4) + 16
    }
}

/// The per-agent control loop. Runs until cancelled, the agent disappears,
/// or the agent is retired.
pub(crate) async fn run_loop(
    runtime: Arc<AgentRuntime>,
    agent_id: String,
    token: CancellationToken,
) {
    loop {
        match runtime.agents.get(&agent_id) {
            Some(agent) if agent.lifecycle != Lifecycle::Retired => {}
            _ => {
                tracing::info!(%agent_id, "agent gone or retired, loop ending");
                break;
            }
        }
        if token.is_cancelled() {
            break;
        }

        match run_cycle(&runtime, &agent_id).await {
            Ok(summary) => {
                tracing::debug!(%agent_id, %summary, "cycle complete");
            }
            Err(e) => {
                heal_and_resume(&runtime, &agent_id, &e).await;
            }
        }

        // The inter-cycle sleep is the primary cancellation point
        tokio::select! {
            _ = sleep(runtime.config.loop_interval()) => {}
            _ = token.cancelled() => break,
        }
    }
}

async fn heal_and_resume(runtime: &AgentRuntime, agent_id: &str, error: &ColonyError) {
    tracing::warn!(agent_id, error = %error, "cycle failed, healing");
    let _ = runtime.agents.set_lifecycle(agent_id, Lifecycle::Healing);
    let _ = runtime.agents.bump_error(agent_id);

    let record = runtime
        .healer
        .heal(agent_id, &error.to_string(), None)
        .await;

    runtime.bus.publish(
        agent_id,
        HEALING_TOPIC,
        &format!(
            "{} repair for {} error: {}",
            match record.status {
                crate::healing::RepairStatus::Resolved => "resolved",
                _ => "failed",
            },
            record.error_class,
            record.error_message
        ),
        Priority::High,
    );

    let _ = runtime.agents.set_lifecycle(agent_id, Lifecycle::Waiting);
}

/// One full cycle. Errors bubbling out of here put the agent into healing.
pub async fn run_cycle(runtime: &AgentRuntime, agent_id: &str) -> Result<String> {
    let agent = runtime
        .agents
        .get(agent_id)
        .ok_or_else(|| ColonyError::AgentNotFound(agent_id.to_string()))?;
    runtime.agents.heartbeat(agent_id)?;
    runtime.agents.set_lifecycle(agent_id, Lifecycle::Thinking)?;

    // ---- Observe -----------------------------------------------------------
    let started = Instant::now();
    let unread = runtime.bus.unread(agent_id);
    let batch: Vec<_> = unread
        .into_iter()
        .take(runtime.config.observe_batch)
        .collect();
    for message in &batch {
        runtime.bus.acknowledge(agent_id, &message.id);
    }
    let pruned = runtime.memory.prune(agent_id, runtime.config.memory_cap);
    if pruned > 0 {
        tracing::debug!(agent_id, pruned, "memories pruned");
    }

    let active_goals = agent
        .goals
        .iter()
        .filter(|g| g.status == GoalStatus::Active)
        .count();
    let observation = format!(
        "{} active goals, {} new messages, {} errors so far",
        active_goals,
        batch.len(),
        agent.error_count
    );
    runtime.agents.record_thought(
        agent_id,
        Phase::Observe,
        &observation,
        started.elapsed().as_millis() as u64,
    )?;

    // ---- Reason ------------------------------------------------------------
    let started = Instant::now();
    let system_prompt = build_system_prompt(runtime, &agent);
    let message_digest: String = batch
        .iter()
        .map(|m| format!("- [{}] {}: {}\n", m.topic, m.from, m.content))
        .collect();

    let reason_request = ChatRequest::new(
        runtime.config.model.model.clone(),
        vec![ChatMessage::user(format!(
            "Current observation: {observation}\n\nNew messages:\n{message_digest}\n\
             Analyze the situation and state what matters most right now."
        ))],
    )
    .with_system(system_prompt.clone());

    let analysis = match timeout(
        runtime.config.step_timeout(),
        runtime.model.chat(&reason_request),
    )
    .await
    {
        Ok(Ok(response)) if !response.content().trim().is_empty() => response.content(),
        _ => NO_REASONING.to_string(),
    };
    runtime.agents.record_thought(
        agent_id,
        Phase::Reason,
        &analysis,
        started.elapsed().as_millis() as u64,
    )?;

    // ---- Plan --------------------------------------------------------------
    let started = Instant::now();
    let actions = plan_actions(runtime, &system_prompt, &analysis).await;
    runtime.agents.record_thought(
        agent_id,
        Phase::Plan,
        format!("{} actions planned", actions.len()),
        started.elapsed().as_millis() as u64,
    )?;

    // ---- Act ---------------------------------------------------------------
    let started = Instant::now();
    runtime.agents.set_lifecycle(agent_id, Lifecycle::Acting)?;
    let act_summary = act(runtime, &agent, &actions).await?;
    runtime.agents.record_thought(
        agent_id,
        Phase::Act,
        &act_summary,
        started.elapsed().as_millis() as u64,
    )?;

    // ---- Reflect -----------------------------------------------------------
    let started = Instant::now();
    let summary = format!("cycle: {observation}; {act_summary}");
    runtime
        .memory
        .remember(agent_id, &summary, "reflection", None);
    runtime
        .bus
        .publish(agent_id, COORDINATION_TOPIC, &summary, Priority::Normal);
    runtime.agents.record_thought(
        agent_id,
        Phase::Reflect,
        &summary,
        started.elapsed().as_millis() as u64,
    )?;

    runtime.agents.set_lifecycle(agent_id, Lifecycle::Waiting)?;
    Ok(summary)
}

fn build_system_prompt(runtime: &AgentRuntime, agent: &Agent) -> String {
    let capabilities: Vec<String> = agent
        .capability_ids
        .iter()
        .filter_map(|id| runtime.capabilities.get(id))
        .map(|c| {
            let actions: Vec<&str> = c.actions.iter().map(|a| a.id.as_str()).collect();
            format!("{} ({})", c.id, actions.join(", "))
        })
        .collect();

    let memories = runtime.memory.context_window(&agent.id, 800);
    let repairs: Vec<String> = runtime
        .healer
        .log()
        .recent(3)
        .into_iter()
        .filter(|r| r.agent_id == agent.id)
        .map(|r| format!("- {} error: {:?}", r.error_class, r.status))
        .collect();

    format!(
        "You are {}, an autonomous agent.\nTask: {}\nAutonomy: {:?}\n\n\
         Capabilities:\n{}\n\nRelevant memories:\n{}\n\nRecent repairs:\n{}",
        agent.name,
        agent.task,
        agent.autonomy,
        capabilities.join("\n"),
        memories,
        repairs.join("\n"),
    )
}

/// Ask the model for a JSON array of typed actions. Never fails: a missing,
/// malformed, or empty response degrades to a single `none` action carrying
/// the raw text.
async fn plan_actions(
    runtime: &AgentRuntime,
    system_prompt: &str,
    analysis: &str,
) -> Vec<PlannedAction> {
    let request = ChatRequest::new(
        runtime.config.model.model.clone(),
        vec![ChatMessage::user(format!(
            "Analysis: {analysis}\n\n\
             Propose next actions as a JSON array. Each element:\n\
             {{\"action_type\": \"tool\"|\"connector\"|\"workflow\"|\"message\"|\"none\",\n\
               \"capability\": ..., \"action\": ..., \"workflow\": ..., \"topic\": ...,\n\
               \"content\": ..., \"params\": {{...}}, \"description\": ...}}\n\
             Respond with only the JSON array."
        ))],
    )
    .with_system(system_prompt.to_string());

    let raw = match timeout(runtime.config.step_timeout(), runtime.model.chat(&request)).await {
        Ok(Ok(response)) => response.content(),
        _ => return vec![PlannedAction::none("no plan available")],
    };

    parse_plan(&raw)
}

fn parse_plan(raw: &str) -> Vec<PlannedAction> {
    let Some(value) = extract_json(raw) else {
        return vec![PlannedAction::none(raw.trim())];
    };

    let items = match value {
        Value::Array(items) => items,
        // Some models wrap the array in an object
        Value::Object(map) => {
            if let Some(Value::Array(items)) = map.get("actions") {
                items.clone()
            } else {
                vec![Value::Object(map)]
            }
        }
        _ => return vec![PlannedAction::none(raw.trim())],
    };

    let actions: Vec<PlannedAction> = items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect();

    if actions.is_empty() {
        vec![PlannedAction::none(raw.trim())]
    } else {
        actions
    }
}

/// Run guards per action, then execute (full_auto) or queue for approval.
async fn act(
    runtime: &AgentRuntime,
    agent: &Agent,
    actions: &[PlannedAction],
) -> Result<String> {
    let mut executed = 0usize;
    let mut blocked = 0usize;
    let mut skipped = 0usize;

    for action in actions {
        if action.action_type == ActionType::None {
            skipped += 1;
            continue;
        }

        let signature = action.signature();
        let target = action.target();
        let estimate = action.estimated_tokens();

        let preflight = runtime.guards.preflight(
            &agent.id,
            &signature,
            &target,
            Priority::Normal,
            estimate,
        );

        if !preflight.allowed {
            blocked += 1;
            runtime.agents.queue_approval(
                &agent.id,
                format!("preflight_blocked: {}", preflight.denials.join("; ")),
                serde_json::to_value(action)?,
            );
            continue;
        }

        if agent.autonomy != AutonomyMode::FullAuto {
            // Queue the remaining batch for confirmation; nothing executes
            runtime.guards.lock.release(&target, &agent.id);
            runtime.agents.queue_approval(
                &agent.id,
                format!("batch of {} actions awaiting approval", actions.len()),
                json!({ "actions": actions }),
            );
            return Ok(format!(
                "{executed} executed, {blocked} blocked, batch queued for approval"
            ));
        }

        // Lock released on every path; breaker and ledger see the outcome
        let result = execute_action(runtime, &agent.id, action).await;
        runtime.guards.lock.release(&target, &agent.id);

        match result {
            Ok(()) => {
                runtime.guards.breaker.record_success(&signature);
                runtime.guards.budget.charge(&agent.id, estimate);
                executed += 1;
            }
            Err(e) => {
                runtime.guards.breaker.record_failure(&signature);
                return Err(e);
            }
        }
    }

    Ok(format!(
        "{executed} executed, {blocked} blocked, {skipped} skipped"
    ))
}

async fn execute_action(
    runtime: &AgentRuntime,
    agent_id: &str,
    action: &PlannedAction,
) -> Result<()> {
    match action.action_type {
        ActionType::Tool | ActionType::Connector => {
            let capability = action.capability.as_deref().unwrap_or_default();
            let action_id = action.action.as_deref().unwrap_or_default();
            runtime
                .capabilities
                .execute(capability, action_id, &action.params)
                .await?;
            Ok(())
        }
        ActionType::Workflow => {
            let workflow_id = action.workflow.as_deref().unwrap_or_default();
            let workflow = runtime
                .workflows
                .get(workflow_id)
                .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))
                .map_err(ColonyError::from)?;

            let mut events = runtime.executor.execute(&workflow, action.params.clone());
            let mut count = 0usize;
            while events.next().await.is_some() {
                count += 1;
            }
            tracing::debug!(agent_id, workflow_id, count, "workflow run finished");
            Ok(())
        }
        ActionType::Message => {
            let topic = action.topic.as_deref().unwrap_or(COORDINATION_TOPIC);
            let content = action.content.as_deref().unwrap_or(&action.description);
            runtime.bus.publish(agent_id, topic, content, Priority::Normal);
            Ok(())
        }
        ActionType::None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{demo_capabilities, Capability, CapabilityBackend, CapabilityError};
    use crate::config::{AgentSpec, RuntimeConfig};
    use crate::llm::StubModel;
    use crate::state::ApprovalStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl CapabilityBackend for CountingBackend {
        async fn execute(
            &self,
            _capability: &Capability,
            _action: &str,
            _params: &Value,
        ) -> std::result::Result<Value, CapabilityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            loop_interval_ms: 10,
            step_timeout_ms: 500,
            retry: crate::config::RetryPolicy {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 2,
                exponential_base: 2.0,
            },
            ..RuntimeConfig::default()
        }
    }

    fn runtime_with(model: StubModel, calls: Arc<AtomicUsize>) -> Arc<AgentRuntime> {
        let mut runtime = AgentRuntime::new(test_config(), Arc::new(model));
        let capabilities = Arc::new(
            crate::capability::CapabilityRegistry::new(false)
                .with_backend(Arc::new(CountingBackend { calls })),
        );
        for capability in demo_capabilities() {
            capabilities.register(capability);
        }
        runtime.capabilities = capabilities.clone();
        runtime.executor = crate::workflow::WorkflowExecutor::new(
            capabilities,
            runtime.model.clone(),
            "stub",
        );
        Arc::new(runtime)
    }

    fn deploy(runtime: &AgentRuntime, autonomy: AutonomyMode) -> String {
        runtime
            .agents
            .deploy(&AgentSpec {
                name: "cycle-agent".to_string(),
                task: "watch the inbox".to_string(),
                autonomy,
                capabilities: vec!["mail".to_string()],
            })
            .unwrap()
            .id
    }

    fn plan_reply() -> String {
        json!([{
            "action_type": "tool",
            "capability": "mail",
            "action": "send",
            "params": {"to": "ops"},
            "description": "notify ops",
        }])
        .to_string()
    }

    #[tokio::test]
    async fn test_full_auto_executes_planned_tool() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(vec!["inbox looks busy".to_string(), plan_reply()]);
        let runtime = runtime_with(model, calls.clone());
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        let summary = run_cycle(&runtime, &agent_id).await.unwrap();
        assert!(summary.contains("1 executed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Budget charged, breaker closed, lock released
        assert!(runtime.guards.budget.spent(&agent_id) > 0);
        assert!(runtime.guards.lock.holder("mail").is_none());
    }

    #[tokio::test]
    async fn test_ask_first_queues_batch_without_executing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(vec!["inbox looks busy".to_string(), plan_reply()]);
        let runtime = runtime_with(model, calls.clone());
        let agent_id = deploy(&runtime, AutonomyMode::AskFirst);

        run_cycle(&runtime, &agent_id).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let pending = runtime.agents.pending_approvals(Some(&agent_id));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, ApprovalStatus::Pending);
        assert!(runtime.guards.lock.holder("mail").is_none());
    }

    #[tokio::test]
    async fn test_open_breaker_blocks_and_queues_approval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(vec!["inbox looks busy".to_string(), plan_reply()]);
        let runtime = runtime_with(model, calls.clone());
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        for _ in 0..runtime.config.breaker.failure_threshold {
            runtime.guards.breaker.record_failure("mail:send");
        }

        run_cycle(&runtime, &agent_id).await.unwrap();

        // The registry's execute was never reached
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let pending = runtime.agents.pending_approvals(Some(&agent_id));
        assert_eq!(pending.len(), 1);
        assert!(pending[0].description.contains("preflight_blocked"));
        assert!(pending[0].description.contains("Circuit breaker"));
    }

    #[tokio::test]
    async fn test_execution_failure_bubbles_for_healing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let plan = json!([{
            "action_type": "tool",
            "capability": "ghost",
            "action": "vanish",
            "description": "use a capability that does not exist",
        }])
        .to_string();
        let model = StubModel::scripted(vec!["inbox looks busy".to_string(), plan]);
        let runtime = runtime_with(model, calls);
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        let err = run_cycle(&runtime, &agent_id).await.unwrap_err();
        assert!(matches!(err, ColonyError::Capability(_)));

        // Lock released on the failure path, breaker saw the failure
        assert!(runtime.guards.lock.holder("ghost").is_none());
        let healed = runtime.healer.heal(&agent_id, &err.to_string(), None).await;
        assert!(healed.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_unparseable_plan_degrades_to_none() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(["thinking...", "I would rather write prose"]);
        let runtime = runtime_with(model, calls.clone());
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        let summary = run_cycle(&runtime, &agent_id).await.unwrap();
        assert!(summary.contains("1 skipped"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reflect_publishes_and_remembers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(["quiet", "[]"]);
        let runtime = runtime_with(model, calls);
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        runtime.bus.subscribe("observer", COORDINATION_TOPIC);
        run_cycle(&runtime, &agent_id).await.unwrap();

        assert_eq!(runtime.bus.unread("observer").len(), 1);
        assert!(runtime.memory.count(&agent_id) > 0);
        let agent = runtime.agents.get(&agent_id).unwrap();
        assert_eq!(agent.lifecycle, Lifecycle::Waiting);
        assert_eq!(agent.thinking.len(), 5);
    }

    #[tokio::test]
    async fn test_observe_acknowledges_messages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let model = StubModel::scripted(["noted", "[]"]);
        let runtime = runtime_with(model, calls);
        let agent_id = deploy(&runtime, AutonomyMode::FullAuto);

        runtime.bus.subscribe(&agent_id, "alerts");
        runtime
            .bus
            .publish("other", "alerts", "disk almost full", Priority::High);
        assert_eq!(runtime.bus.unread_count(&agent_id), 1);

        run_cycle(&runtime, &agent_id).await.unwrap();
        assert_eq!(runtime.bus.unread_count(&agent_id), 0);
    }

    #[test]
    fn test_parse_plan_fallbacks() {
        let actions = parse_plan("not json");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::None);
        assert_eq!(actions[0].description, "not json");

        let actions = parse_plan("[]");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::None);

        let actions = parse_plan(r#"[{"action_type": "message", "topic": "t", "content": "hi"}]"#);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::Message);
    }
}
