//! Workflow execution
//!
//! Runs a validated workflow stage by stage. Each executed node yields a
//! Start event and exactly one terminal event; node failures become Error
//! events and the run continues, with downstream nodes seeing null output.
//! Nodes behind a non-selected branch port are pruned and never emit events.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Duration};

use super::expr;
use super::{
    build_execution_plan, NodeEvent, NodeEventKind, NodeKind, AggregateOp, Workflow,
    WorkflowError, WorkflowNode,
};
use crate::capability::CapabilityRegistry;
use crate::llm::{ChatMessage, ChatModel, ChatRequest};

/// Output of one node run: the value passed downstream, plus the selected
/// branch port for if_else/switch nodes.
struct NodeOutput {
    value: Value,
    port: Option<String>,
}

impl NodeOutput {
    fn value(value: Value) -> Self {
        Self { value, port: None }
    }
}

pub struct WorkflowExecutor {
    registry: Arc<CapabilityRegistry>,
    model: Arc<dyn ChatModel>,
    model_name: String,
    http: reqwest::Client,
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        model: Arc<dyn ChatModel>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            model,
            model_name: model_name.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Execute a workflow against an input payload, yielding node events in
    /// stage order. The workflow is expected to have passed `validate()`;
    /// an unplannable graph produces no events.
    pub fn execute<'a>(
        &'a self,
        workflow: &'a Workflow,
        input: Value,
    ) -> Pin<Box<dyn Stream<Item = NodeEvent> + Send + 'a>> {
        Box::pin(async_stream::stream! {
            let plan = match build_execution_plan(&workflow.nodes, &workflow.connections) {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::error!(workflow = %workflow.id, error = %e, "unplannable workflow");
                    return;
                }
            };

            let mut outputs: HashMap<String, Value> = HashMap::new();
            let mut ports: HashMap<String, String> = HashMap::new();
            let mut skipped: HashSet<String> = HashSet::new();

            for stage in &plan.stages {
                // Resolve inputs and prune unselected branches first
                let mut runnable: Vec<(&WorkflowNode, Value)> = Vec::new();
                for node_id in stage {
                    let Some(node) = workflow.node(node_id) else { continue };
                    let incoming: Vec<_> = workflow
                        .connections
                        .iter()
                        .filter(|c| &c.target == node_id)
                        .collect();

                    if incoming.is_empty() {
                        runnable.push((node, input.clone()));
                        continue;
                    }

                    let active: Vec<_> = incoming
                        .iter()
                        .filter(|c| !skipped.contains(&c.source))
                        .filter(|c| match &c.source_port {
                            None => true,
                            Some(port) => ports.get(&c.source) == Some(port),
                        })
                        .collect();

                    if active.is_empty() {
                        skipped.insert(node_id.clone());
                        continue;
                    }

                    let node_input = if active.len() == 1 {
                        outputs
                            .get(&active[0].source)
                            .cloned()
                            .unwrap_or(Value::Null)
                    } else {
                        // Shallow-overwrite union across predecessors
                        let mut merged = Map::new();
                        for connection in &active {
                            if let Some(Value::Object(map)) = outputs.get(&connection.source) {
                                for (k, v) in map {
                                    merged.insert(k.clone(), v.clone());
                                }
                            }
                        }
                        Value::Object(merged)
                    };
                    runnable.push((node, node_input));
                }

                for (node, node_input) in &runnable {
                    yield NodeEvent::new(&node.id, NodeEventKind::Start, node_input.clone());
                }

                // Stage nodes are independent; run them concurrently
                let results = futures::future::join_all(
                    runnable
                        .iter()
                        .map(|(node, node_input)| self.run_node(node, node_input)),
                )
                .await;

                for ((node, _), result) in runnable.iter().zip(results) {
                    match result {
                        Ok(output) => {
                            if let Some(port) = &output.port {
                                ports.insert(node.id.clone(), port.clone());
                            }
                            outputs.insert(node.id.clone(), output.value.clone());
                            yield NodeEvent::new(&node.id, NodeEventKind::Complete, output.value);
                        }
                        Err(e) => {
                            tracing::warn!(node = %node.id, error = %e, "workflow node failed");
                            outputs.insert(node.id.clone(), Value::Null);
                            yield NodeEvent::new(
                                &node.id,
                                NodeEventKind::Error,
                                json!({"error": e.to_string()}),
                            );
                        }
                    }
                }
            }
        })
    }

    async fn run_node(
        &self,
        node: &WorkflowNode,
        input: &Value,
    ) -> Result<NodeOutput, WorkflowError> {
        match &node.kind {
            NodeKind::Trigger => Ok(NodeOutput::value(input.clone())),

            NodeKind::ToolAction {
                capability,
                action,
                params,
            } => {
                // Node-declared params sit under the incoming data
                let mut merged = match params {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                if let Value::Object(map) = input {
                    for (k, v) in map {
                        merged.insert(k.clone(), v.clone());
                    }
                }

                self.registry
                    .execute(capability, action, &Value::Object(merged))
                    .await
                    .map(NodeOutput::value)
                    .map_err(|e| WorkflowError::NodeFailed {
                        node: node.id.clone(),
                        message: e.to_string(),
                    })
            }

            NodeKind::HttpRequest {
                method,
                url,
                headers,
                body,
                max_retries,
            } => self.http_request(node, method, url, headers, body.as_ref(), *max_retries).await,

            NodeKind::AgentThink { prompt } => {
                let content = self.ask_model(node, prompt, input).await?;
                Ok(NodeOutput::value(json!({ "thought": content })))
            }

            NodeKind::AgentClassify { prompt, classes } => {
                let instruction = format!(
                    "{prompt}\n\nRespond with exactly one of: {}",
                    classes.join(", ")
                );
                let content = self.ask_model(node, &instruction, input).await?;
                let lowered = content.to_lowercase();
                let class = classes
                    .iter()
                    .find(|c| lowered.contains(&c.to_lowercase()))
                    .cloned()
                    .unwrap_or_else(|| content.trim().to_string());
                Ok(NodeOutput::value(json!({ "class": class })))
            }

            NodeKind::AgentExtract { prompt, schema } => {
                self.agent_extract(node, prompt, schema, input).await
            }

            NodeKind::IfElse { condition } => {
                let result = expr::evaluate(condition, input);
                Ok(NodeOutput {
                    value: input.clone(),
                    port: Some(if result { "true" } else { "false" }.to_string()),
                })
            }

            NodeKind::Switch {
                path,
                cases,
                default_port,
            } => {
                let actual = expr::lookup(input, path).cloned().unwrap_or(Value::Null);
                let port = cases
                    .iter()
                    .find(|case| case.value == actual)
                    .map(|case| case.port.clone())
                    .or_else(|| default_port.clone())
                    .unwrap_or_else(|| "default".to_string());
                Ok(NodeOutput {
                    value: input.clone(),
                    port: Some(port),
                })
            }

            NodeKind::Loop { items_path } => {
                let items = self.items_at(node, input, items_path)?;
                let count = items.len();
                Ok(NodeOutput::value(json!({ "items": items, "count": count })))
            }

            NodeKind::Filter {
                items_path,
                condition,
            } => {
                let items = self.items_at(node, input, items_path)?;
                let kept: Vec<Value> = items
                    .into_iter()
                    .filter(|item| expr::evaluate(condition, item))
                    .collect();
                let count = kept.len();
                Ok(NodeOutput::value(json!({ "items": kept, "count": count })))
            }

            NodeKind::Aggregate {
                op,
                items_path,
                value_path,
            } => {
                let items = self.items_at(node, input, items_path)?;
                let numbers: Vec<f64> = items
                    .iter()
                    .filter_map(|item| match value_path {
                        Some(path) => expr::lookup(item, path),
                        None => Some(item),
                    })
                    .filter_map(|v| v.as_f64())
                    .collect();

                let result = match op {
                    AggregateOp::Count => items.len() as f64,
                    AggregateOp::Sum => numbers.iter().sum(),
                    AggregateOp::Avg => {
                        if numbers.is_empty() {
                            0.0
                        } else {
                            numbers.iter().sum::<f64>() / numbers.len() as f64
                        }
                    }
                    AggregateOp::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
                    AggregateOp::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                Ok(NodeOutput::value(json!({ "result": result })))
            }

            NodeKind::MapFields { mappings } => {
                let mut out = Map::new();
                for (target, path) in mappings {
                    out.insert(
                        target.clone(),
                        expr::lookup(input, path).cloned().unwrap_or(Value::Null),
                    );
                }
                Ok(NodeOutput::value(Value::Object(out)))
            }

            NodeKind::SetVariable { name, value } => {
                let mut out = match input {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                out.insert(name.clone(), value.clone());
                Ok(NodeOutput::value(Value::Object(out)))
            }

            NodeKind::Template { template } => Ok(NodeOutput::value(
                json!({ "text": expr::render_template(template, input) }),
            )),
        }
    }

    fn items_at(
        &self,
        node: &WorkflowNode,
        input: &Value,
        path: &str,
    ) -> Result<Vec<Value>, WorkflowError> {
        match expr::lookup(input, path) {
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(_) | None => Err(WorkflowError::NodeFailed {
                node: node.id.clone(),
                message: format!("no array at path `{path}`"),
            }),
        }
    }

    async fn ask_model(
        &self,
        node: &WorkflowNode,
        prompt: &str,
        input: &Value,
    ) -> Result<String, WorkflowError> {
        let rendered = expr::render_template(prompt, input);
        let request = ChatRequest::new(
            self.model_name.clone(),
            vec![ChatMessage::user(format!("{rendered}\n\nInput data:\n{input}"))],
        );
        self.model
            .chat(&request)
            .await
            .map(|response| response.content())
            .map_err(|e| WorkflowError::NodeFailed {
                node: node.id.clone(),
                message: e.to_string(),
            })
    }

    /// Ask the model for JSON matching a schema, with exactly one corrective
    /// retry carrying the validation error before failing.
    async fn agent_extract(
        &self,
        node: &WorkflowNode,
        prompt: &str,
        schema: &Value,
        input: &Value,
    ) -> Result<NodeOutput, WorkflowError> {
        let validator =
            jsonschema::validator_for(schema).map_err(|e| WorkflowError::InvalidSchema {
                node: node.id.clone(),
                message: e.to_string(),
            })?;

        let base_prompt = format!(
            "{prompt}\n\nRespond with only JSON matching this schema:\n{schema}"
        );

        let mut last_error = String::new();
        for attempt in 0..2 {
            let full_prompt = if attempt == 0 {
                base_prompt.clone()
            } else {
                format!("{base_prompt}\n\nYour previous response was invalid: {last_error}")
            };

            let content = self.ask_model(node, &full_prompt, input).await?;
            let candidate = match extract_json(&content) {
                Some(value) => value,
                None => {
                    last_error = "response was not valid JSON".to_string();
                    continue;
                }
            };

            match validator.validate(&candidate) {
                Ok(()) => return Ok(NodeOutput::value(candidate)),
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(WorkflowError::NodeFailed {
            node: node.id.clone(),
            message: format!("Schema validation failed: {last_error}"),
        })
    }

    async fn http_request(
        &self,
        node: &WorkflowNode,
        method: &str,
        url: &str,
        headers: &HashMap<String, String>,
        body: Option<&Value>,
        max_retries: u32,
    ) -> Result<NodeOutput, WorkflowError> {
        let method: reqwest::Method =
            method
                .to_uppercase()
                .parse()
                .map_err(|_| WorkflowError::NodeFailed {
                    node: node.id.clone(),
                    message: format!("invalid HTTP method `{method}`"),
                })?;

        let mut attempt = 0;
        loop {
            let mut request = self.http.request(method.clone(), url);
            for (key, value) in headers {
                request = request.header(key, value);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 429 && attempt < max_retries {
                        let wait = response
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or_else(|| backoff_delay(attempt));
                        sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(WorkflowError::NodeFailed {
                            node: node.id.clone(),
                            message: format!("HTTP {status}"),
                        });
                    }

                    let status_code = status.as_u16();
                    let text = response.text().await.unwrap_or_default();
                    let value = serde_json::from_str(&text)
                        .unwrap_or_else(|_| json!({ "body": text, "status": status_code }));
                    return Ok(NodeOutput::value(value));
                }
                Err(e) if attempt < max_retries => {
                    sleep(backoff_delay(attempt)).await;
                    attempt += 1;
                    tracing::debug!(node = %node.id, error = %e, attempt, "http retry");
                }
                Err(e) => {
                    return Err(WorkflowError::NodeFailed {
                        node: node.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(100u64.saturating_mul(2u64.saturating_pow(attempt)))
}

/// Pull the first JSON object or array out of model output, tolerating code
/// fences and surrounding prose.
pub(crate) fn extract_json(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    let without_fence = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = without_fence {
        if let Ok(value) = serde_json::from_str(inner) {
            return Some(value);
        }
    }

    let start = trimmed.find(['{', '['])?;
    let open = trimmed.as_bytes()[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let end = trimmed.bytes().rposition(|b| b == close)?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}
