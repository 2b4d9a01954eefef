//! Workflow execution engine
//!
//! A workflow is a directed graph of typed nodes. The engine compiles it into
//! topological stages and runs each node against the capability registry, the
//! language model, or pure data transforms, emitting a per-node event stream.

pub mod exec;
pub mod expr;
pub mod plan;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use exec::WorkflowExecutor;
pub use plan::{build_execution_plan, ExecutionPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Node payloads are a tagged union, one variant per node type, validated at
/// load time rather than cast at execution time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    ToolAction {
        capability: String,
        action: String,
        #[serde(default)]
        params: Value,
    },
    HttpRequest {
        method: String,
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<Value>,
        #[serde(default = "default_http_retries")]
        max_retries: u32,
    },
    AgentThink {
        prompt: String,
    },
    AgentClassify {
        prompt: String,
        classes: Vec<String>,
    },
    AgentExtract {
        prompt: String,
        schema: Value,
    },
    IfElse {
        condition: String,
    },
    Switch {
        path: String,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default_port: Option<String>,
    },
    Loop {
        items_path: String,
    },
    Filter {
        items_path: String,
        condition: String,
    },
    Aggregate {
        op: AggregateOp,
        items_path: String,
        #[serde(default)]
        value_path: Option<String>,
    },
    MapFields {
        /// target field -> dotted source path
        mappings: HashMap<String, String>,
    },
    SetVariable {
        name: String,
        value: Value,
    },
    Template {
        template: String,
    },
}

fn default_http_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub value: Value,
    pub port: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateOp {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

/// A directed edge. `source_port` selects a branch output ("true"/"false"
/// for if_else, a case port for switch); None follows the default output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub source: String,
    #[serde(default)]
    pub source_port: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub status: WorkflowStatus,
    pub nodes: Vec<WorkflowNode>,
    pub connections: Vec<Connection>,
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("unknown node referenced by connection: {0}")]
    UnknownNode(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("cycle detected among nodes: {0:?}")]
    CycleDetected(Vec<String>),

    #[error("invalid condition on node {node}: {message}")]
    InvalidCondition { node: String, message: String },

    #[error("invalid schema on node {node}: {message}")]
    InvalidSchema { node: String, message: String },

    #[error("node {node} failed: {message}")]
    NodeFailed { node: String, message: String },
}

impl Workflow {
    /// Validate the graph at load time: ids unique, connections reference
    /// known nodes, no cycles, conditions parse, extract schemas compile.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(WorkflowError::DuplicateNode(node.id.clone()));
            }
        }

        for connection in &self.connections {
            for endpoint in [&connection.source, &connection.target] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(WorkflowError::UnknownNode(endpoint.clone()));
                }
            }
        }

        build_execution_plan(&self.nodes, &self.connections)?;

        for node in &self.nodes {
            match &node.kind {
                NodeKind::IfElse { condition } | NodeKind::Filter { condition, .. } => {
                    expr::parse(condition).map_err(|message| WorkflowError::InvalidCondition {
                        node: node.id.clone(),
                        message,
                    })?;
                }
                NodeKind::AgentExtract { schema, .. } => {
                    jsonschema::validator_for(schema).map_err(|e| {
                        WorkflowError::InvalidSchema {
                            node: node.id.clone(),
                            message: e.to_string(),
                        }
                    })?;
                }
                _ => {}
            }
        }

        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// One event in the consumer-facing execution stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: String,
    pub kind: NodeEventKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeEventKind {
    Start,
    Complete,
    Error,
}

impl NodeEvent {
    pub(crate) fn new(node_id: &str, kind: NodeEventKind, data: Value) -> Self {
        Self {
            node_id: node_id.to_string(),
            kind,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// In-memory registry of workflow definitions; status is set externally
#[derive(Default)]
pub struct WorkflowStore {
    workflows: Mutex<HashMap<String, Workflow>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow after load-time validation
    pub fn register(&self, workflow: Workflow) -> Result<(), WorkflowError> {
        workflow.validate()?;
        self.workflows
            .lock()
            .insert(workflow.id.clone(), workflow);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Workflow> {
        self.workflows.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Workflow> {
        let mut all: Vec<Workflow> = self.workflows.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn set_status(&self, id: &str, status: WorkflowStatus) -> Result<(), WorkflowError> {
        let mut workflows = self.workflows.lock();
        let workflow = workflows
            .get_mut(id)
            .ok_or_else(|| WorkflowError::NotFound(id.to_string()))?;
        workflow.status = status;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, kind: NodeKind) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            name: id.to_string(),
            kind,
        }
    }

    fn edge(source: &str, target: &str) -> Connection {
        Connection {
            source: source.to_string(),
            source_port: None,
            target: target.to_string(),
        }
    }

    #[test]
    fn test_validate_rejects_unknown_endpoint() {
        let workflow = Workflow {
            id: "w".to_string(),
            name: "w".to_string(),
            status: WorkflowStatus::Draft,
            nodes: vec![node("a", NodeKind::Trigger)],
            connections: vec![edge("a", "ghost")],
        };
        assert!(matches!(
            workflow.validate(),
            Err(WorkflowError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let workflow = Workflow {
            id: "w".to_string(),
            name: "w".to_string(),
            status: WorkflowStatus::Draft,
            nodes: vec![
                node("a", NodeKind::Trigger),
                node("b", NodeKind::SetVariable {
                    name: "x".to_string(),
                    value: json!(1),
                }),
            ],
            connections: vec![edge("a", "b"), edge("b", "a")],
        };
        assert!(matches!(
            workflow.validate(),
            Err(WorkflowError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_condition() {
        let workflow = Workflow {
            id: "w".to_string(),
            name: "w".to_string(),
            status: WorkflowStatus::Draft,
            nodes: vec![node(
                "c",
                NodeKind::IfElse {
                    condition: "score >=".to_string(),
                },
            )],
            connections: vec![],
        };
        assert!(matches!(
            workflow.validate(),
            Err(WorkflowError::InvalidCondition { .. })
        ));
    }

    #[test]
    fn test_node_kind_deserializes_tagged() {
        let raw = json!({
            "id": "n1",
            "name": "lookup",
            "type": "tool_action",
            "capability": "crm",
            "action": "search",
            "params": {"q": "acme"},
        });
        let node: WorkflowNode = serde_json::from_value(raw).unwrap();
        assert!(matches!(node.kind, NodeKind::ToolAction { .. }));
    }

    #[test]
    fn test_store_register_and_status() {
        let store = WorkflowStore::new();
        let workflow = Workflow {
            id: "w1".to_string(),
            name: "w1".to_string(),
            status: WorkflowStatus::Draft,
            nodes: vec![node("a", NodeKind::Trigger)],
            connections: vec![],
        };
        store.register(workflow).unwrap();

        store.set_status("w1", WorkflowStatus::Active).unwrap();
        assert_eq!(store.get("w1").unwrap().status, WorkflowStatus::Active);

        assert!(matches!(
            store.set_status("missing", WorkflowStatus::Active),
            Err(WorkflowError::NotFound(_))
        ));
    }
}
