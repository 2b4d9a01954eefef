//! Execution planning
//!
//! Kahn's-algorithm topological sort grouped into stages. Every node in a
//! stage has in-degree zero once earlier stages complete, so nodes within a
//! stage are free to run in parallel.

use std::collections::{HashMap, HashSet};

use super::{Connection, WorkflowError, WorkflowNode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Node ids grouped into ordered stages
    pub stages: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn node_count(&self) -> usize {
        self.stages.iter().map(Vec::len).sum()
    }
}

/// Group nodes into ordered stages. A stage is the set of nodes whose
/// remaining in-degree is zero; duplicate edges between the same pair count
/// once. Cycles are reported with the offending node ids.
pub fn build_execution_plan(
    nodes: &[WorkflowNode],
    connections: &[Connection],
) -> Result<ExecutionPlan, WorkflowError> {
    let mut in_degree: HashMap<&str, usize> = nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut seen_edges: HashSet<(&str, &str)> = HashSet::new();

    for connection in connections {
        let edge = (connection.source.as_str(), connection.target.as_str());
        if !seen_edges.insert(edge) {
            continue;
        }
        successors.entry(edge.0).or_default().push(edge.1);
        if let Some(degree) = in_degree.get_mut(edge.1) {
            *degree += 1;
        }
    }

    let mut stages: Vec<Vec<String>> = Vec::new();
    let mut placed = 0usize;

    // Preserve node declaration order within each stage
    let order: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    let mut ready: Vec<&str> = order
        .iter()
        .filter(|id| in_degree.get(*id) == Some(&0))
        .copied()
        .collect();

    while !ready.is_empty() {
        let stage: Vec<&str> = std::mem::take(&mut ready);
        placed += stage.len();

        let mut next: HashSet<&str> = HashSet::new();
        for id in &stage {
            for successor in successors.get(id).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(successor);
                    }
                }
            }
        }

        stages.push(stage.iter().map(|s| s.to_string()).collect());
        ready = order
            .iter()
            .filter(|id| next.contains(*id))
            .copied()
            .collect();
    }

    if placed != nodes.len() {
        let stuck: Vec<String> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(WorkflowError::CycleDetected(stuck));
    }

    Ok(ExecutionPlan { stages })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::NodeKind;

    fn node(id: &str) -> WorkflowNode {
        WorkflowNode {
            id: id.to_string(),
            name: id.to_string(),
            kind: NodeKind::Trigger,
        }
    }

    fn edge(source: &str, target: &str) -> Connection {
        Connection {
            source: source.to_string(),
            source_port: None,
            target: target.to_string(),
        }
    }

    fn stage_index(plan: &ExecutionPlan, id: &str) -> usize {
        plan.stages
            .iter()
            .position(|stage| stage.iter().any(|n| n == id))
            .unwrap()
    }

    #[test]
    fn test_diamond_stages() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d")];
        let connections = vec![edge("a", "b"), edge("a", "c"), edge("b", "d"), edge("c", "d")];

        let plan = build_execution_plan(&nodes, &connections).unwrap();
        assert_eq!(plan.stages.len(), 3);
        assert_eq!(plan.stages[0], vec!["a"]);
        assert_eq!(plan.stages[1], vec!["b", "c"]);
        assert_eq!(plan.stages[2], vec!["d"]);
    }

    #[test]
    fn test_union_is_full_node_set_and_order_respects_edges() {
        let nodes = vec![node("a"), node("b"), node("c"), node("d"), node("e")];
        let connections = vec![edge("a", "c"), edge("b", "c"), edge("c", "d"), edge("b", "e")];

        let plan = build_execution_plan(&nodes, &connections).unwrap();
        assert_eq!(plan.node_count(), nodes.len());

        for connection in &connections {
            assert!(
                stage_index(&plan, &connection.source) < stage_index(&plan, &connection.target),
                "{} must precede {}",
                connection.source,
                connection.target
            );
        }
    }

    #[test]
    fn test_disconnected_nodes_share_first_stage() {
        let nodes = vec![node("a"), node("b")];
        let plan = build_execution_plan(&nodes, &[]).unwrap();
        assert_eq!(plan.stages, vec![vec!["a".to_string(), "b".to_string()]]);
    }

    #[test]
    fn test_duplicate_edges_count_once() {
        let nodes = vec![node("a"), node("b")];
        let connections = vec![edge("a", "b"), edge("a", "b")];

        let plan = build_execution_plan(&nodes, &connections).unwrap();
        assert_eq!(plan.stages.len(), 2);
    }

    #[test]
    fn test_cycle_reported() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let connections = vec![edge("a", "b"), edge("b", "c"), edge("c", "a")];

        let err = build_execution_plan(&nodes, &connections).unwrap_err();
        match err {
            WorkflowError::CycleDetected(stuck) => assert_eq!(stuck.len(), 3),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }
}
