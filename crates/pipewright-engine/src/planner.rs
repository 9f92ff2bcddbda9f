use std::collections::{HashMap, HashSet};

use serde::Serialize;

use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::graph::{GraphDefinition, Node};

/// A validated run order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub pipeline_id: String,
    /// Node ids, in the order they will run.
    pub order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Turns a node graph into a safe, deterministic run order.
pub struct ExecutionPlanner;

impl ExecutionPlanner {
    /// Structural problems that block a run. Empty means the graph may run.
    pub fn validate(graph: &GraphDefinition) -> Vec<String> {
        let mut errors = Vec::new();

        if graph.nodes.is_empty() {
            errors.push("Pipeline has no nodes".to_string());
            return errors;
        }

        let mut seen = HashSet::new();
        for node in &graph.nodes {
            if !seen.insert(node.id.as_str()) {
                errors.push(format!("Duplicate node id: {}", node.id));
            }
        }

        for node in &graph.nodes {
            for input in node.input_ids() {
                if !seen.contains(input) {
                    errors.push(format!("Node {} references missing input {}", node.id, input));
                }
            }
        }

        errors
    }

    /// Depth-first topological order.
    ///
    /// Roots are visited first in array order, then any node still unvisited.
    /// Each visit walks the node's inputs in declaration order before emitting
    /// the node itself. Re-entering a node that is mid-visit is a cycle.
    pub fn order(nodes: &[Node]) -> Result<Vec<&Node>> {
        let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut ordered = Vec::with_capacity(nodes.len());

        let roots = nodes.iter().filter(|n| n.inputs.is_empty());
        let rest = nodes.iter().filter(|n| !n.inputs.is_empty());
        for node in roots.chain(rest) {
            visit(node, &by_id, &mut marks, &mut ordered)?;
        }

        Ok(ordered)
    }

    /// Validate, then order.
    pub fn plan(graph: &GraphDefinition) -> Result<Plan> {
        let errors = Self::validate(graph);
        if !errors.is_empty() {
            return Err(PipewrightError::Validation(errors));
        }
        let order = Self::order(&graph.nodes)?;
        Ok(Plan {
            pipeline_id: graph.id.clone(),
            order: order.into_iter().map(|n| n.id.clone()).collect(),
        })
    }
}

fn visit<'a>(
    node: &'a Node,
    by_id: &HashMap<&str, &'a Node>,
    marks: &mut HashMap<&'a str, Mark>,
    ordered: &mut Vec<&'a Node>,
) -> Result<()> {
    match marks.get(node.id.as_str()) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(PipewrightError::CircularDependency {
                node: node.id.clone(),
            })
        }
        None => {}
    }

    marks.insert(node.id.as_str(), Mark::Visiting);
    for input in node.input_ids() {
        // Dangling inputs are reported by validate(); ordering ignores them.
        if let Some(upstream) = by_id.get(input) {
            visit(upstream, by_id, marks, ordered)?;
        }
    }
    marks.insert(node.id.as_str(), Mark::Done);
    ordered.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_test_utils::{cyclic_graph, join_graph, linear_graph};

    fn ids(nodes: Vec<&Node>) -> Vec<&str> {
        nodes.into_iter().map(|n| n.id.as_str()).collect()
    }

    #[test]
    fn test_linear_order() {
        let graph = linear_graph("p");
        assert_eq!(ids(ExecutionPlanner::order(&graph.nodes).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_order_ignores_array_position() {
        let graph = GraphDefinition::new(
            "p",
            vec![
                Node::new("C", "manual_data").with_inputs(["B"]),
                Node::new("B", "manual_data").with_inputs(["A"]),
                Node::new("A", "manual_data"),
            ],
        );
        assert_eq!(ids(ExecutionPlanner::order(&graph.nodes).unwrap()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_fan_in_visits_inputs_in_declaration_order() {
        let graph = GraphDefinition::new(
            "p",
            vec![
                Node::new("J", "join").with_inputs(["R", "L"]),
                Node::new("L", "manual_data"),
                Node::new("R", "manual_data").with_inputs(["L"]),
            ],
        );
        assert_eq!(ids(ExecutionPlanner::order(&graph.nodes).unwrap()), vec!["L", "R", "J"]);
    }

    #[test]
    fn test_roots_first_in_array_order() {
        let graph = join_graph("p");
        assert_eq!(ids(ExecutionPlanner::order(&graph.nodes).unwrap()), vec!["L", "R", "J"]);
    }

    #[test]
    fn test_order_is_deterministic() {
        let graph = join_graph("p");
        let first = ids(ExecutionPlanner::order(&graph.nodes).unwrap());
        for _ in 0..10 {
            assert_eq!(ids(ExecutionPlanner::order(&graph.nodes).unwrap()), first);
        }
    }

    #[test]
    fn test_cycle_names_a_node_on_the_cycle() {
        let graph = cyclic_graph("p");
        let err = ExecutionPlanner::order(&graph.nodes).unwrap_err();
        match err {
            PipewrightError::CircularDependency { node } => {
                assert!(node == "A" || node == "B");
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let nodes = vec![Node::new("X", "manual_data").with_inputs(["X"])];
        let err = ExecutionPlanner::order(&nodes).unwrap_err();
        assert!(err.to_string().contains("X"));
    }

    #[test]
    fn test_validate_empty_graph() {
        let graph = GraphDefinition::new("p", vec![]);
        assert_eq!(ExecutionPlanner::validate(&graph), vec!["Pipeline has no nodes"]);
    }

    #[test]
    fn test_validate_missing_input_and_duplicates() {
        let graph = GraphDefinition::new(
            "p",
            vec![
                Node::new("a", "manual_data"),
                Node::new("a", "manual_data"),
                Node::new("b", "filter").with_inputs(["x"]),
            ],
        );
        let errors = ExecutionPlanner::validate(&graph);
        assert_eq!(
            errors,
            vec!["Duplicate node id: a", "Node b references missing input x"]
        );
    }

    #[test]
    fn test_plan_aggregates_validation_errors() {
        let graph = GraphDefinition::new(
            "p",
            vec![
                Node::new("b", "filter").with_inputs(["x"]),
                Node::new("c", "filter").with_inputs(["y"]),
            ],
        );
        let err = ExecutionPlanner::plan(&graph).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Pipeline validation failed: Node b references missing input x; Node c references missing input y"
        );
    }

    #[test]
    fn test_plan_returns_ids() {
        let plan = ExecutionPlanner::plan(&linear_graph("etl")).unwrap();
        assert_eq!(plan.pipeline_id, "etl");
        assert_eq!(plan.order, vec!["A", "B", "C"]);
    }
}
