// SPDX-License-Identifier: Apache-2.0

//! Topological scheduler: Kahn's algorithm over the node/edge lists.

use super::{NodeId, PipelineGraph};
use crate::error::RunError;
use std::collections::{HashMap, VecDeque};

/// Computes a topological order of `graph`'s nodes such that, for every
/// edge `(u, v)`, `u` appears before `v`. Returns a
/// [`RunError::Config`] if the graph contains a cycle.
pub fn topological_order(graph: &PipelineGraph) -> Result<Vec<NodeId>, RunError> {
    let mut in_degree: HashMap<&NodeId, usize> = graph.nodes.iter().map(|n| (&n.id, 0)).collect();
    for edge in &graph.edges {
        if let Some(degree) = in_degree.get_mut(&edge.target) {
            *degree += 1;
        }
    }

    let mut ready: VecDeque<&NodeId> = graph
        .nodes
        .iter()
        .map(|n| &n.id)
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();

    let mut order = Vec::with_capacity(graph.nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        for edge in graph.outbound_edges(id) {
            let degree = in_degree
                .get_mut(&edge.target)
                .expect("edge target validated to exist");
            *degree -= 1;
            if *degree == 0 {
                ready.push_back(&edge.target);
            }
        }
    }

    if order.len() != graph.nodes.len() {
        return Err(RunError::Config {
            message: "pipeline graph contains a cycle".to_owned(),
        });
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, ExecutionStrategyRef, NodeDefinition, NodeKind};

    fn node(id: &str, kind: NodeKind) -> NodeDefinition {
        NodeDefinition::new(id, kind, ExecutionStrategyRef::Sequential)
    }

    #[test]
    fn linear_chain_orders_source_before_sink() {
        let graph = PipelineGraph {
            nodes: vec![
                node("src", NodeKind::Source),
                node("xform", NodeKind::Transform),
                node("sink", NodeKind::Sink),
            ],
            edges: vec![Edge::new("src", "xform"), Edge::new("xform", "sink")],
            execution_options: Default::default(),
        };
        let order = topological_order(&graph).unwrap();
        assert_eq!(
            order,
            vec![
                NodeId::new("src"),
                NodeId::new("xform"),
                NodeId::new("sink")
            ]
        );
    }

    #[test]
    fn fan_out_fan_in_is_a_valid_order() {
        let graph = PipelineGraph {
            nodes: vec![
                node("src", NodeKind::Source),
                node("a", NodeKind::Transform),
                node("b", NodeKind::Transform),
                node("sink", NodeKind::Sink),
            ],
            edges: vec![
                Edge::new("src", "a"),
                Edge::new("src", "b"),
                Edge::new("a", "sink"),
                Edge::new("b", "sink"),
            ],
            execution_options: Default::default(),
        };
        let order = topological_order(&graph).unwrap();
        let pos = |id: &str| order.iter().position(|n| n.as_str() == id).unwrap();
        assert!(pos("src") < pos("a"));
        assert!(pos("src") < pos("b"));
        assert!(pos("a") < pos("sink"));
        assert!(pos("b") < pos("sink"));
    }

    #[test]
    fn cycle_is_rejected() {
        let graph = PipelineGraph {
            nodes: vec![node("a", NodeKind::Transform), node("b", NodeKind::Transform)],
            edges: vec![Edge::new("a", "b"), Edge::new("b", "a")],
            execution_options: Default::default(),
        };
        assert!(matches!(
            topological_order(&graph),
            Err(RunError::Config { .. })
        ));
    }
}
