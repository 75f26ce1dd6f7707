use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{Edge, Node};

/// The part of a flow that a run actually executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachableSubgraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl ReachableSubgraph {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Collect every node forward-reachable from `start_id`, excluding the start
/// node itself.
///
/// The edge set is re-derived from the full graph: any edge whose endpoints
/// both lie in `{start} ∪ reachable` is kept, not just the edges the
/// traversal walked. Fan-in edges into a shared downstream node therefore
/// survive, which the backend needs to rebuild the topology.
///
/// Nodes and edges keep the order they have in the input.
pub fn extract_reachable(nodes: &[Node], edges: &[Edge], start_id: &str) -> ReachableSubgraph {
    let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        if known.contains(edge.target.as_str()) {
            children
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }
    }

    // Seeding with the start id keeps a cycle back to it from re-adding it.
    let mut visited: HashSet<&str> = HashSet::from([start_id]);
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = vec![start_id];

    while let Some(current) = stack.pop() {
        let Some(next) = children.get(current) else {
            continue;
        };
        // Reverse so the first edge is explored first.
        for &child in next.iter().rev() {
            if visited.insert(child) {
                reachable.insert(child);
                stack.push(child);
            }
        }
    }

    let reachable_nodes: Vec<Node> = nodes
        .iter()
        .filter(|n| reachable.contains(n.id.as_str()))
        .cloned()
        .collect();

    let in_scope = |id: &str| id == start_id || reachable.contains(id);
    let reachable_edges: Vec<Edge> = edges
        .iter()
        .filter(|e| in_scope(&e.source) && in_scope(&e.target))
        .cloned()
        .collect();

    tracing::debug!(
        start = %start_id,
        nodes = reachable_nodes.len(),
        edges = reachable_edges.len(),
        "extracted reachable subgraph"
    );

    ReachableSubgraph {
        nodes: reachable_nodes,
        edges: reachable_edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::NodeType;
    use crate::flows::test_support::{agent, edge, node};

    fn ids(subgraph: &ReachableSubgraph) -> Vec<&str> {
        subgraph.nodes.iter().map(|n| n.id.as_str()).collect()
    }

    fn pairs(subgraph: &ReachableSubgraph) -> Vec<(&str, &str)> {
        subgraph
            .edges
            .iter()
            .map(|e| (e.source.as_str(), e.target.as_str()))
            .collect()
    }

    #[test]
    fn test_diamond_keeps_fan_in_edges() {
        let nodes = vec![node("S", NodeType::Start), agent("A"), agent("B"), agent("C")];
        let edges = vec![edge("S", "A"), edge("S", "B"), edge("A", "C"), edge("B", "C")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert_eq!(ids(&sub), vec!["A", "B", "C"]);
        assert_eq!(
            pairs(&sub),
            vec![("S", "A"), ("S", "B"), ("A", "C"), ("B", "C")]
        );
    }

    #[test]
    fn test_start_without_outgoing_edges_is_empty() {
        let nodes = vec![node("S", NodeType::Start), agent("A")];
        let edges = vec![edge("A", "S")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert!(sub.is_empty());
        assert!(sub.edges.is_empty());
    }

    #[test]
    fn test_cycle_through_start_terminates_and_excludes_start() {
        let nodes = vec![node("S", NodeType::Start), agent("A"), agent("B")];
        let edges = vec![edge("S", "A"), edge("A", "B"), edge("B", "S"), edge("B", "A")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert_eq!(ids(&sub), vec!["A", "B"]);
        // The back edge into S is inside {S} ∪ reachable, so it is kept.
        assert_eq!(
            pairs(&sub),
            vec![("S", "A"), ("A", "B"), ("B", "S"), ("B", "A")]
        );
    }

    #[test]
    fn test_unreachable_nodes_and_their_edges_are_dropped() {
        let nodes = vec![
            node("S", NodeType::Start),
            agent("A"),
            agent("X"),
            node("PM", NodeType::DecisionMaker),
        ];
        let edges = vec![edge("S", "A"), edge("X", "PM"), edge("A", "PM"), edge("X", "A")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert_eq!(ids(&sub), vec!["A", "PM"]);
        assert_eq!(pairs(&sub), vec![("S", "A"), ("A", "PM")]);
    }

    #[test]
    fn test_dangling_edge_targets_are_not_followed() {
        let nodes = vec![node("S", NodeType::Start), agent("A")];
        let edges = vec![edge("S", "ghost"), edge("S", "A"), edge("ghost", "A")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert_eq!(ids(&sub), vec!["A"]);
        assert_eq!(pairs(&sub), vec![("S", "A")]);
    }

    #[test]
    fn test_self_edges_and_parallel_edges_are_tolerated() {
        let nodes = vec![node("S", NodeType::Start), agent("A")];
        let edges = vec![edge("S", "A"), edge("S", "A"), edge("A", "A")];

        let sub = extract_reachable(&nodes, &edges, "S");
        assert_eq!(ids(&sub), vec!["A"]);
        assert_eq!(sub.edges.len(), 3);
    }

    #[test]
    fn test_every_result_node_is_reachable_and_edges_in_scope() {
        // A longer chain with a branch that loops back on itself.
        let nodes: Vec<Node> = ["S", "A", "B", "C", "D", "E", "Z"]
            .iter()
            .map(|id| agent(id))
            .collect();
        let edges = vec![
            edge("S", "A"),
            edge("A", "B"),
            edge("B", "C"),
            edge("C", "A"),
            edge("A", "D"),
            edge("D", "E"),
            edge("Z", "S"),
        ];

        let sub = extract_reachable(&nodes, &edges, "S");
        let found = ids(&sub);
        assert!(!found.contains(&"S"));
        assert!(!found.contains(&"Z"));
        assert_eq!(found.len(), 5);

        let scope: HashSet<&str> = found.iter().copied().chain(["S"]).collect();
        for (s, t) in pairs(&sub) {
            assert!(scope.contains(s) && scope.contains(t), "edge {s}->{t} out of scope");
        }
    }

    #[test]
    fn test_unknown_start_id_yields_empty() {
        let nodes = vec![agent("A")];
        let edges = vec![edge("A", "A")];
        assert!(extract_reachable(&nodes, &edges, "missing").is_empty());
    }
}
