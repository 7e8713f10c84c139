use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::common::types::ClientId;

/// Waits-for graph over live transactions. An edge `a -> b` means
/// "a waits for b". Edges are a multiset: adding the same edge twice
/// requires removing it twice, which keeps the graph in sync with
/// overlapping waits.
#[derive(Default)]
pub struct WaitsForGraph {
    edges: RwLock<Vec<(ClientId, ClientId)>>,
}

impl WaitsForGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&self, from: ClientId, to: ClientId) {
        self.edges.write().push((from, to));
    }

    /// Remove one copy of the edge; a no-op if it is absent.
    pub fn remove_edge(&self, from: ClientId, to: ClientId) {
        let mut edges = self.edges.write();
        if let Some(pos) = edges.iter().position(|&e| e == (from, to)) {
            edges.swap_remove(pos);
        }
    }

    /// DFS cycle search over the current edge set.
    pub fn detect_cycle(&self) -> bool {
        let edges = self.edges.write();
        let mut adjacency: HashMap<ClientId, Vec<ClientId>> = HashMap::new();
        for &(from, to) in edges.iter() {
            adjacency.entry(from).or_default().push(to);
            adjacency.entry(to).or_default();
        }
        let mut visited = HashSet::new();
        let mut path = HashSet::new();
        for &node in adjacency.keys() {
            if !visited.contains(&node) && dfs(node, &adjacency, &mut visited, &mut path) {
                return true;
            }
        }
        false
    }
}

fn dfs(
    node: ClientId,
    adjacency: &HashMap<ClientId, Vec<ClientId>>,
    visited: &mut HashSet<ClientId>,
    path: &mut HashSet<ClientId>,
) -> bool {
    visited.insert(node);
    path.insert(node);
    if let Some(next) = adjacency.get(&node) {
        for &to in next {
            if path.contains(&to) {
                return true;
            }
            if !visited.contains(&to) && dfs(to, adjacency, visited, path) {
                return true;
            }
        }
    }
    path.remove(&node);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> ClientId {
        uuid::Uuid::new_v4()
    }

    #[test]
    fn test_empty_graph_has_no_cycle() {
        let g = WaitsForGraph::new();
        assert!(!g.detect_cycle());
    }

    #[test]
    fn test_chain_has_no_cycle() {
        let g = WaitsForGraph::new();
        let (a, b, c) = (client(), client(), client());
        g.add_edge(a, b);
        g.add_edge(b, c);
        assert!(!g.detect_cycle());
    }

    #[test]
    fn test_two_cycle() {
        let g = WaitsForGraph::new();
        let (a, b) = (client(), client());
        g.add_edge(a, b);
        assert!(!g.detect_cycle());
        g.add_edge(b, a);
        assert!(g.detect_cycle());
    }

    #[test]
    fn test_three_cycle_detected_and_cleared() {
        let g = WaitsForGraph::new();
        let (a, b, c) = (client(), client(), client());
        g.add_edge(a, b);
        g.add_edge(b, c);
        g.add_edge(c, a);
        assert!(g.detect_cycle());
        g.remove_edge(c, a);
        assert!(!g.detect_cycle());
    }

    #[test]
    fn test_duplicate_edges_removed_one_at_a_time() {
        let g = WaitsForGraph::new();
        let (a, b) = (client(), client());
        g.add_edge(a, b);
        g.add_edge(a, b);
        g.add_edge(b, a);
        g.remove_edge(a, b);
        // One a -> b copy remains, so the cycle persists.
        assert!(g.detect_cycle());
        g.remove_edge(a, b);
        assert!(!g.detect_cycle());
    }
}
