//! Session-scoped import graph with cycle detection.

use std::collections::{BTreeMap, BTreeSet};

/// Directed `importer -> imported` edges recorded over a session.
#[derive(Debug, Clone, Default)]
pub struct ImportGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(targets) = self.edges.get_mut(from) {
            targets.remove(to);
            if targets.is_empty() {
                self.edges.remove(from);
            }
        }
    }

    pub fn contains_edge(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|t| t.contains(to))
    }

    /// First cycle found by depth-first search in name order, as a path
    /// that starts and ends on the same module.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut done: BTreeSet<&str> = BTreeSet::new();
        let mut path: Vec<&str> = Vec::new();
        for start in self.edges.keys() {
            if let Some(cycle) = self.visit(start, &mut path, &mut done) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        path: &mut Vec<&'a str>,
        done: &mut BTreeSet<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }
        path.push(node);
        if let Some(targets) = self.edges.get(node) {
            for next in targets {
                if let Some(cycle) = self.visit(next, path, done) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        done.insert(node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_chain_has_no_cycle() {
        let mut graph = ImportGraph::new();
        for i in 0..50 {
            graph.add_edge(&format!("m{i}"), &format!("m{}", i + 1));
        }
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn two_module_cycle_names_both() {
        let mut graph = ImportGraph::new();
        graph.add_edge("bot", "a");
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");
        assert_eq!(graph.find_cycle().unwrap(), vec!["a", "b", "a"]);
    }

    #[test]
    fn self_import_is_a_cycle() {
        let mut graph = ImportGraph::new();
        graph.add_edge("bot", "bot");
        assert_eq!(graph.find_cycle().unwrap(), vec!["bot", "bot"]);
    }

    #[test]
    fn removing_the_closing_edge_clears_the_cycle() {
        let mut graph = ImportGraph::new();
        graph.add_edge("a", "b");
        graph.add_edge("b", "a");
        graph.remove_edge("b", "a");
        assert!(!graph.contains_edge("b", "a"));
        assert_eq!(graph.find_cycle(), None);
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let mut graph = ImportGraph::new();
        graph.add_edge("bot", "a");
        graph.add_edge("bot", "b");
        graph.add_edge("a", "c");
        graph.add_edge("b", "c");
        for _ in 0..100 {
            assert_eq!(graph.find_cycle(), None);
        }
    }
}
