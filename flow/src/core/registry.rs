//! Catalog of flow nodes keyed by name.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::core::node::FlowNode;

/// Name → node catalog, constructed once per process entry point.
#[derive(Default)]
pub struct FlowNodeRegistry {
    nodes: BTreeMap<String, Box<dyn FlowNode>>,
}

impl FlowNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. A node with the same name is replaced (last wins).
    pub fn register(&mut self, node: Box<dyn FlowNode>) {
        let name = node.name().to_string();
        if self.nodes.contains_key(&name) {
            warn!(node = %name, "node already registered, overwriting");
        } else {
            debug!(node = %name, deps = ?node.dependencies(), "registered node");
        }
        self.nodes.insert(name, node);
    }

    pub fn get(&self, name: &str) -> Option<&dyn FlowNode> {
        self.nodes.get(name).map(|node| node.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Registered names in alphabetical order.
    pub fn names(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn FlowNode> {
        self.nodes.values().map(|node| node.as_ref())
    }

    /// One error per dependency name that does not resolve to a registered node.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, node) in &self.nodes {
            for dep in node.dependencies() {
                if !self.nodes.contains_key(dep) {
                    errors.push(format!(
                        "node '{name}' depends on unregistered node '{dep}'"
                    ));
                }
            }
        }
        errors
    }

    /// Every dependency cycle, as node names in path order plus the closing node.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let edges: BTreeMap<String, BTreeSet<String>> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.clone(), node.dependencies().clone()))
            .collect();
        find_cycles(&edges)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

/// Depth-first walk from every node (alphabetical), following dependency edges.
///
/// A node reached while still on the current path closes a cycle. Nodes that
/// are fully explored are not walked again, so each cycle is reported once.
/// Edges to names missing from `edges` are ignored.
pub(crate) fn find_cycles(edges: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<String>> {
    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut path: Vec<&str> = Vec::new();
    let mut cycles = Vec::new();

    for start in edges.keys() {
        if !marks.contains_key(start.as_str()) {
            visit(start, edges, &mut marks, &mut path, &mut cycles);
        }
    }
    cycles
}

fn visit<'a>(
    name: &'a str,
    edges: &'a BTreeMap<String, BTreeSet<String>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    marks.insert(name, Mark::OnPath);
    path.push(name);

    if let Some(deps) = edges.get(name) {
        for dep in deps {
            if !edges.contains_key(dep) {
                continue;
            }
            match marks.get(dep.as_str()).copied() {
                Some(Mark::OnPath) => {
                    if let Some(pos) = path.iter().position(|entry| *entry == dep.as_str()) {
                        let mut cycle: Vec<String> =
                            path[pos..].iter().map(|entry| entry.to_string()).collect();
                        cycle.push(dep.clone());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(dep, edges, marks, path, cycles),
            }
        }
    }

    path.pop();
    marks.insert(name, Mark::Done);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedNode;

    fn registry(nodes: &[(&str, &[&str])]) -> FlowNodeRegistry {
        let mut registry = FlowNodeRegistry::new();
        for (name, deps) in nodes {
            registry.register(Box::new(ScriptedNode::new(name, deps)));
        }
        registry
    }

    #[test]
    fn missing_dependency_is_reported_without_panicking() {
        let registry = registry(&[("match", &["sync"])]);
        let errors = registry.validate_dependencies();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("'match'"));
        assert!(errors[0].contains("'sync'"));
    }

    #[test]
    fn last_registration_wins() {
        let mut registry = registry(&[("sync", &[])]);
        registry.register(Box::new(ScriptedNode::new("sync", &["other"])));
        assert_eq!(registry.len(), 1);
        let deps = registry.get("sync").expect("sync").dependencies();
        assert!(deps.contains("other"));
    }

    #[test]
    fn three_node_cycle_is_detected() {
        let registry = registry(&[("A", &["C"]), ("B", &["A"]), ("C", &["B"])]);
        let cycles = registry.detect_cycles();
        assert_eq!(cycles.len(), 1);
        let cycle = &cycles[0];
        assert_eq!(cycle.first(), cycle.last());
        let members: BTreeSet<&str> = cycle.iter().map(String::as_str).collect();
        assert_eq!(members, BTreeSet::from(["A", "B", "C"]));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn disjoint_cycles_are_all_reported() {
        let registry = registry(&[
            ("a", &["b"]),
            ("b", &["a"]),
            ("x", &["y"]),
            ("y", &["x"]),
            ("solo", &[]),
        ]);
        let cycles = registry.detect_cycles();
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".to_string(), "a".to_string()],
                vec!["x".to_string(), "y".to_string(), "x".to_string()],
            ]
        );
    }

    #[test]
    fn acyclic_graph_has_no_cycles() {
        let registry = registry(&[("sync", &[]), ("match", &["sync"]), ("apply", &["match"])]);
        assert!(registry.detect_cycles().is_empty());
        assert!(registry.validate_dependencies().is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = registry(&[("loop", &["loop"])]);
        assert_eq!(
            registry.detect_cycles(),
            vec![vec!["loop".to_string(), "loop".to_string()]]
        );
    }
}
