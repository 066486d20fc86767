//! Dependency graph derived from the registry.
//!
//! Rebuilt on every engine construction; never persisted. Every ordering
//! produced here is deterministic: ties are broken alphabetically so that an
//! unchanged dependency structure always yields the same execution order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::core::registry::FlowNodeRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Nodes that could not be ordered because they sit on or behind a cycle.
    #[error("dependency cycle among nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("unknown node '{0}'")]
    UnknownNode(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    /// node → nodes it depends on
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// node → nodes that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn from_registry(registry: &FlowNodeRegistry) -> Self {
        Self::from_edges(
            registry
                .iter()
                .map(|node| (node.name().to_string(), node.dependencies().clone())),
        )
    }

    /// Build from `(node, dependencies)` pairs.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, BTreeSet<String>)>,
    {
        let dependencies: BTreeMap<String, BTreeSet<String>> = edges.into_iter().collect();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = dependencies
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for (name, deps) in &dependencies {
            for dep in deps {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }
        Self {
            dependencies,
            dependents,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn node_names(&self) -> BTreeSet<String> {
        self.dependencies.keys().cloned().collect()
    }

    pub fn dependencies_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependencies.get(name)
    }

    pub fn dependents_of(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.dependents.get(name)
    }

    /// Kahn's algorithm over `subset` only.
    ///
    /// Dependencies outside the subset do not constrain the order. The initial
    /// ready set and every batch of newly-ready dependents are enqueued in
    /// alphabetical order.
    pub fn topological_sort(&self, subset: &BTreeSet<String>) -> Result<Vec<String>, GraphError> {
        self.ensure_known(subset)?;

        let mut in_degree: BTreeMap<&str, usize> = subset
            .iter()
            .map(|name| (name.as_str(), self.deps_within(name, subset).count()))
            .collect();

        // BTreeMap iteration is already alphabetical.
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(subset.len());
        while let Some(name) = queue.pop_front() {
            order.push(name.to_string());

            let mut ready = Vec::new();
            for dependent in self.dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent.as_str());
                    }
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if order.len() < subset.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let stuck = subset
                .iter()
                .filter(|name| !placed.contains(name.as_str()))
                .cloned()
                .collect();
            return Err(GraphError::Cycle(stuck));
        }
        Ok(order)
    }

    /// Partition `subset` into levels; level k only depends on levels `0..k`.
    ///
    /// Informational: the engine still runs nodes one at a time.
    pub fn execution_levels(
        &self,
        subset: &BTreeSet<String>,
    ) -> Result<Vec<Vec<String>>, GraphError> {
        self.ensure_known(subset)?;

        let mut placed: BTreeSet<&str> = BTreeSet::new();
        let mut remaining: BTreeSet<&str> = subset.iter().map(String::as_str).collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let level: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|name| {
                    self.deps_within(name, subset)
                        .all(|dep| placed.contains(dep.as_str()))
                })
                .collect();
            if level.is_empty() {
                return Err(GraphError::Cycle(
                    remaining.iter().map(|name| name.to_string()).collect(),
                ));
            }
            for name in &level {
                remaining.remove(name);
                placed.insert(*name);
            }
            levels.push(level.into_iter().map(str::to_string).collect());
        }
        Ok(levels)
    }

    /// Every node transitively downstream of `changed`, including `changed`.
    ///
    /// Breadth-first over the dependents map. Unknown names are kept as-is so
    /// callers can report them.
    pub fn find_changed_subgraph(&self, changed: &BTreeSet<String>) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = changed.clone();
        let mut queue: VecDeque<&str> = changed.iter().map(String::as_str).collect();

        while let Some(name) = queue.pop_front() {
            for dependent in self.dependents.get(name).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent.as_str());
                }
            }
        }
        seen
    }

    /// Every node transitively upstream of `targets`, including `targets`.
    pub fn upstream_closure(&self, targets: &BTreeSet<String>) -> BTreeSet<String> {
        let mut seen: BTreeSet<String> = targets.clone();
        let mut queue: VecDeque<&str> = targets.iter().map(String::as_str).collect();

        while let Some(name) = queue.pop_front() {
            for dep in self.dependencies.get(name).into_iter().flatten() {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.as_str());
                }
            }
        }
        seen
    }

    fn deps_within<'a>(
        &'a self,
        name: &str,
        subset: &'a BTreeSet<String>,
    ) -> impl Iterator<Item = &'a String> + 'a {
        self.dependencies
            .get(name)
            .into_iter()
            .flatten()
            .filter(move |dep| subset.contains(*dep))
    }

    fn ensure_known(&self, subset: &BTreeSet<String>) -> Result<(), GraphError> {
        match subset.iter().find(|name| !self.contains(name)) {
            Some(unknown) => Err(GraphError::UnknownNode(unknown.clone())),
            None => Ok(()),
        }
    }
}
