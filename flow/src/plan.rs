//! Decide which nodes run, and in what order.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::graph::{DependencyGraph, GraphError};
use crate::core::registry::FlowNodeRegistry;
use crate::core::types::{ChangeCheck, FlowContext};

const FORCED_REASON: &str = "forced";

/// Node-name filters from the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeFilter {
    /// Restrict execution to these nodes (empty = no restriction).
    pub only: BTreeSet<String>,
    /// Treat these nodes as changed regardless of their detectors.
    pub force: BTreeSet<String>,
    /// With `only`, also allow the upstream closure of the named nodes.
    pub with_dependencies: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    /// Topological order, alphabetical among independent nodes.
    pub order: Vec<String>,
    /// Informational grouping; level k depends only on levels before it.
    pub levels: Vec<Vec<String>>,
    /// Why each planned node runs.
    pub reasons: BTreeMap<String, Vec<String>>,
    /// Registered nodes that will not run, alphabetical.
    pub not_needed: Vec<String>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.order.is_empty() {
            return writeln!(f, "Nothing to run: all nodes are up to date.");
        }
        writeln!(f, "Execution order:")?;
        for (index, name) in self.order.iter().enumerate() {
            let mut line = format!("  {}. {name}", index + 1);
            if let Some(reasons) = self.reasons.get(name).filter(|reasons| !reasons.is_empty()) {
                let _ = write!(line, " ({})", reasons.join("; "));
            }
            writeln!(f, "{line}")?;
        }
        writeln!(f, "Levels:")?;
        for (depth, level) in self.levels.iter().enumerate() {
            writeln!(f, "  {depth}: {}", level.join(", "))?;
        }
        if !self.not_needed.is_empty() {
            writeln!(f, "Up to date: {}", self.not_needed.join(", "))?;
        }
        Ok(())
    }
}

/// Check every node (alphabetically, fail-open) and compute the plan.
///
/// Changed = stale ∪ forced. Everything downstream of a changed node runs too;
/// `filter.only` then narrows the set.
pub fn build_plan(
    registry: &FlowNodeRegistry,
    graph: &DependencyGraph,
    ctx: &FlowContext,
    filter: &NodeFilter,
) -> Result<ExecutionPlan, GraphError> {
    for name in filter.only.iter().chain(&filter.force) {
        if !graph.contains(name) {
            return Err(GraphError::UnknownNode(name.clone()));
        }
    }

    let mut reasons: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut changed = BTreeSet::new();
    for node in registry.iter() {
        let name = node.name();
        let check = match node.check_changes(ctx) {
            Ok(check) => check,
            Err(err) => {
                warn!(node = name, err = %format!("{err:#}"), "change detection failed, assuming stale");
                ChangeCheck::from_error(&err)
            }
        };
        let forced = ctx.force || filter.force.contains(name);
        if !check.needs_run && !forced {
            continue;
        }
        let mut node_reasons = Vec::new();
        if forced {
            node_reasons.push(FORCED_REASON.to_string());
        }
        if check.needs_run {
            node_reasons.extend(check.reasons);
        }
        reasons.insert(name.to_string(), node_reasons);
        changed.insert(name.to_string());
    }

    let mut selected = graph.find_changed_subgraph(&changed);
    if !filter.only.is_empty() {
        let allowed = if filter.with_dependencies {
            graph.upstream_closure(&filter.only)
        } else {
            filter.only.clone()
        };
        selected.retain(|name| allowed.contains(name));
    }

    reasons.retain(|name, _| selected.contains(name));
    for name in &selected {
        if reasons.contains_key(name) {
            continue;
        }
        let upstream: Vec<String> = graph
            .dependencies_of(name)
            .into_iter()
            .flatten()
            .filter(|dep| selected.contains(*dep))
            .map(|dep| format!("upstream '{dep}' will run"))
            .collect();
        reasons.insert(name.clone(), upstream);
    }

    let order = graph.topological_sort(&selected)?;
    let levels = graph.execution_levels(&selected)?;
    let not_needed = registry
        .names()
        .into_iter()
        .filter(|name| !selected.contains(name))
        .collect();
    debug!(?order, "plan computed");
    Ok(ExecutionPlan {
        order,
        levels,
        reasons,
        not_needed,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::test_support::ScriptedNode;

    fn setup(nodes: Vec<ScriptedNode>) -> (FlowNodeRegistry, DependencyGraph) {
        let mut registry = FlowNodeRegistry::new();
        for node in nodes {
            registry.register(Box::new(node));
        }
        let graph = DependencyGraph::from_registry(&registry);
        (registry, graph)
    }

    fn pipeline() -> (FlowNodeRegistry, DependencyGraph) {
        setup(vec![
            ScriptedNode::new("sync", &[]),
            ScriptedNode::new("match", &["sync"]).fresh(),
            ScriptedNode::new("apply", &["match"]).fresh(),
            ScriptedNode::new("retirement", &[]).fresh(),
        ])
    }

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn stale_node_pulls_in_downstream() {
        let (registry, graph) = pipeline();
        let ctx = FlowContext::new(Utc::now());
        let plan = build_plan(&registry, &graph, &ctx, &NodeFilter::default()).expect("plan");

        assert_eq!(plan.order, vec!["sync", "match", "apply"]);
        assert_eq!(plan.not_needed, vec!["retirement"]);
        assert_eq!(
            plan.reasons.get("match"),
            Some(&vec!["upstream 'sync' will run".to_string()])
        );
        assert_eq!(plan.levels.len(), 3);
    }

    #[test]
    fn nothing_stale_means_empty_plan() {
        let (registry, graph) = setup(vec![
            ScriptedNode::new("sync", &[]).fresh(),
            ScriptedNode::new("match", &["sync"]).fresh(),
        ]);
        let plan = build_plan(
            &registry,
            &graph,
            &FlowContext::new(Utc::now()),
            &NodeFilter::default(),
        )
        .expect("plan");
        assert!(plan.is_empty());
        assert!(plan.to_string().contains("Nothing to run"));
    }

    #[test]
    fn force_runs_everything() {
        let (registry, graph) = pipeline();
        let mut ctx = FlowContext::new(Utc::now());
        ctx.force = true;
        let plan = build_plan(&registry, &graph, &ctx, &NodeFilter::default()).expect("plan");
        assert_eq!(plan.order, vec!["retirement", "sync", "match", "apply"]);
        assert_eq!(plan.reasons.get("retirement"), Some(&vec!["forced".to_string()]));
    }

    #[test]
    fn only_filter_narrows_and_can_include_upstream() {
        let (registry, graph) = pipeline();
        let ctx = FlowContext::new(Utc::now());
        let only_match = NodeFilter {
            only: names(&["match"]),
            ..NodeFilter::default()
        };
        let plan = build_plan(&registry, &graph, &ctx, &only_match).expect("plan");
        assert_eq!(plan.order, vec!["match"]);

        let with_deps = NodeFilter {
            with_dependencies: true,
            ..only_match
        };
        let plan = build_plan(&registry, &graph, &ctx, &with_deps).expect("plan");
        assert_eq!(plan.order, vec!["sync", "match"]);
    }

    #[test]
    fn forced_names_are_treated_as_changed() {
        let (registry, graph) = pipeline();
        let filter = NodeFilter {
            force: names(&["retirement"]),
            ..NodeFilter::default()
        };
        let plan = build_plan(&registry, &graph, &FlowContext::new(Utc::now()), &filter)
            .expect("plan");
        assert!(plan.order.contains(&"retirement".to_string()));
        assert!(plan.not_needed.is_empty());
    }

    #[test]
    fn detector_error_fails_open() {
        let (registry, graph) = setup(vec![
            ScriptedNode::new("sync", &[]).check_error("cursor file unreadable"),
        ]);
        let plan = build_plan(
            &registry,
            &graph,
            &FlowContext::new(Utc::now()),
            &NodeFilter::default(),
        )
        .expect("plan");
        assert_eq!(plan.order, vec!["sync"]);
        assert!(plan.reasons["sync"][0].contains("cursor file unreadable"));
    }

    #[test]
    fn unknown_filter_name_is_an_error() {
        let (registry, graph) = pipeline();
        let filter = NodeFilter {
            only: names(&["nope"]),
            ..NodeFilter::default()
        };
        let err = build_plan(&registry, &graph, &FlowContext::new(Utc::now()), &filter)
            .expect_err("unknown");
        assert_eq!(err, GraphError::UnknownNode("nope".to_string()));
    }
}
