//! The flow execution engine.
//!
//! Runs a computed [`ExecutionPlan`] strictly sequentially. For each node:
//! prompt (interactive only) → dependency readiness → pre-snapshot →
//! execute → post-snapshot when the output hash changed. Any failure in the
//! last four steps stops the whole run; nothing is retried. Only a node that
//! got through all of them has its change-detection state committed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::graph::{DependencyGraph, GraphError};
use crate::core::node::FlowNode;
use crate::core::registry::FlowNodeRegistry;
use crate::core::types::{FlowContext, FlowResult, NodeExecution};
use crate::exit_codes;
use crate::io::dir_hash::DirectoryHasher;
use crate::io::operator::Operator;
use crate::io::snapshot::{SnapshotPhase, create_snapshot, has_content};
use crate::plan::{ExecutionPlan, NodeFilter, build_plan};
use crate::status::describe_output;

/// Fatal outcomes of a flow invocation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow graph is invalid:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
    #[error(transparent)]
    Cycle(#[from] GraphError),
    #[error("cannot run '{node}': dependency '{dependency}' is not ready ({reason})")]
    DependencyNotReady {
        node: String,
        dependency: String,
        reason: String,
    },
    #[error("node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },
    #[error("{phase}-execution snapshot for '{node}' failed: {message}")]
    Archive {
        node: String,
        phase: SnapshotPhase,
        message: String,
    },
    #[error("session archive failed: {0}")]
    SessionArchive(String),
    #[error("prompt for '{node}' failed: {message}")]
    Prompt { node: String, message: String },
}

impl EngineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation(_) | EngineError::Cycle(_) | EngineError::Prompt { .. } => {
                exit_codes::INVALID
            }
            EngineError::DependencyNotReady { .. } => exit_codes::DEPENDENCY_NOT_READY,
            EngineError::NodeFailed { .. } => exit_codes::NODE_FAILED,
            EngineError::Archive { .. } | EngineError::SessionArchive(_) => {
                exit_codes::ARCHIVE_FAILED
            }
        }
    }
}

/// What happened during one pass over a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub snapshots: Vec<PathBuf>,
    /// Node name → review instructions for results that require review.
    pub reviews: BTreeMap<String, String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Executed: {}", self.executed.len())?;
        for name in &self.executed {
            writeln!(f, "  - {name}")?;
        }
        writeln!(f, "Skipped: {}", self.skipped.len())?;
        for name in &self.skipped {
            writeln!(f, "  - {name}")?;
        }
        if !self.reviews.is_empty() {
            writeln!(f, "Review needed:")?;
            for (name, instructions) in &self.reviews {
                writeln!(f, "  - {name}: {instructions}")?;
            }
        }
        Ok(())
    }
}

pub struct FlowExecutionEngine<H> {
    registry: FlowNodeRegistry,
    graph: DependencyGraph,
    hasher: H,
}

impl<H: DirectoryHasher> FlowExecutionEngine<H> {
    /// Validate the registry and build the dependency graph.
    ///
    /// Unresolved dependencies and cycles are reported together, before any
    /// node is checked or executed.
    pub fn new(registry: FlowNodeRegistry, hasher: H) -> Result<Self, EngineError> {
        let mut errors = registry.validate_dependencies();
        for cycle in registry.detect_cycles() {
            errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
        }
        if !errors.is_empty() {
            return Err(EngineError::Validation(errors));
        }
        let graph = DependencyGraph::from_registry(&registry);
        debug!(nodes = registry.len(), "engine constructed");
        Ok(Self {
            registry,
            graph,
            hasher,
        })
    }

    pub fn registry(&self) -> &FlowNodeRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Check every node for changes and compute what must run.
    pub fn plan(&self, ctx: &FlowContext, filter: &NodeFilter) -> Result<ExecutionPlan, EngineError> {
        Ok(build_plan(&self.registry, &self.graph, ctx, filter)?)
    }

    /// Plan and execute in one call.
    pub fn run(
        &self,
        ctx: &mut FlowContext,
        filter: &NodeFilter,
        operator: &mut dyn Operator,
    ) -> Result<RunSummary, EngineError> {
        let plan = self.plan(ctx, filter)?;
        self.execute_plan(ctx, &plan, operator)
    }

    /// Execute `plan.order` one node at a time.
    ///
    /// Every node that is reached gets a [`NodeExecution`] in `ctx`, including
    /// the one that fails. In dry-run mode every node is recorded as skipped.
    #[instrument(skip_all, fields(nodes = plan.order.len(), dry_run = ctx.dry_run))]
    pub fn execute_plan(
        &self,
        ctx: &mut FlowContext,
        plan: &ExecutionPlan,
        operator: &mut dyn Operator,
    ) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::default();

        for name in &plan.order {
            let node = self.registry.get(name).ok_or_else(|| {
                EngineError::Validation(vec![format!("node '{name}' is not registered")])
            })?;
            let reasons = plan.reasons.get(name).cloned().unwrap_or_default();
            let mut execution = NodeExecution::pending(name.clone(), reasons);

            if ctx.dry_run {
                execution.mark_skipped(Utc::now());
                ctx.executions.push(execution);
                summary.skipped.push(name.clone());
                continue;
            }

            if ctx.interactive && !self.confirm(node, &execution, ctx, operator)? {
                info!(node = %name, "skipped by operator");
                execution.mark_skipped(Utc::now());
                ctx.executions.push(execution);
                summary.skipped.push(name.clone());
                continue;
            }

            let outcome = self.run_node(node, &mut execution, ctx, &mut summary);
            ctx.executions.push(execution);
            outcome?;
            summary.executed.push(name.clone());
        }

        info!(
            executed = summary.executed.len(),
            skipped = summary.skipped.len(),
            "flow pass finished"
        );
        Ok(summary)
    }

    fn confirm(
        &self,
        node: &dyn FlowNode,
        execution: &NodeExecution,
        ctx: &FlowContext,
        operator: &mut dyn Operator,
    ) -> Result<bool, EngineError> {
        let name = node.name();
        println!();
        if node.description().is_empty() {
            println!("== {name}");
        } else {
            println!("== {name}: {}", node.description());
        }
        println!("   output: {}", describe_output(&node.output_info(), ctx.started_at));
        for reason in &execution.reasons {
            println!("   reason: {reason}");
        }
        operator
            .confirm(&format!("Run {name}?"))
            .map_err(|err| EngineError::Prompt {
                node: name.to_string(),
                message: format!("{err:#}"),
            })
    }

    /// Readiness → pre-snapshot → execute → post-snapshot → commit detector
    /// state for one node.
    #[instrument(skip_all, fields(node = %node.name()))]
    fn run_node(
        &self,
        node: &dyn FlowNode,
        execution: &mut NodeExecution,
        ctx: &FlowContext,
        summary: &mut RunSummary,
    ) -> Result<(), EngineError> {
        let name = node.name().to_string();

        if let Err(err) = self.check_dependencies_ready(node) {
            error!(err = %err, "dependency not ready");
            execution.fail(err.to_string(), Utc::now());
            return Err(err);
        }

        execution.mark_running(Utc::now());
        let pre_hash = match self.snapshot_pre(node) {
            Ok((hash, snapshot)) => {
                summary.snapshots.extend(snapshot);
                hash
            }
            Err(err) => {
                execution.fail(err.to_string(), Utc::now());
                return Err(err);
            }
        };

        let started = Instant::now();
        let mut result = match node.execute(ctx) {
            Ok(result) => result,
            Err(err) => FlowResult::failure(format!("{err:#}")),
        };
        if result.execution_time_ms.is_none() {
            result.execution_time_ms =
                Some(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        }
        let success = result.success;
        let message = result
            .error_message
            .clone()
            .unwrap_or_else(|| "node reported failure without a message".to_string());
        if result.requires_review {
            summary.reviews.insert(
                name.clone(),
                result.review_instructions.clone().unwrap_or_default(),
            );
        }
        execution.finish(result, Utc::now());
        if !success {
            error!(%message, "node failed");
            return Err(EngineError::NodeFailed {
                node: name,
                message,
            });
        }

        let snapshot = match self.snapshot_post(node, pre_hash.as_deref()) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                error!(err = %err, "post snapshot failed");
                execution.fail(err.to_string(), Utc::now());
                return Err(err);
            }
        };
        summary.snapshots.extend(snapshot);
        if let Err(err) = node.commit_changes(ctx) {
            warn!(err = %format!("{err:#}"), "change state not recorded, node stays stale");
        }
        info!("node completed");
        Ok(())
    }

    fn check_dependencies_ready(&self, node: &dyn FlowNode) -> Result<(), EngineError> {
        for dep in node.dependencies() {
            let not_ready = |reason: &str| EngineError::DependencyNotReady {
                node: node.name().to_string(),
                dependency: dep.clone(),
                reason: reason.to_string(),
            };
            let Some(dep_node) = self.registry.get(dep) else {
                return Err(not_ready("not registered"));
            };
            if !dep_node.output_info().is_data_ready() {
                return Err(not_ready("output is missing or unusable"));
            }
        }
        Ok(())
    }

    /// Hash and copy a non-empty output directory before execution.
    fn snapshot_pre(
        &self,
        node: &dyn FlowNode,
    ) -> Result<(Option<String>, Option<PathBuf>), EngineError> {
        let Some(dir) = node.output_dir() else {
            return Ok((None, None));
        };
        let archive_err = |err: anyhow::Error| EngineError::Archive {
            node: node.name().to_string(),
            phase: SnapshotPhase::Pre,
            message: format!("{err:#}"),
        };
        if !has_content(dir).map_err(archive_err)? {
            debug!(dir = %dir.display(), "output directory empty, no pre snapshot");
            return Ok((None, None));
        }
        let hash = self.hasher.hash_dir(dir).map_err(archive_err)?;
        let snapshot = create_snapshot(dir, SnapshotPhase::Pre, Utc::now()).map_err(archive_err)?;
        Ok((Some(hash), Some(snapshot)))
    }

    /// Copy the output directory after execution if its content hash changed.
    fn snapshot_post(
        &self,
        node: &dyn FlowNode,
        pre_hash: Option<&str>,
    ) -> Result<Option<PathBuf>, EngineError> {
        let Some(dir) = node.output_dir() else {
            return Ok(None);
        };
        let archive_err = |err: anyhow::Error| EngineError::Archive {
            node: node.name().to_string(),
            phase: SnapshotPhase::Post,
            message: format!("{err:#}"),
        };
        if !has_content(dir).map_err(archive_err)? {
            if pre_hash.is_some() {
                warn!(dir = %dir.display(), "output directory emptied by execution");
            }
            return Ok(None);
        }
        let post_hash = self.hasher.hash_dir(dir).map_err(archive_err)?;
        if pre_hash == Some(post_hash.as_str()) {
            debug!("output unchanged, no post snapshot");
            return Ok(None);
        }
        let snapshot =
            create_snapshot(dir, SnapshotPhase::Post, Utc::now()).map_err(archive_err)?;
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::NodeStatus;
    use crate::io::dir_hash::InProcessHasher;
    use crate::test_support::{ScriptedNode, ScriptedOperator, call_log};

    fn engine(nodes: Vec<ScriptedNode>) -> FlowExecutionEngine<InProcessHasher> {
        let mut registry = FlowNodeRegistry::new();
        for node in nodes {
            registry.register(Box::new(node));
        }
        FlowExecutionEngine::new(registry, InProcessHasher).expect("engine")
    }

    #[test]
    fn invalid_graph_is_rejected_before_anything_runs() {
        let mut registry = FlowNodeRegistry::new();
        registry.register(Box::new(ScriptedNode::new("a", &["b"])));
        registry.register(Box::new(ScriptedNode::new("b", &["a"])));
        registry.register(Box::new(ScriptedNode::new("c", &["missing"])));
        let Err(err) = FlowExecutionEngine::new(registry, InProcessHasher) else {
            panic!("expected validation error");
        };
        let EngineError::Validation(errors) = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|msg| msg.contains("'missing'")));
        assert!(errors.iter().any(|msg| msg.contains("a -> b -> a")));
        assert_eq!(err.exit_code(), exit_codes::INVALID);
    }

    #[test]
    fn declined_prompt_skips_node_and_continues() {
        let log = call_log();
        let engine = engine(vec![
            ScriptedNode::new("sync", &[]).with_call_log(&log),
            ScriptedNode::new("report", &[]).with_call_log(&log),
        ]);
        let mut ctx = FlowContext::new(Utc::now());
        ctx.interactive = true;
        let mut operator = ScriptedOperator::new(&[false, true]);

        let summary = engine
            .run(&mut ctx, &NodeFilter::default(), &mut operator)
            .expect("run");
        assert_eq!(summary.skipped, vec!["report".to_string()]);
        assert_eq!(summary.executed, vec!["sync".to_string()]);
        assert_eq!(operator.prompts(), ["Run report?", "Run sync?"]);
        assert_eq!(
            ctx.execution("report").expect("report").status,
            NodeStatus::Skipped
        );
        assert!(!log.borrow().contains(&"execute:report".to_string()));
    }

    #[test]
    fn dry_run_executes_nothing() {
        let log = call_log();
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("sync");
        fs::create_dir_all(&out).expect("out");
        fs::write(out.join("a.json"), "[]").expect("seed");
        let engine = engine(vec![
            ScriptedNode::new("sync", &[])
                .with_output_dir(&out)
                .with_call_log(&log),
        ]);
        let mut ctx = FlowContext::new(Utc::now());
        ctx.dry_run = true;

        let summary = engine
            .run(&mut ctx, &NodeFilter::default(), &mut ScriptedOperator::default())
            .expect("run");
        assert_eq!(summary.skipped, vec!["sync".to_string()]);
        assert!(summary.snapshots.is_empty());
        assert!(!out.join("archive").exists());
        assert_eq!(log.borrow().as_slice(), ["check:sync"]);
    }

    #[test]
    fn unchanged_output_gets_pre_snapshot_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("report");
        fs::create_dir_all(&out).expect("out");
        fs::write(out.join("a.json"), "[1]").expect("seed");
        let engine = engine(vec![ScriptedNode::new("report", &[]).with_output_dir(&out)]);
        let mut ctx = FlowContext::new(Utc::now());

        let summary = engine
            .run(&mut ctx, &NodeFilter::default(), &mut ScriptedOperator::default())
            .expect("run");
        assert_eq!(summary.snapshots.len(), 1);
        assert!(
            summary.snapshots[0]
                .file_name()
                .expect("name")
                .to_string_lossy()
                .contains("_pre")
        );
    }

    #[test]
    fn first_run_into_empty_dir_gets_post_snapshot_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("sync");
        let engine = engine(vec![
            ScriptedNode::new("sync", &[])
                .with_output_dir(&out)
                .writes("transactions.json", "[1,2]"),
        ]);
        let mut ctx = FlowContext::new(Utc::now());

        let summary = engine
            .run(&mut ctx, &NodeFilter::default(), &mut ScriptedOperator::default())
            .expect("run");
        assert_eq!(summary.snapshots.len(), 1);
        let snapshot = &summary.snapshots[0];
        assert!(snapshot.to_string_lossy().contains("_post"));
        assert_eq!(
            fs::read_to_string(snapshot.join("transactions.json")).expect("read"),
            "[1,2]"
        );
    }

    #[test]
    fn failed_result_and_review_are_reported() {
        let engine = engine(vec![
            ScriptedNode::new("reconcile", &[]).requiring_review("check balances"),
            ScriptedNode::new("sync", &[]).failing("api returned 500"),
        ]);
        let mut ctx = FlowContext::new(Utc::now());
        let err = engine
            .run(&mut ctx, &NodeFilter::default(), &mut ScriptedOperator::default())
            .expect_err("failure");
        assert_eq!(err.exit_code(), exit_codes::NODE_FAILED);
        assert!(err.to_string().contains("api returned 500"));
        assert_eq!(
            ctx.execution("reconcile").expect("reconcile").status,
            NodeStatus::Completed
        );
        assert_eq!(
            ctx.execution("sync").expect("sync").status,
            NodeStatus::Failed
        );
    }

    #[test]
    fn summary_lists_executed_and_skipped() {
        let summary = RunSummary {
            executed: vec!["sync".to_string()],
            skipped: vec!["apply".to_string()],
            snapshots: Vec::new(),
            reviews: BTreeMap::from([("apply".to_string(), "look".to_string())]),
        };
        let text = summary.to_string();
        assert!(text.contains("Executed: 1\n  - sync"));
        assert!(text.contains("Skipped: 1\n  - apply"));
        assert!(text.contains("apply: look"));
    }
}
