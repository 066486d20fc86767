//! Shared deterministic types for the flow engine.
//!
//! These types define stable contracts between the engine, the nodes it runs,
//! and the run log. They carry no I/O and serialize deterministically
//! (`BTreeMap` everywhere a map is persisted).

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a single node within one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Outcome returned by [`FlowNode::execute`](crate::core::node::FlowNode::execute).
///
/// Built once by the node (or by the engine when `execute` errors) and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResult {
    pub success: bool,
    pub items_processed: u64,
    pub new_items: u64,
    pub updated_items: u64,
    /// Files written or refreshed by the node.
    pub outputs: Vec<PathBuf>,
    pub requires_review: bool,
    /// Human-readable follow-up for the operator when `requires_review` is set.
    pub review_instructions: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub metadata: BTreeMap<String, Value>,
    pub error_message: Option<String>,
}

impl FlowResult {
    /// Successful result with the given number of processed items.
    pub fn success(items_processed: u64) -> Self {
        Self {
            success: true,
            items_processed,
            new_items: 0,
            updated_items: 0,
            outputs: Vec::new(),
            requires_review: false,
            review_instructions: None,
            execution_time_ms: None,
            metadata: BTreeMap::new(),
            error_message: None,
        }
    }

    /// Failed result carrying the error text.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Self::success(0)
        }
    }

    pub fn with_counts(mut self, new_items: u64, updated_items: u64) -> Self {
        self.new_items = new_items;
        self.updated_items = updated_items;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_review(mut self, instructions: impl Into<String>) -> Self {
        self.requires_review = true;
        self.review_instructions = Some(instructions.into());
        self
    }

    pub fn with_execution_time_ms(mut self, millis: u64) -> Self {
        self.execution_time_ms = Some(millis);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Answer to "does this node need to run?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCheck {
    pub needs_run: bool,
    pub reasons: Vec<String>,
}

impl ChangeCheck {
    pub fn stale(reasons: Vec<String>) -> Self {
        Self {
            needs_run: true,
            reasons,
        }
    }

    pub fn fresh() -> Self {
        Self {
            needs_run: false,
            reasons: Vec::new(),
        }
    }

    /// Convert a detector error into a stale check (fail-open).
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self::stale(vec![format!("change detection failed: {err:#}")])
    }
}

/// Historical record of one node within one invocation.
///
/// `status == Completed` always implies `result.success`; the transition
/// helpers below are the only way the engine moves a record forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_name: String,
    pub status: NodeStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<FlowResult>,
    /// Change-detection reasons that put the node into the execution set.
    pub reasons: Vec<String>,
}

impl NodeExecution {
    pub fn pending(node_name: impl Into<String>, reasons: Vec<String>) -> Self {
        Self {
            node_name: node_name.into(),
            status: NodeStatus::Pending,
            started_at: None,
            finished_at: None,
            result: None,
            reasons,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Running;
        self.started_at = Some(now);
    }

    /// Record the node's result; a non-success result marks the record failed.
    pub fn finish(&mut self, result: FlowResult, now: DateTime<Utc>) {
        self.status = if result.success {
            NodeStatus::Completed
        } else {
            NodeStatus::Failed
        };
        self.finished_at = Some(now);
        self.result = Some(result);
    }

    /// Mark failed for reasons outside `execute` (readiness, archive I/O).
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = NodeStatus::Failed;
        self.finished_at = Some(now);
        self.result = Some(FlowResult::failure(message));
    }

    pub fn mark_skipped(&mut self, now: DateTime<Utc>) {
        self.status = NodeStatus::Skipped;
        self.finished_at = Some(now);
    }

    pub fn error_message(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(|result| result.error_message.as_deref())
    }
}

/// Inclusive date filter handed to nodes that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(anyhow!("date range start {start} is after end {end}"));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

/// Shared state for one top-level invocation.
///
/// Owned by the engine; every node sees it by shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub started_at: DateTime<Utc>,
    pub interactive: bool,
    /// Matching confidence threshold in basis points (10000 = 100%).
    pub confidence_threshold_bp: u32,
    pub date_range: Option<DateRange>,
    /// Domain name → session archive created during this invocation.
    pub archives: BTreeMap<String, PathBuf>,
    pub executions: Vec<NodeExecution>,
    pub dry_run: bool,
    pub force: bool,
    pub verbose: bool,
}

impl FlowContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            interactive: false,
            confidence_threshold_bp: 8_000,
            date_range: None,
            archives: BTreeMap::new(),
            executions: Vec::new(),
            dry_run: false,
            force: false,
            verbose: false,
        }
    }

    pub fn execution(&self, node_name: &str) -> Option<&NodeExecution> {
        self.executions
            .iter()
            .find(|execution| execution.node_name == node_name)
    }

    /// Names of nodes with the given status, in execution order.
    pub fn names_with_status(&self, status: NodeStatus) -> Vec<String> {
        self.executions
            .iter()
            .filter(|execution| execution.status == status)
            .map(|execution| execution.node_name.clone())
            .collect()
    }
}
