//! The unit-of-work contract every pipeline step implements.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{ChangeCheck, FlowContext, FlowResult};

/// One file a node has produced, with its record count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub path: PathBuf,
    pub record_count: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// Snapshot of what a node currently has on disk.
///
/// Used for the interactive status line and for dependency-readiness checks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutputInfo {
    files: Vec<OutputFile>,
    ready: bool,
}

impl OutputInfo {
    /// Output is ready as soon as at least one file exists.
    pub fn from_files(files: Vec<OutputFile>) -> Self {
        let ready = !files.is_empty();
        Self { files, ready }
    }

    /// Node with no persistent output; always ready.
    pub fn stateless() -> Self {
        Self {
            files: Vec::new(),
            ready: true,
        }
    }

    /// Override readiness (e.g. a node that validates file contents).
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn is_data_ready(&self) -> bool {
        self.ready
    }

    pub fn output_files(&self) -> &[OutputFile] {
        &self.files
    }

    pub fn total_records(&self) -> u64 {
        self.files.iter().map(|file| file.record_count).sum()
    }

    pub fn newest_modified(&self) -> Option<DateTime<Utc>> {
        self.files.iter().filter_map(|file| file.modified).max()
    }
}

/// A named unit of work with declared dependencies.
///
/// Nodes are stateless across executions: anything they remember lives in the
/// file system or in their change-detector cache.
pub trait FlowNode {
    /// Stable, unique identifier.
    fn name(&self) -> &str;

    /// Names of nodes that must complete before this one.
    fn dependencies(&self) -> &BTreeSet<String>;

    /// Decide whether the node is stale.
    ///
    /// Must not write anything: a check that is never followed by a
    /// successful execution leaves the change pending. Errors are treated as
    /// "needs to run" by the caller.
    fn check_changes(&self, context: &FlowContext) -> Result<ChangeCheck>;

    /// Record the state seen by the last [`check_changes`](Self::check_changes)
    /// as handled. Called by the engine only after the node executed and its
    /// output was archived.
    fn commit_changes(&self, _context: &FlowContext) -> Result<()> {
        Ok(())
    }

    /// Perform the node's side effects.
    ///
    /// An `Err` is converted into a failed [`FlowResult`] by the engine.
    fn execute(&self, context: &FlowContext) -> Result<FlowResult>;

    /// Directory the engine snapshots around execution, if any.
    fn output_dir(&self) -> Option<&Path>;

    fn output_info(&self) -> OutputInfo;

    fn description(&self) -> &str {
        ""
    }
}
