//! Per-node output status, for `flow status` and interactive prompts.

use std::fmt::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::node::OutputInfo;
use crate::core::registry::FlowNodeRegistry;
use crate::core::types::NodeStatus;
use crate::io::run_log::RunLog;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatusReport {
    pub name: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub output_dir: Option<PathBuf>,
    pub file_count: usize,
    pub total_records: u64,
    /// Whole days since the newest output file was modified.
    pub age_days: Option<i64>,
    pub ready: bool,
    /// Status in the most recent run log, if the node took part.
    pub last_run: Option<NodeStatus>,
}

/// One report per registered node, alphabetical.
pub fn collect_status(
    registry: &FlowNodeRegistry,
    now: DateTime<Utc>,
    last_run: Option<&RunLog>,
) -> Vec<NodeStatusReport> {
    registry
        .iter()
        .map(|node| {
            let info = node.output_info();
            NodeStatusReport {
                name: node.name().to_string(),
                description: node.description().to_string(),
                dependencies: node.dependencies().iter().cloned().collect(),
                output_dir: node.output_dir().map(PathBuf::from),
                file_count: info.output_files().len(),
                total_records: info.total_records(),
                age_days: age_days(&info, now),
                ready: info.is_data_ready(),
                last_run: last_run.and_then(|log| {
                    log.executions
                        .iter()
                        .find(|execution| execution.node_name == node.name())
                        .map(|execution| execution.status)
                }),
            }
        })
        .collect()
}

pub fn age_days(info: &OutputInfo, now: DateTime<Utc>) -> Option<i64> {
    info.newest_modified()
        .map(|modified| (now - modified).num_days().max(0))
}

/// Short human summary, e.g. `3 files, 120 records, updated 2 days ago`.
pub fn describe_output(info: &OutputInfo, now: DateTime<Utc>) -> String {
    let files = info.output_files().len();
    if files == 0 {
        return if info.is_data_ready() {
            "no persistent output".to_string()
        } else {
            "no output yet".to_string()
        };
    }
    let plural = if files == 1 { "" } else { "s" };
    let mut line = format!("{files} file{plural}, {} records", info.total_records());
    match age_days(info, now) {
        Some(0) => line.push_str(", updated today"),
        Some(1) => line.push_str(", updated 1 day ago"),
        Some(days) => {
            let _ = write!(line, ", updated {days} days ago");
        }
        None => {}
    }
    line
}

pub fn render_table(reports: &[NodeStatusReport]) -> String {
    let width = reports
        .iter()
        .map(|report| report.name.len())
        .max()
        .unwrap_or(4)
        .max(4);
    let mut out = format!(
        "{:<width$}  {:>5}  {:>8}  {:>8}  {:<5}  LAST RUN\n",
        "NODE", "FILES", "RECORDS", "AGE", "READY"
    );
    for report in reports {
        let age = report
            .age_days
            .map(|days| format!("{days}d"))
            .unwrap_or_else(|| "-".to_string());
        let last_run = report
            .last_run
            .map(|status| format!("{status:?}").to_lowercase())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<width$}  {:>5}  {:>8}  {:>8}  {:<5}  {}",
            report.name,
            report.file_count,
            report.total_records,
            age,
            if report.ready { "yes" } else { "no" },
            last_run
        );
    }
    out
}
