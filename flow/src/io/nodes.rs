//! Concrete [`FlowNode`] adapters built from configuration.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use minijinja::{Environment, context};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::node::{FlowNode, OutputInfo};
use crate::core::registry::FlowNodeRegistry;
use crate::core::types::{ChangeCheck, FlowContext, FlowResult};
use crate::io::change_detection::{ChangeDetector, DetectorCache, NodeDetector, TokenSource};
use crate::io::config::{DetectorConfig, FlowConfig, NodeConfig, NodeKind};
use crate::io::outputs::scan_output_dir;
use crate::io::process::{RunLimits, command_from_argv, run_captured};

const NO_DETECTOR_REASON: &str = "no change detector configured";

/// Stale-or-not via the node's detector, or always stale without one.
fn detect(name: &str, detector: Option<&NodeDetector>) -> Result<ChangeCheck> {
    match detector {
        Some(detector) => detector.check(name, Utc::now()),
        None => Ok(ChangeCheck::stale(vec![NO_DETECTOR_REASON.to_string()])),
    }
}

fn commit(name: &str, detector: Option<&NodeDetector>, ctx: &FlowContext) -> Result<()> {
    let Some(detector) = detector else {
        return Ok(());
    };
    if ctx.dry_run {
        return Ok(());
    }
    if detector.commit(name)? {
        debug!(node = name, "change-detection state committed");
    }
    Ok(())
}

fn output_info_for(name: &str, output_dir: Option<&Path>) -> OutputInfo {
    let Some(dir) = output_dir else {
        return OutputInfo::stateless();
    };
    match scan_output_dir(dir) {
        Ok(info) => info,
        Err(err) => {
            warn!(node = name, err = %format!("{err:#}"), "failed to scan output directory");
            OutputInfo::default()
        }
    }
}

/// Optional JSON summary a wrapped tool prints as its last stdout line.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CommandSummary {
    items_processed: u64,
    new_items: u64,
    updated_items: u64,
    requires_review: bool,
    review_instructions: Option<String>,
}

fn parse_summary(stdout: &str) -> Option<CommandSummary> {
    let last = stdout.lines().rev().find(|line| !line.trim().is_empty())?;
    let value: Value = serde_json::from_str(last.trim()).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Wraps an external CLI tool.
#[derive(Debug, Clone)]
pub struct CommandNode {
    name: String,
    description: String,
    dependencies: BTreeSet<String>,
    argv: Vec<String>,
    workdir: PathBuf,
    output_dir: Option<PathBuf>,
    detector: Option<NodeDetector>,
    data_dir: PathBuf,
    cache_dir: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandNode {
    pub fn from_config(node: &NodeConfig, cfg: &FlowConfig) -> Self {
        let workdir = node.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
        Self {
            name: node.name.clone(),
            description: node.description.clone(),
            dependencies: node.depends_on.iter().cloned().collect(),
            argv: node.command.clone(),
            detector: node_detector(node, cfg, &workdir),
            workdir,
            output_dir: node.output_dir.clone(),
            data_dir: cfg.data_dir.clone(),
            cache_dir: cfg.cache_dir.clone(),
            timeout: Duration::from_secs(cfg.command_timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }

    /// Render each argv element as a template against the invocation context.
    ///
    /// Elements that render to an empty string are dropped, so optional flags
    /// can be written as `{% if dry_run %}--dry-run{% endif %}`.
    pub fn render_argv(&self, ctx: &FlowContext) -> Result<Vec<String>> {
        let env = Environment::new();
        let output_dir = self
            .output_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_default();
        let vars = context! {
            node => self.name.as_str(),
            data_dir => self.data_dir.display().to_string(),
            cache_dir => self.cache_dir.display().to_string(),
            output_dir => output_dir,
            confidence_threshold_bp => ctx.confidence_threshold_bp,
            date_start => ctx.date_range.map(|range| range.start.to_string()),
            date_end => ctx.date_range.map(|range| range.end.to_string()),
            dry_run => ctx.dry_run,
            verbose => ctx.verbose,
        };
        let mut rendered = Vec::with_capacity(self.argv.len());
        for arg in &self.argv {
            let value = env
                .render_str(arg, &vars)
                .with_context(|| format!("render argument '{arg}'"))?;
            if !value.is_empty() {
                rendered.push(value);
            }
        }
        Ok(rendered)
    }
}

impl FlowNode for CommandNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    fn check_changes(&self, _ctx: &FlowContext) -> Result<ChangeCheck> {
        detect(&self.name, self.detector.as_ref())
    }

    fn commit_changes(&self, ctx: &FlowContext) -> Result<()> {
        commit(&self.name, self.detector.as_ref(), ctx)
    }

    #[instrument(skip_all, fields(node = %self.name))]
    fn execute(&self, ctx: &FlowContext) -> Result<FlowResult> {
        let argv = self.render_argv(ctx)?;
        if let Some(dir) = &self.output_dir {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }

        let started = Instant::now();
        let cmd = command_from_argv(&argv, &self.workdir)?;
        let output = run_captured(cmd, RunLimits::new(self.timeout, self.output_limit_bytes))?;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if !output.succeeded() {
            bail!(output.failure_message(&argv[0]));
        }

        let summary = parse_summary(&output.stdout_text()).unwrap_or_default();
        let outputs = output_info_for(&self.name, self.output_dir.as_deref())
            .output_files()
            .iter()
            .map(|file| file.path.clone())
            .collect();

        let mut result = FlowResult::success(summary.items_processed)
            .with_counts(summary.new_items, summary.updated_items)
            .with_outputs(outputs)
            .with_execution_time_ms(elapsed_ms)
            .with_metadata("exit_code", output.status.code())
            .with_metadata("duration_ms", elapsed_ms);
        if summary.requires_review {
            result = result.with_review(summary.review_instructions.unwrap_or_default());
        }
        info!(
            items = result.items_processed,
            elapsed_ms, "command node finished"
        );
        Ok(result)
    }

    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    fn output_info(&self) -> OutputInfo {
        output_info_for(&self.name, self.output_dir.as_deref())
    }

    fn description(&self) -> &str {
        &self.description
    }
}

/// A step the operator performs by hand (e.g. balance reconciliation).
#[derive(Debug, Clone)]
pub struct ManualStepNode {
    name: String,
    description: String,
    dependencies: BTreeSet<String>,
    instructions: String,
    output_dir: Option<PathBuf>,
    detector: Option<NodeDetector>,
}

impl ManualStepNode {
    pub fn from_config(node: &NodeConfig, cfg: &FlowConfig) -> Self {
        let workdir = node.workdir.clone().unwrap_or_else(|| PathBuf::from("."));
        Self {
            name: node.name.clone(),
            description: node.description.clone(),
            dependencies: node.depends_on.iter().cloned().collect(),
            instructions: node
                .instructions
                .clone()
                .unwrap_or_else(|| format!("Complete the manual step '{}'.", node.name)),
            output_dir: node.output_dir.clone(),
            detector: node_detector(node, cfg, &workdir),
        }
    }
}

impl FlowNode for ManualStepNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    fn check_changes(&self, _ctx: &FlowContext) -> Result<ChangeCheck> {
        detect(&self.name, self.detector.as_ref())
    }

    fn commit_changes(&self, ctx: &FlowContext) -> Result<()> {
        commit(&self.name, self.detector.as_ref(), ctx)
    }

    fn execute(&self, _ctx: &FlowContext) -> Result<FlowResult> {
        Ok(FlowResult::success(0).with_review(self.instructions.clone()))
    }

    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    fn output_info(&self) -> OutputInfo {
        output_info_for(&self.name, self.output_dir.as_deref())
    }

    fn description(&self) -> &str {
        &self.description
    }
}

fn node_detector(node: &NodeConfig, cfg: &FlowConfig, workdir: &Path) -> Option<NodeDetector> {
    node.detector.as_ref().map(|detector| {
        NodeDetector::new(
            detector_from_config(detector, workdir),
            DetectorCache::new(&cfg.cache_dir),
        )
    })
}

pub fn detector_from_config(detector: &DetectorConfig, workdir: &Path) -> ChangeDetector {
    match detector {
        DetectorConfig::Token {
            token_file,
            token_command,
            refresh_hours,
        } => {
            let source = match (token_file, token_command) {
                (Some(path), _) => TokenSource::File(path.clone()),
                (None, command) => TokenSource::Command {
                    argv: command.clone().unwrap_or_default(),
                    workdir: workdir.to_path_buf(),
                },
            };
            ChangeDetector::TokenComparison {
                source,
                refresh_interval: hours(*refresh_hours),
            }
        }
        DetectorConfig::NewFiles { dir } => ChangeDetector::NewFiles { dir: dir.clone() },
        DetectorConfig::Freshness { upstream } => ChangeDetector::UpstreamFreshness {
            upstream: upstream.clone(),
        },
        DetectorConfig::Interval { hours: period } => ChangeDetector::FixedInterval {
            period: hours(*period),
        },
    }
}

fn hours(hours: u64) -> Duration {
    Duration::from_secs(hours.saturating_mul(3600))
}

/// Registry with one adapter per configured node.
pub fn build_registry(cfg: &FlowConfig) -> FlowNodeRegistry {
    let mut registry = FlowNodeRegistry::new();
    for node in &cfg.nodes {
        match node.kind {
            NodeKind::Command => registry.register(Box::new(CommandNode::from_config(node, cfg))),
            NodeKind::Manual => {
                registry.register(Box::new(ManualStepNode::from_config(node, cfg)));
            }
        }
    }
    registry
}
