//! One `flow run` invocation, end to end.
//!
//! config → registry → engine (validation) → plan → session archive →
//! execute → run log. The run log is written whether or not the engine
//! succeeds; dry runs write nothing.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info};

use crate::core::types::{DateRange, FlowContext};
use crate::engine::{EngineError, FlowExecutionEngine, RunSummary};
use crate::io::archive::{ArchiveManager, ArchiveSession};
use crate::io::config::FlowConfig;
use crate::io::dir_hash::{DirectoryHasher, configured_hasher};
use crate::io::nodes::build_registry;
use crate::io::operator::Operator;
use crate::io::run_log::{RunLog, run_log_path, timestamped_id, write_run_log};
use crate::plan::{ExecutionPlan, NodeFilter};

/// Invocation flags, as parsed by the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub force: bool,
    pub dry_run: bool,
    pub interactive: bool,
    pub verbose: bool,
    pub filter: NodeFilter,
    pub date_range: Option<DateRange>,
    /// Overrides `confidence_threshold_bp` from the config.
    pub confidence_threshold_bp: Option<u32>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub plan: ExecutionPlan,
    pub summary: RunSummary,
    pub session: Option<ArchiveSession>,
    /// Where the run log was written (`None` for dry runs or if writing failed).
    pub run_log: Option<PathBuf>,
}

/// Fresh context for this invocation.
pub fn build_context(cfg: &FlowConfig, options: &RunOptions, now: DateTime<Utc>) -> FlowContext {
    let mut ctx = FlowContext::new(now);
    ctx.interactive = options.interactive;
    ctx.confidence_threshold_bp = options
        .confidence_threshold_bp
        .unwrap_or(cfg.confidence_threshold_bp);
    ctx.date_range = options.date_range;
    ctx.dry_run = options.dry_run;
    ctx.force = options.force;
    ctx.verbose = options.verbose;
    ctx
}

/// Compute the plan only. Checks never write detector state.
pub fn plan_flow(cfg: &FlowConfig, options: &RunOptions) -> Result<ExecutionPlan, EngineError> {
    let engine = FlowExecutionEngine::new(build_registry(cfg), configured_hasher(&cfg.hash))?;
    let mut ctx = build_context(cfg, options, Utc::now());
    ctx.dry_run = true;
    engine.plan(&ctx, &options.filter)
}

pub fn run_flow(
    cfg: &FlowConfig,
    options: &RunOptions,
    operator: &mut dyn Operator,
) -> Result<RunOutcome, EngineError> {
    let now = Utc::now();
    let engine = FlowExecutionEngine::new(build_registry(cfg), configured_hasher(&cfg.hash))?;
    let mut ctx = build_context(cfg, options, now);

    let plan = engine.plan(&ctx, &options.filter)?;
    if ctx.dry_run {
        let summary = engine.execute_plan(&mut ctx, &plan, operator)?;
        return Ok(RunOutcome {
            plan,
            summary,
            session: None,
            run_log: None,
        });
    }

    let run_id = timestamped_id(now);
    let result = archive_and_execute(&engine, cfg, &mut ctx, &plan, operator);

    let log = RunLog::from_context(
        run_id.as_str(),
        &ctx,
        Utc::now(),
        result.as_ref().err().map(|err| err.to_string()),
    );
    let path = run_log_path(&cfg.cache_dir, &run_id);
    let run_log = match write_run_log(&path, &log) {
        Ok(()) => Some(path),
        Err(err) => {
            error!(err = %format!("{err:#}"), "failed to write run log");
            None
        }
    };

    let (summary, session) = result?;
    info!(run_id = %run_id, "flow run finished");
    Ok(RunOutcome {
        plan,
        summary,
        session,
        run_log,
    })
}

fn archive_and_execute<H: DirectoryHasher>(
    engine: &FlowExecutionEngine<H>,
    cfg: &FlowConfig,
    ctx: &mut FlowContext,
    plan: &ExecutionPlan,
    operator: &mut dyn Operator,
) -> Result<(RunSummary, Option<ArchiveSession>), EngineError> {
    let session = if plan.is_empty() || cfg.session_domains.is_empty() {
        None
    } else {
        let session = ArchiveManager::new(&cfg.data_dir)
            .create_session(
                &cfg.session_domains,
                "pre-run backup",
                &session_context(ctx, plan),
                ctx.started_at,
            )
            .map_err(|err| EngineError::SessionArchive(format!("{err:#}")))?;
        ctx.archives = session.archive_paths();
        Some(session)
    };

    let summary = engine.execute_plan(ctx, plan, operator)?;
    Ok((summary, session))
}

fn session_context(ctx: &FlowContext, plan: &ExecutionPlan) -> BTreeMap<String, Value> {
    let mut context = BTreeMap::new();
    context.insert("force".to_string(), Value::Bool(ctx.force));
    context.insert("interactive".to_string(), Value::Bool(ctx.interactive));
    context.insert("nodes".to_string(), Value::from(plan.order.clone()));
    if let Some(range) = ctx.date_range {
        context.insert("date_start".to_string(), Value::from(range.start.to_string()));
        context.insert("date_end".to_string(), Value::from(range.end.to_string()));
    }
    context
}
