//! `flow`: run the finance pipeline's stale nodes in dependency order.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use flow::core::types::DateRange;
use flow::engine::{EngineError, FlowExecutionEngine};
use flow::exit_codes;
use flow::io::archive::ArchiveManager;
use flow::io::config::{DEFAULT_CONFIG_FILE, FlowConfig, load_config};
use flow::io::dir_hash::InProcessHasher;
use flow::io::nodes::build_registry;
use flow::io::operator::{AutoApprove, Operator, TerminalOperator};
use flow::io::run_log::latest_run_log;
use flow::logging;
use flow::plan::NodeFilter;
use flow::run::{RunOptions, plan_flow, run_flow};
use flow::status::{collect_status, render_table};

#[derive(Parser)]
#[command(
    name = "flow",
    version,
    about = "Sequential, change-driven runner for the finance data pipeline"
)]
struct Cli {
    /// Path to the flow config file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Log progress at info level (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct SelectArgs {
    /// Treat every node as changed.
    #[arg(long)]
    force: bool,
    /// Treat this node as changed (repeatable).
    #[arg(long = "force-node", value_name = "NODE")]
    force_nodes: Vec<String>,
    /// Only run these nodes (repeatable).
    #[arg(long, value_name = "NODE")]
    only: Vec<String>,
    /// With --only, also allow the nodes they depend on.
    #[arg(long)]
    with_deps: bool,
}

impl SelectArgs {
    fn filter(&self) -> NodeFilter {
        NodeFilter {
            only: self.only.iter().cloned().collect(),
            force: self.force_nodes.iter().cloned().collect(),
            with_dependencies: self.with_deps,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Check that every dependency is registered and the graph is acyclic.
    Validate,
    /// Show which nodes would run, in order, and why.
    Plan {
        #[command(flatten)]
        select: SelectArgs,
    },
    /// Run stale nodes (and everything downstream of them).
    Run {
        #[command(flatten)]
        select: SelectArgs,
        /// Compute and print the plan without executing anything.
        #[arg(long)]
        dry_run: bool,
        /// Do not prompt before each node.
        #[arg(short, long)]
        yes: bool,
        /// Start of the date range handed to nodes (YYYY-MM-DD).
        #[arg(long)]
        since: Option<NaiveDate>,
        /// End of the date range (YYYY-MM-DD, defaults to today with --since).
        #[arg(long)]
        until: Option<NaiveDate>,
        /// Matching confidence threshold in basis points.
        #[arg(long, value_name = "BP")]
        confidence: Option<u32>,
    },
    /// Show per-node output status.
    Status,
    /// Archive the configured session domains now.
    Archive {
        #[arg(long, default_value = "manual archive")]
        reason: String,
    },
    /// Delete old domain archives beyond a retention count.
    Cleanup {
        /// Archives to keep per domain (default: archive_keep_count).
        #[arg(long)]
        keep: Option<usize>,
        /// Domains to clean (default: session_domains).
        #[arg(long)]
        domain: Vec<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        let code = err
            .downcast_ref::<EngineError>()
            .map_or(exit_codes::INVALID, EngineError::exit_code);
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli.config)?;
    match cli.command {
        Command::Validate => cmd_validate(&cfg),
        Command::Plan { select } => cmd_plan(&cfg, &select, cli.verbose),
        Command::Run {
            select,
            dry_run,
            yes,
            since,
            until,
            confidence,
        } => {
            let options = RunOptions {
                force: select.force,
                dry_run,
                interactive: !yes && !dry_run,
                verbose: cli.verbose,
                filter: select.filter(),
                date_range: date_range(since, until)?,
                confidence_threshold_bp: confidence,
            };
            cmd_run(&cfg, &options, yes)
        }
        Command::Status => cmd_status(&cfg),
        Command::Archive { reason } => cmd_archive(&cfg, &reason),
        Command::Cleanup { keep, domain } => cmd_cleanup(&cfg, keep, domain),
    }
}

fn date_range(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Result<Option<DateRange>> {
    match (since, until) {
        (None, None) => Ok(None),
        (Some(start), end) => {
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            Ok(Some(DateRange::new(start, end)?))
        }
        (None, Some(_)) => bail!("--until requires --since"),
    }
}

fn cmd_validate(cfg: &FlowConfig) -> Result<()> {
    let engine = FlowExecutionEngine::new(build_registry(cfg), InProcessHasher)?;
    let all = engine.graph().node_names();
    let levels = engine
        .graph()
        .execution_levels(&all)
        .map_err(EngineError::from)?;
    println!(
        "flow graph is valid: {} nodes in {} levels",
        all.len(),
        levels.len()
    );
    Ok(())
}

fn cmd_plan(cfg: &FlowConfig, select: &SelectArgs, verbose: bool) -> Result<()> {
    let options = RunOptions {
        force: select.force,
        verbose,
        filter: select.filter(),
        ..RunOptions::default()
    };
    let plan = plan_flow(cfg, &options)?;
    print!("{plan}");
    Ok(())
}

fn cmd_run(cfg: &FlowConfig, options: &RunOptions, yes: bool) -> Result<()> {
    let mut terminal = TerminalOperator;
    let mut auto = AutoApprove;
    let operator: &mut dyn Operator = if yes { &mut auto } else { &mut terminal };

    let outcome = run_flow(cfg, options, operator)?;
    print!("{}", outcome.plan);
    if options.dry_run {
        println!("Dry run: nothing was executed.");
        return Ok(());
    }
    if let Some(session) = &outcome.session {
        println!(
            "Archived {} files ({} bytes) in session {}",
            session.total_files, session.total_bytes, session.session_id
        );
    }
    print!("{}", outcome.summary);
    if let Some(path) = &outcome.run_log {
        println!("Run log: {}", path.display());
    }
    Ok(())
}

fn cmd_status(cfg: &FlowConfig) -> Result<()> {
    let registry = build_registry(cfg);
    let last_run = latest_run_log(&cfg.cache_dir).unwrap_or_else(|err| {
        warn!(err = %format!("{err:#}"), "ignoring unreadable run log");
        None
    });
    let reports = collect_status(&registry, Utc::now(), last_run.as_ref());
    print!("{}", render_table(&reports));
    Ok(())
}

fn cmd_archive(cfg: &FlowConfig, reason: &str) -> Result<()> {
    if cfg.session_domains.is_empty() {
        bail!("no session_domains configured");
    }
    let session = ArchiveManager::new(&cfg.data_dir)
        .create_session(&cfg.session_domains, reason, &BTreeMap::new(), Utc::now())
        .map_err(|err| EngineError::SessionArchive(format!("{err:#}")))?;
    for manifest in &session.archives {
        println!(
            "{} ({} files, {} bytes)",
            manifest.archive_path.display(),
            manifest.file_count,
            manifest.size_bytes
        );
    }
    for domain in &session.skipped_domains {
        println!("{domain}: nothing to archive");
    }
    println!("Session: {}", session.session_id);
    Ok(())
}

fn cmd_cleanup(cfg: &FlowConfig, keep: Option<usize>, domains: Vec<String>) -> Result<()> {
    let domains = if domains.is_empty() {
        cfg.session_domains.clone()
    } else {
        domains
    };
    if domains.is_empty() {
        bail!("no domains given and no session_domains configured");
    }
    let keep = keep.unwrap_or(cfg.archive_keep_count);
    let manager = ArchiveManager::new(&cfg.data_dir);
    for domain in &domains {
        let removed = manager.cleanup_old_archives(domain, keep)?;
        println!("{domain}: removed {} archives (kept up to {keep})", removed.len());
    }
    Ok(())
}
