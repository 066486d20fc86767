//! Per-invocation run logs under `<cache_dir>/flow/runs/`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{DateRange, FlowContext, NodeExecution};

/// Persisted history of one `flow run` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// `None` when the run completed, otherwise the fatal error.
    pub error: Option<String>,
    pub force: bool,
    pub interactive: bool,
    pub date_range: Option<DateRange>,
    /// Domain → session archive taken before the run.
    pub archives: BTreeMap<String, PathBuf>,
    pub executions: Vec<NodeExecution>,
}

impl RunLog {
    pub fn from_context(
        run_id: impl Into<String>,
        ctx: &FlowContext,
        finished_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            started_at: ctx.started_at,
            finished_at,
            error,
            force: ctx.force,
            interactive: ctx.interactive,
            date_range: ctx.date_range,
            archives: ctx.archives.clone(),
            executions: ctx.executions.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// `<YYYYMMDD_HHMMSS>_<6 lowercase alphanumerics>`.
pub fn timestamped_id(now: DateTime<Utc>) -> String {
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), generate_short_id())
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

pub fn runs_dir(cache_dir: &Path) -> PathBuf {
    cache_dir.join("flow").join("runs")
}

pub fn run_log_path(cache_dir: &Path, run_id: &str) -> PathBuf {
    runs_dir(cache_dir).join(format!("{run_id}.json"))
}

/// Atomically write a run log (temp file + rename).
pub fn write_run_log(path: &Path, log: &RunLog) -> Result<()> {
    debug!(path = %path.display(), run_id = %log.run_id, "writing run log");
    let mut buf = serde_json::to_string_pretty(log).context("serialize run log")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run log path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp run log {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run log {}", path.display()))?;
    Ok(())
}

pub fn load_run_log(path: &Path) -> Result<RunLog> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run log {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse run log {}", path.display()))
}

/// Most recent run log by id (ids sort chronologically), if any.
pub fn latest_run_log(cache_dir: &Path) -> Result<Option<RunLog>> {
    let dir = runs_dir(cache_dir);
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry.context("read entry")?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        if latest.as_ref().is_none_or(|best| path > *best) {
            latest = Some(path);
        }
    }
    latest.map(|path| load_run_log(&path)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FlowResult;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn ids_are_timestamped_and_short() {
        let id = timestamped_id(at("2026-02-03T04:05:06Z"));
        assert!(id.starts_with("20260203_040506_"));
        let suffix = id.rsplit('_').next().expect("suffix");
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn run_log_round_trips_with_executions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut ctx = FlowContext::new(at("2026-02-03T04:05:06Z"));
        let mut execution = NodeExecution::pending("sync", vec!["token changed".into()]);
        execution.mark_running(ctx.started_at);
        execution.finish(FlowResult::success(4), at("2026-02-03T04:06:00Z"));
        ctx.executions.push(execution);

        let log = RunLog::from_context("run-1", &ctx, at("2026-02-03T04:06:01Z"), None);
        let path = run_log_path(temp.path(), &log.run_id);
        write_run_log(&path, &log).expect("write");

        assert!(path.ends_with("flow/runs/run-1.json"));
        assert_eq!(load_run_log(&path).expect("load"), log);
        assert!(log.succeeded());
    }

    #[test]
    fn latest_run_log_picks_newest_id() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(latest_run_log(temp.path()).expect("empty").is_none());

        let ctx = FlowContext::new(at("2026-02-03T04:05:06Z"));
        for (id, error) in [
            ("20260101_000000_aaaaaa", None),
            ("20260301_000000_bbbbbb", Some("boom".to_string())),
            ("20260201_000000_cccccc", None),
        ] {
            let log = RunLog::from_context(id, &ctx, ctx.started_at, error);
            write_run_log(&run_log_path(temp.path(), id), &log).expect("write");
        }
        let latest = latest_run_log(temp.path()).expect("load").expect("some");
        assert_eq!(latest.run_id, "20260301_000000_bbbbbb");
        assert_eq!(latest.error.as_deref(), Some("boom"));
    }
}
