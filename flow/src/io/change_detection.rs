//! Per-node change detection.
//!
//! Each node owns one small JSON state document at
//! `<cache_dir>/flow/<node>_last_check.json`. A check only reads it; the state
//! the check observed is written back by [`NodeDetector::commit`] once the node
//! has actually run. State is never deleted here; resetting a node means
//! removing its file by hand.
//!
//! Detector errors are returned to the caller; the planner turns them into a
//! stale verdict (fail-open).

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::ChangeCheck;
use crate::io::process::{RunLimits, command_from_argv, run_captured};

const TOKEN_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const TOKEN_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;
/// New-file reasons beyond this are summarized as a count.
const MAX_LISTED_ENTRIES: usize = 10;

/// Persisted detector state. Fields a strategy does not use stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorState {
    pub last_check: Option<DateTime<Utc>>,
    pub token: Option<String>,
    pub entries: Option<BTreeSet<String>>,
}

/// Reads and writes detector state files.
#[derive(Debug, Clone)]
pub struct DetectorCache {
    dir: PathBuf,
}

impl DetectorCache {
    /// Cache rooted at `<cache_dir>/flow`.
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("flow"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, node: &str) -> PathBuf {
        self.dir.join(format!("{node}_last_check.json"))
    }

    pub fn load(&self, node: &str) -> Result<Option<DetectorState>> {
        let path = self.state_path(node);
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parse detector state {}", path.display()))?;
        Ok(Some(state))
    }

    /// Atomically write state (temp file + rename).
    pub fn store(&self, node: &str, state: &DetectorState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create directory {}", self.dir.display()))?;
        let path = self.state_path(node);
        let mut buf = serde_json::to_string_pretty(state).context("serialize detector state")?;
        buf.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("replace {}", path.display()))?;
        debug!(node, path = %path.display(), "detector state stored");
        Ok(())
    }
}

/// Where a token detector reads the current upstream token from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Contents of a file (trimmed), e.g. a sync cursor written by the sync tool.
    File(PathBuf),
    /// Trimmed stdout of a command.
    Command { argv: Vec<String>, workdir: PathBuf },
}

impl TokenSource {
    fn read(&self) -> Result<String> {
        match self {
            TokenSource::File(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("read token {}", path.display()))?;
                Ok(raw.trim().to_string())
            }
            TokenSource::Command { argv, workdir } => {
                let cmd = command_from_argv(argv, workdir)?;
                let output = run_captured(
                    cmd,
                    RunLimits::new(TOKEN_COMMAND_TIMEOUT, TOKEN_OUTPUT_LIMIT_BYTES),
                )?;
                if !output.succeeded() {
                    return Err(anyhow!(output.failure_message("token command")));
                }
                Ok(output.stdout_text().trim().to_string())
            }
        }
    }
}

/// Change-detection strategy, chosen per node at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDetector {
    /// Stale when the upstream token differs from the cached one, or when no
    /// check has happened for `refresh_interval`.
    TokenComparison {
        source: TokenSource,
        refresh_interval: Duration,
    },
    /// Stale when `dir` contains entries absent from the previous listing.
    NewFiles { dir: PathBuf },
    /// Stale when any upstream file was modified after the last check.
    UpstreamFreshness { upstream: Vec<PathBuf> },
    /// Stale when the last check is older than `period`.
    FixedInterval { period: Duration },
}

/// Verdict of one check plus the state to record once the node has run.
#[derive(Debug, Clone)]
pub struct Detection {
    pub check: ChangeCheck,
    pub state: DetectorState,
}

impl ChangeDetector {
    /// Check `node` against its cached state at time `now`. Read-only.
    pub fn check(
        &self,
        node: &str,
        cache: &DetectorCache,
        now: DateTime<Utc>,
    ) -> Result<Detection> {
        let previous = cache.load(node)?;
        let (check, state) = match self {
            ChangeDetector::TokenComparison {
                source,
                refresh_interval,
            } => check_token(source, *refresh_interval, previous.as_ref(), now)?,
            ChangeDetector::NewFiles { dir } => check_new_files(dir, previous.as_ref(), now)?,
            ChangeDetector::UpstreamFreshness { upstream } => {
                check_freshness(upstream, previous.as_ref(), now)?
            }
            ChangeDetector::FixedInterval { period } => {
                check_interval(*period, previous.as_ref(), now)?
            }
        };
        debug!(node, needs_run = check.needs_run, reasons = ?check.reasons, "change check");
        Ok(Detection { check, state })
    }
}

/// A node's detector bound to its cache.
///
/// Holds the state observed by the latest [`check`](Self::check) until
/// [`commit`](Self::commit) writes it, so a node that is filtered out,
/// declined, or never reached keeps its change for the next run.
#[derive(Debug, Clone)]
pub struct NodeDetector {
    detector: ChangeDetector,
    cache: DetectorCache,
    pending: RefCell<Option<DetectorState>>,
}

impl NodeDetector {
    pub fn new(detector: ChangeDetector, cache: DetectorCache) -> Self {
        Self {
            detector,
            cache,
            pending: RefCell::new(None),
        }
    }

    pub fn check(&self, node: &str, now: DateTime<Utc>) -> Result<ChangeCheck> {
        self.pending.take();
        let detection = self.detector.check(node, &self.cache, now)?;
        *self.pending.borrow_mut() = Some(detection.state);
        Ok(detection.check)
    }

    /// Persist the state from the latest check. Returns `false` when there
    /// was nothing to write (no check yet, or already committed).
    pub fn commit(&self, node: &str) -> Result<bool> {
        let Some(state) = self.pending.take() else {
            return Ok(false);
        };
        self.cache.store(node, &state)?;
        Ok(true)
    }
}

fn check_token(
    source: &TokenSource,
    refresh_interval: Duration,
    previous: Option<&DetectorState>,
    now: DateTime<Utc>,
) -> Result<(ChangeCheck, DetectorState)> {
    let token = source.read()?;
    let next = DetectorState {
        last_check: Some(now),
        token: Some(token.clone()),
        entries: None,
    };

    let Some(previous) = previous else {
        return Ok((ChangeCheck::stale(vec!["no previous check recorded".into()]), next));
    };
    if previous.token.as_deref() != Some(token.as_str()) {
        return Ok((
            ChangeCheck::stale(vec!["upstream token changed".to_string()]),
            next,
        ));
    }
    if let Some(reason) = interval_elapsed(previous.last_check, refresh_interval, now)? {
        return Ok((ChangeCheck::stale(vec![reason]), next));
    }
    Ok((ChangeCheck::fresh(), next))
}

fn check_new_files(
    dir: &Path,
    previous: Option<&DetectorState>,
    now: DateTime<Utc>,
) -> Result<(ChangeCheck, DetectorState)> {
    let current = list_dir(dir)?;
    let seen = previous
        .and_then(|state| state.entries.clone())
        .unwrap_or_default();
    let added: Vec<&String> = current.difference(&seen).collect();

    let next = DetectorState {
        last_check: Some(now),
        token: None,
        entries: Some(current.clone()),
    };
    if added.is_empty() {
        return Ok((ChangeCheck::fresh(), next));
    }

    let mut reasons: Vec<String> = added
        .iter()
        .take(MAX_LISTED_ENTRIES)
        .map(|name| format!("new file: {name}"))
        .collect();
    if added.len() > MAX_LISTED_ENTRIES {
        reasons.push(format!(
            "... and {} more new files",
            added.len() - MAX_LISTED_ENTRIES
        ));
    }
    Ok((ChangeCheck::stale(reasons), next))
}

fn check_freshness(
    upstream: &[PathBuf],
    previous: Option<&DetectorState>,
    now: DateTime<Utc>,
) -> Result<(ChangeCheck, DetectorState)> {
    let next = DetectorState {
        last_check: Some(now),
        token: None,
        entries: None,
    };
    let Some(last_check) = previous.and_then(|state| state.last_check) else {
        return Ok((ChangeCheck::stale(vec!["no previous check recorded".into()]), next));
    };

    let mut reasons = Vec::new();
    for path in upstream {
        if !path.exists() {
            continue;
        }
        // Directories count as modified when any file inside them is.
        let modified = if path.is_dir() {
            file_mtimes(path)?.into_values().max()
        } else {
            Some(modified_time(path)?)
        };
        if modified.is_some_and(|modified| modified > last_check) {
            reasons.push(format!("upstream {} modified", path.display()));
        }
    }
    if reasons.is_empty() {
        return Ok((ChangeCheck::fresh(), next));
    }
    Ok((ChangeCheck::stale(reasons), next))
}

fn check_interval(
    period: Duration,
    previous: Option<&DetectorState>,
    now: DateTime<Utc>,
) -> Result<(ChangeCheck, DetectorState)> {
    let next = DetectorState {
        last_check: Some(now),
        token: None,
        entries: None,
    };
    let last_check = previous.and_then(|state| state.last_check);
    if last_check.is_none() {
        return Ok((ChangeCheck::stale(vec!["no previous check recorded".into()]), next));
    }
    match interval_elapsed(last_check, period, now)? {
        Some(reason) => Ok((ChangeCheck::stale(vec![reason]), next)),
        None => Ok((ChangeCheck::fresh(), next)),
    }
}

fn interval_elapsed(
    last_check: Option<DateTime<Utc>>,
    period: Duration,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let Some(last_check) = last_check else {
        return Ok(Some("no previous check recorded".to_string()));
    };
    let period = TimeDelta::from_std(period).context("interval out of range")?;
    if now - last_check > period {
        return Ok(Some(format!(
            "last check {} is older than {}h",
            last_check.to_rfc3339(),
            period.num_hours()
        )));
    }
    Ok(None)
}

/// Names of the non-hidden entries directly under `dir` (empty if missing).
pub fn list_dir(dir: &Path) -> Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !dir.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') {
            names.insert(name);
        }
    }
    Ok(names)
}

/// Relative path → modification time for every file under `dir`.
pub fn file_mtimes(dir: &Path) -> Result<BTreeMap<String, DateTime<Utc>>> {
    let mut mtimes = BTreeMap::new();
    if !dir.exists() {
        return Ok(mtimes);
    }
    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("strip prefix {}", dir.display()))?;
        mtimes.insert(
            rel.to_string_lossy().replace('\\', "/"),
            modified_time(entry.path())?,
        );
    }
    Ok(mtimes)
}

fn modified_time(path: &Path) -> Result<DateTime<Utc>> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("stat {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    fn setup() -> (tempfile::TempDir, DetectorCache) {
        let temp = tempfile::tempdir().expect("tempdir");
        let cache = DetectorCache::new(&temp.path().join(".cache"));
        (temp, cache)
    }

    /// Check, and record the state when stale as the run it triggers would.
    fn run_check(
        detector: &ChangeDetector,
        node: &str,
        cache: &DetectorCache,
        now: DateTime<Utc>,
    ) -> ChangeCheck {
        let detection = detector.check(node, cache, now).expect("check");
        if detection.check.needs_run {
            cache.store(node, &detection.state).expect("store");
        }
        detection.check
    }

    #[test]
    fn state_path_follows_layout() {
        let cache = DetectorCache::new(Path::new("/tmp/cache"));
        assert_eq!(
            cache.state_path("ynab_sync"),
            PathBuf::from("/tmp/cache/flow/ynab_sync_last_check.json")
        );
    }

    #[test]
    fn token_change_marks_stale_and_same_token_is_fresh() {
        let (temp, cache) = setup();
        let token_path = temp.path().join("knowledge");
        fs::write(&token_path, "100\n").expect("token");
        let detector = ChangeDetector::TokenComparison {
            source: TokenSource::File(token_path.clone()),
            refresh_interval: Duration::from_secs(24 * 3600),
        };
        let now = at("2026-03-01T08:00:00Z");

        let first = run_check(&detector, "sync", &cache, now);
        assert!(first.needs_run);

        let second = run_check(&detector, "sync", &cache, now);
        assert!(!second.needs_run);

        fs::write(&token_path, "101").expect("token");
        let third = run_check(&detector, "sync", &cache, now);
        assert_eq!(third.reasons, vec!["upstream token changed".to_string()]);
    }

    #[test]
    fn token_falls_back_to_refresh_interval() {
        let (temp, cache) = setup();
        let token_path = temp.path().join("knowledge");
        fs::write(&token_path, "7").expect("token");
        let detector = ChangeDetector::TokenComparison {
            source: TokenSource::File(token_path),
            refresh_interval: Duration::from_secs(24 * 3600),
        };

        run_check(&detector, "sync", &cache, at("2026-03-01T08:00:00Z"));
        let later = run_check(&detector, "sync", &cache, at("2026-03-02T09:00:00Z"));
        assert!(later.needs_run);
        assert!(later.reasons[0].contains("older than 24h"));
    }

    #[test]
    fn new_files_are_listed_as_reasons() {
        let (temp, cache) = setup();
        let inbox = temp.path().join("inbox");
        fs::create_dir_all(&inbox).expect("inbox");
        fs::write(inbox.join("a.zip"), "a").expect("a");
        let detector = ChangeDetector::NewFiles { dir: inbox.clone() };
        let now = at("2026-03-01T08:00:00Z");

        assert!(run_check(&detector, "unzip", &cache, now).needs_run);
        assert!(!run_check(&detector, "unzip", &cache, now).needs_run);

        fs::write(inbox.join("b.zip"), "b").expect("b");
        fs::write(inbox.join(".DS_Store"), "x").expect("hidden");
        let check = run_check(&detector, "unzip", &cache, now);
        assert_eq!(check.reasons, vec!["new file: b.zip".to_string()]);
    }

    #[test]
    fn freshness_compares_upstream_mtime_with_last_check() {
        let (temp, cache) = setup();
        let upstream = temp.path().join("transactions.json");
        fs::write(&upstream, "[]").expect("upstream");
        let detector = ChangeDetector::UpstreamFreshness {
            upstream: vec![upstream.clone()],
        };

        let first = run_check(&detector, "match", &cache, at("2000-01-01T00:00:00Z"));
        assert!(first.needs_run);

        // Upstream file was written long after the recorded check.
        let second = run_check(&detector, "match", &cache, at("2000-01-02T00:00:00Z"));
        assert!(second.needs_run);
        assert!(second.reasons[0].contains("transactions.json"));

        // Pretend the last check happened after the upstream write.
        let far_future = at("2999-01-01T00:00:00Z");
        cache
            .store(
                "match",
                &DetectorState {
                    last_check: Some(far_future),
                    ..DetectorState::default()
                },
            )
            .expect("store");
        let third = run_check(&detector, "match", &cache, far_future);
        assert!(!third.needs_run);
        let state = cache.load("match").expect("load").expect("state");
        assert_eq!(state.last_check, Some(far_future));
    }

    #[test]
    fn interval_detector_waits_for_period() {
        let (_temp, cache) = setup();
        let detector = ChangeDetector::FixedInterval {
            period: Duration::from_secs(30 * 24 * 3600),
        };
        assert!(run_check(&detector, "retirement", &cache, at("2026-01-01T00:00:00Z"))
            .needs_run);
        assert!(!run_check(&detector, "retirement", &cache, at("2026-01-20T00:00:00Z"))
            .needs_run);
        assert!(run_check(&detector, "retirement", &cache, at("2026-02-15T00:00:00Z"))
            .needs_run);
    }

    #[test]
    fn check_alone_leaves_the_change_pending() {
        let (temp, cache) = setup();
        let inbox = temp.path().join("inbox");
        fs::create_dir_all(&inbox).expect("inbox");
        fs::write(inbox.join("order.zip"), "zip").expect("zip");
        let unzip = NodeDetector::new(ChangeDetector::NewFiles { dir: inbox }, cache.clone());
        let now = at("2026-03-01T08:00:00Z");

        assert!(unzip.check("unzip", now).expect("check").needs_run);
        assert!(cache.load("unzip").expect("load").is_none());
        // A second plan before any run still sees the file as new.
        let again = unzip.check("unzip", now).expect("check");
        assert_eq!(again.reasons, vec!["new file: order.zip".to_string()]);
    }

    #[test]
    fn commit_records_the_checked_state_once() {
        let (temp, cache) = setup();
        let inbox = temp.path().join("inbox");
        fs::create_dir_all(&inbox).expect("inbox");
        fs::write(inbox.join("order.zip"), "zip").expect("zip");
        let unzip = NodeDetector::new(ChangeDetector::NewFiles { dir: inbox }, cache.clone());
        let now = at("2026-03-01T08:00:00Z");

        assert!(!unzip.commit("unzip").expect("commit without check"));
        assert!(unzip.check("unzip", now).expect("check").needs_run);
        assert!(unzip.commit("unzip").expect("commit"));
        assert!(!unzip.commit("unzip").expect("second commit"));

        let state = cache.load("unzip").expect("load").expect("state");
        assert_eq!(state.last_check, Some(now));
        assert!(!unzip.check("unzip", now).expect("check").needs_run);
    }

    #[test]
    fn missing_token_file_is_an_error() {
        let (temp, cache) = setup();
        let detector = ChangeDetector::TokenComparison {
            source: TokenSource::File(temp.path().join("missing-token")),
            refresh_interval: Duration::from_secs(60),
        };
        let err = detector
            .check("sync", &cache, Utc::now())
            .expect_err("missing token");
        assert!(format!("{err:#}").contains("missing-token"));
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let (_temp, cache) = setup();
        fs::create_dir_all(cache.dir()).expect("cache dir");
        fs::write(cache.state_path("sync"), "not json").expect("corrupt");
        let detector = ChangeDetector::FixedInterval {
            period: Duration::from_secs(60),
        };
        assert!(detector.check("sync", &cache, Utc::now()).is_err());
    }

    #[test]
    fn file_mtimes_lists_nested_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("nested")).expect("nested");
        fs::write(temp.path().join("a.json"), "{}").expect("a");
        fs::write(temp.path().join("nested/b.csv"), "x").expect("b");
        let mtimes = file_mtimes(temp.path()).expect("mtimes");
        let keys: Vec<&str> = mtimes.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["a.json", "nested/b.csv"]);
    }
}
