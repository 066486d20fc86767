//! Flow configuration stored in `flow.toml`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "flow.toml";

/// Flow configuration (TOML).
///
/// Edited by humans. Missing fields default to values that work for a local
/// single-user setup. Relative paths are resolved against the directory that
/// holds the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FlowConfig {
    /// Root of the per-domain data folders.
    pub data_dir: PathBuf,

    /// Detector state lives under `<cache_dir>/flow`.
    pub cache_dir: PathBuf,

    /// Default matching confidence threshold in basis points.
    pub confidence_threshold_bp: u32,

    /// Wall-clock budget for a single command node, in seconds.
    pub command_timeout_secs: u64,

    /// Truncate captured command stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Default number of archives kept per domain by `flow cleanup`.
    pub archive_keep_count: usize,

    /// Domains archived together at the start of a full run.
    pub session_domains: Vec<String>,

    pub hash: HashConfig,

    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HashConfig {
    /// External whole-file hashing utility (e.g. `["sha256sum"]`).
    pub program: Vec<String>,
    /// Files per external invocation.
    pub batch_size: usize,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            program: vec!["sha256sum".to_string()],
            batch_size: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Wraps an external CLI tool.
    #[default]
    Command,
    /// Operator-performed step; execution only records instructions.
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Argv template (minijinja) for command nodes.
    #[serde(default)]
    pub command: Vec<String>,
    /// Working directory for the command; defaults to the config directory.
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Instructions shown for manual steps.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub detector: Option<DetectorConfig>,
}

/// Change-detection strategy selected per node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectorConfig {
    /// Compare an opaque upstream token with the cached one.
    Token {
        #[serde(default)]
        token_file: Option<PathBuf>,
        #[serde(default)]
        token_command: Option<Vec<String>>,
        #[serde(default = "default_refresh_hours")]
        refresh_hours: u64,
    },
    /// Stale when the directory holds entries not seen before.
    NewFiles { dir: PathBuf },
    /// Stale when any upstream file changed since the last check.
    Freshness { upstream: Vec<PathBuf> },
    /// Stale when the last check is older than `hours`.
    Interval { hours: u64 },
}

fn default_refresh_hours() -> u64 {
    24
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            cache_dir: PathBuf::from(".cache"),
            confidence_threshold_bp: 8_000,
            command_timeout_secs: 60 * 60,
            output_limit_bytes: 100_000,
            archive_keep_count: 20,
            session_domains: Vec::new(),
            hash: HashConfig::default(),
            nodes: Vec::new(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.confidence_threshold_bp > 10_000 {
            return Err(anyhow!("confidence_threshold_bp must be <= 10000"));
        }
        if self.hash.batch_size == 0 {
            return Err(anyhow!("hash.batch_size must be > 0"));
        }
        if self.hash.program.is_empty() || self.hash.program[0].trim().is_empty() {
            return Err(anyhow!("hash.program must be a non-empty array"));
        }

        let mut seen = BTreeSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.name.as_str()) {
                return Err(anyhow!("duplicate node name '{}'", node.name));
            }
        }
        Ok(())
    }

    /// Resolve every relative path against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.data_dir = resolve(base, &self.data_dir);
        self.cache_dir = resolve(base, &self.cache_dir);
        for node in &mut self.nodes {
            node.workdir = Some(match &node.workdir {
                Some(dir) => resolve(base, dir),
                None => base.to_path_buf(),
            });
            node.output_dir = node.output_dir.as_ref().map(|dir| resolve(base, dir));
            if let Some(detector) = &mut node.detector {
                detector.resolve_paths(base);
            }
        }
    }

    /// `<data_dir>/<domain>` for a session domain.
    pub fn domain_dir(&self, domain: &str) -> PathBuf {
        self.data_dir.join(domain)
    }
}

impl NodeConfig {
    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("node name must be non-empty"));
        }
        if self.depends_on.iter().any(|dep| dep == &self.name) {
            return Err(anyhow!("node '{}' depends on itself", self.name));
        }
        match self.kind {
            NodeKind::Command => {
                if self.command.is_empty() || self.command[0].trim().is_empty() {
                    return Err(anyhow!(
                        "node '{}': command must be a non-empty array",
                        self.name
                    ));
                }
            }
            NodeKind::Manual => {}
        }
        if let Some(detector) = &self.detector {
            detector
                .validate()
                .with_context(|| format!("node '{}' detector", self.name))?;
        }
        Ok(())
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        match self {
            DetectorConfig::Token {
                token_file,
                token_command,
                ..
            } => match (token_file, token_command) {
                (Some(_), None) => Ok(()),
                (None, Some(cmd)) if !cmd.is_empty() => Ok(()),
                _ => Err(anyhow!(
                    "token detector needs exactly one of token_file or a non-empty token_command"
                )),
            },
            DetectorConfig::NewFiles { .. } => Ok(()),
            DetectorConfig::Freshness { upstream } => {
                if upstream.is_empty() {
                    return Err(anyhow!("freshness detector needs at least one upstream file"));
                }
                Ok(())
            }
            DetectorConfig::Interval { hours } => {
                if *hours == 0 {
                    return Err(anyhow!("interval detector hours must be > 0"));
                }
                Ok(())
            }
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        match self {
            DetectorConfig::Token { token_file, .. } => {
                if let Some(path) = token_file {
                    *path = resolve(base, path);
                }
            }
            DetectorConfig::NewFiles { dir } => *dir = resolve(base, dir),
            DetectorConfig::Freshness { upstream } => {
                for path in upstream.iter_mut() {
                    *path = resolve(base, path);
                }
            }
            DetectorConfig::Interval { .. } => {}
        }
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Load config from a TOML file and resolve its relative paths.
///
/// If the file is missing, returns `FlowConfig::default()` rooted at the
/// file's directory.
pub fn load_config(path: &Path) -> Result<FlowConfig> {
    let base = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<FlowConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        FlowConfig::default()
    };
    cfg.validate()?;
    cfg.resolve_paths(&base);
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &FlowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
data_dir = "data"
session_domains = ["ynab", "amazon"]

[hash]
batch_size = 50

[[nodes]]
name = "ynab_sync"
command = ["ynab-sync", "--out", "{{ data_dir }}/ynab"]
output_dir = "data/ynab"
detector = { kind = "token", token_file = "data/ynab/.knowledge" }

[[nodes]]
name = "amazon_match"
depends_on = ["ynab_sync"]
command = ["amazon-match"]
output_dir = "data/amazon/matches"
detector = { kind = "freshness", upstream = ["data/ynab/transactions.json"] }

[[nodes]]
name = "retirement_update"
kind = "manual"
instructions = "Update balances"
detector = { kind = "interval", hours = 720 }
"#;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg.nodes, Vec::new());
        assert_eq!(cfg.data_dir, temp.path().join("data"));
        assert_eq!(cfg.hash, HashConfig::default());
    }

    #[test]
    fn parses_nodes_and_resolves_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flow.toml");
        fs::write(&path, SAMPLE).expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.nodes.len(), 3);
        assert_eq!(cfg.hash.batch_size, 50);
        assert_eq!(cfg.hash.program, vec!["sha256sum".to_string()]);

        let sync = &cfg.nodes[0];
        assert_eq!(sync.kind, NodeKind::Command);
        assert_eq!(sync.output_dir, Some(temp.path().join("data/ynab")));
        assert_eq!(sync.workdir, Some(temp.path().to_path_buf()));
        assert_eq!(
            sync.detector,
            Some(DetectorConfig::Token {
                token_file: Some(temp.path().join("data/ynab/.knowledge")),
                token_command: None,
                refresh_hours: 24,
            })
        );
        assert_eq!(cfg.nodes[2].kind, NodeKind::Manual);
    }

    #[test]
    fn rejects_duplicate_node_names() {
        let mut cfg = FlowConfig::default();
        let node = NodeConfig {
            name: "sync".to_string(),
            kind: NodeKind::Manual,
            description: String::new(),
            depends_on: Vec::new(),
            command: Vec::new(),
            workdir: None,
            output_dir: None,
            instructions: None,
            detector: None,
        };
        cfg.nodes = vec![node.clone(), node];
        let err = cfg.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate node name"));
    }

    #[test]
    fn rejects_command_node_without_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flow.toml");
        fs::write(&path, "[[nodes]]\nname = \"sync\"\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("command must be a non-empty array"));
    }

    #[test]
    fn rejects_token_detector_without_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flow.toml");
        fs::write(
            &path,
            "[[nodes]]\nname = \"sync\"\nkind = \"manual\"\ndetector = { kind = \"token\" }\n",
        )
        .expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("token detector"));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("flow.toml");
        let cfg = FlowConfig {
            session_domains: vec!["ynab".to_string()],
            ..FlowConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.session_domains, cfg.session_domains);
        assert_eq!(loaded.cache_dir, temp.path().join(".cache"));
    }
}
