//! Compressed, sequence-numbered domain archives and multi-domain sessions.
//!
//! Each domain owns `<data_dir>/<domain>/archive/`. An archive is
//! `<YYYY-MM-DD>-<NNN>.tar.gz` (UTC date, 3-digit sequence starting at 001)
//! with a sibling `<YYYY-MM-DD>-<NNN>.json` manifest. Archives are append-only;
//! only [`DomainArchiver::cleanup_old_archives`] ever removes them.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::run_log::timestamped_id;
use crate::io::snapshot::ARCHIVE_DIR_NAME;

/// Extensions (lowercase, no dot) of structured data and chart files.
pub const ARCHIVABLE_EXTENSIONS: &[&str] = &[
    "json", "yaml", "yml", "csv", "tsv", "txt", "png", "svg", "html",
];

const EXCLUDED_FILE_NAMES: &[&str] = &[".DS_Store", "Thumbs.db"];
const EXCLUDED_EXTENSIONS: &[&str] = &["tmp", "log", "swp"];
const SESSIONS_DIR_NAME: &str = ".archive_sessions";

static ARCHIVE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})-(\d{3,})\.tar\.gz$").expect("archive name pattern")
});

/// Metadata written next to every archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub archive_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub trigger_reason: String,
    pub domains: Vec<String>,
    pub file_count: usize,
    /// Size of the compressed archive on disk.
    pub size_bytes: u64,
    pub sequence: u32,
    /// Domain-relative paths stored in the archive.
    pub files: Vec<String>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
}

/// Parse `YYYY-MM-DD-NNN.tar.gz` into its date and sequence.
pub fn parse_archive_name(name: &str) -> Option<(NaiveDate, u32)> {
    let caps = ARCHIVE_NAME_RE.captures(name)?;
    let date = NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()?;
    let sequence = caps.get(2)?.as_str().parse().ok()?;
    Some((date, sequence))
}

fn archive_stem(date: NaiveDate, sequence: u32) -> String {
    format!("{}-{sequence:03}", date.format("%Y-%m-%d"))
}

fn is_archivable(rel: &Path) -> bool {
    let hidden = rel
        .components()
        .any(|part| part.as_os_str().to_string_lossy().starts_with('.'));
    if hidden {
        return false;
    }
    let Some(name) = rel.file_name().map(|name| name.to_string_lossy()) else {
        return false;
    };
    if EXCLUDED_FILE_NAMES.contains(&name.as_ref()) || name.ends_with('~') {
        return false;
    }
    let Some(ext) = rel
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    else {
        return false;
    };
    !EXCLUDED_EXTENSIONS.contains(&ext.as_str()) && ARCHIVABLE_EXTENSIONS.contains(&ext.as_str())
}

/// Archives one domain's data folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainArchiver {
    domain: String,
    root: PathBuf,
}

impl DomainArchiver {
    pub fn new(domain: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            domain: domain.into(),
            root: root.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR_NAME)
    }

    /// Sorted domain-relative paths of files eligible for archiving.
    pub fn get_archivable_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.root.is_dir() {
            return Ok(files);
        }
        let walker = walkdir::WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                !(entry.depth() == 1 && entry.file_name() == ARCHIVE_DIR_NAME)
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", self.root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .with_context(|| format!("strip prefix {}", self.root.display()))?;
            if is_archivable(rel) {
                files.push(rel.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// `max(existing sequence for date) + 1`, or 1 when there is none.
    pub fn next_sequence(&self, date: NaiveDate) -> Result<u32> {
        let dir = self.archive_dir();
        if !dir.is_dir() {
            return Ok(1);
        }
        let mut max = 0u32;
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.context("read entry")?;
            let name = entry.file_name();
            if let Some((archive_date, sequence)) = parse_archive_name(&name.to_string_lossy())
                && archive_date == date
            {
                max = max.max(sequence);
            }
        }
        max.checked_add(1).ok_or_else(|| {
            anyhow!(
                "archive sequence for {date} is exhausted in {}",
                dir.display()
            )
        })
    }

    pub fn create_archive(
        &self,
        trigger_reason: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<Option<ArchiveManifest>> {
        self.create_archive_at(trigger_reason, context, Utc::now())
    }

    /// Archive every archivable file as of `now`.
    ///
    /// Returns `Ok(None)` and writes nothing when there are no archivable
    /// files. On failure the partial archive and manifest are removed.
    #[instrument(skip_all, fields(domain = %self.domain))]
    pub fn create_archive_at(
        &self,
        trigger_reason: &str,
        context: &BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Option<ArchiveManifest>> {
        let files = self.get_archivable_files()?;
        if files.is_empty() {
            debug!("nothing to archive");
            return Ok(None);
        }

        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir)
            .with_context(|| format!("create directory {}", archive_dir.display()))?;

        let date = now.date_naive();
        let sequence = self.next_sequence(date)?;
        let stem = archive_stem(date, sequence);
        let archive_path = archive_dir.join(format!("{stem}.tar.gz"));
        let manifest_path = archive_dir.join(format!("{stem}.json"));

        let written = self
            .write_tarball(&archive_path, &files)
            .and_then(|size_bytes| {
                let manifest = ArchiveManifest {
                    archive_path: archive_path.clone(),
                    created_at: now,
                    trigger_reason: trigger_reason.to_string(),
                    domains: vec![self.domain.clone()],
                    file_count: files.len(),
                    size_bytes,
                    sequence,
                    files: files
                        .iter()
                        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
                        .collect(),
                    context: context.clone(),
                };
                write_json_atomic(&manifest_path, &manifest)?;
                Ok(manifest)
            });

        match written {
            Ok(manifest) => {
                info!(
                    archive = %archive_path.display(),
                    files = manifest.file_count,
                    bytes = manifest.size_bytes,
                    "archive created"
                );
                Ok(Some(manifest))
            }
            Err(err) => {
                for partial in [&archive_path, &manifest_path] {
                    if partial.exists() {
                        let _ = fs::remove_file(partial);
                    }
                }
                Err(err.context(format!("archive domain '{}'", self.domain)))
            }
        }
    }

    fn write_tarball(&self, archive_path: &Path, files: &[PathBuf]) -> Result<u64> {
        let file = File::create(archive_path)
            .with_context(|| format!("create {}", archive_path.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for rel in files {
            builder
                .append_path_with_name(self.root.join(rel), rel)
                .with_context(|| format!("add {} to archive", rel.display()))?;
        }
        let encoder = builder.into_inner().context("finish tar stream")?;
        let file = encoder.finish().context("finish gzip stream")?;
        file.sync_all()
            .with_context(|| format!("sync {}", archive_path.display()))?;
        let size = fs::metadata(archive_path)
            .with_context(|| format!("stat {}", archive_path.display()))?
            .len();
        Ok(size)
    }

    /// Manifests of existing archives, newest first.
    pub fn list_archives(&self) -> Result<Vec<ArchiveManifest>> {
        let mut manifests = Vec::new();
        for (archive_path, _) in self.archive_files()? {
            let manifest_path = manifest_path_for(&archive_path);
            if !manifest_path.exists() {
                warn!(archive = %archive_path.display(), "archive has no manifest");
                continue;
            }
            let raw = fs::read_to_string(&manifest_path)
                .with_context(|| format!("read {}", manifest_path.display()))?;
            let manifest: ArchiveManifest = serde_json::from_str(&raw)
                .with_context(|| format!("parse manifest {}", manifest_path.display()))?;
            manifests.push(manifest);
        }
        manifests.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        Ok(manifests)
    }

    /// Delete archives (and manifests) beyond the `keep_count` most recently
    /// modified. Returns the removed archive paths.
    pub fn cleanup_old_archives(&self, keep_count: usize) -> Result<Vec<PathBuf>> {
        let mut archives = self.archive_files()?;
        archives.sort_by(|(a_path, a_time), (b_path, b_time)| {
            b_time.cmp(a_time).then_with(|| b_path.cmp(a_path))
        });

        let mut removed = Vec::new();
        for (archive_path, _) in archives.into_iter().skip(keep_count) {
            fs::remove_file(&archive_path)
                .with_context(|| format!("remove {}", archive_path.display()))?;
            let manifest_path = manifest_path_for(&archive_path);
            if manifest_path.exists() {
                fs::remove_file(&manifest_path)
                    .with_context(|| format!("remove {}", manifest_path.display()))?;
            }
            info!(archive = %archive_path.display(), "old archive removed");
            removed.push(archive_path);
        }
        Ok(removed)
    }

    fn archive_files(&self) -> Result<Vec<(PathBuf, std::time::SystemTime)>> {
        let dir = self.archive_dir();
        let mut archives = Vec::new();
        if !dir.is_dir() {
            return Ok(archives);
        }
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.context("read entry")?;
            if parse_archive_name(&entry.file_name().to_string_lossy()).is_none() {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .with_context(|| format!("stat {}", entry.path().display()))?;
            archives.push((entry.path(), modified));
        }
        Ok(archives)
    }
}

fn manifest_path_for(archive_path: &Path) -> PathBuf {
    let name = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".tar.gz").unwrap_or(&name);
    archive_path.with_file_name(format!("{stem}.json"))
}

/// One invocation's archives across several domains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub trigger_reason: String,
    pub archives: Vec<ArchiveManifest>,
    pub total_files: usize,
    pub total_bytes: u64,
    /// Domains that had nothing to archive.
    #[serde(default)]
    pub skipped_domains: Vec<String>,
}

impl ArchiveSession {
    /// Domain → archive path, for [`FlowContext::archives`](crate::core::types::FlowContext).
    pub fn archive_paths(&self) -> BTreeMap<String, PathBuf> {
        self.archives
            .iter()
            .flat_map(|manifest| {
                manifest
                    .domains
                    .iter()
                    .map(|domain| (domain.clone(), manifest.archive_path.clone()))
            })
            .collect()
    }
}

/// Coordinates archivers for the domains under `data_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManager {
    data_dir: PathBuf,
}

impl ArchiveManager {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn archiver(&self, domain: &str) -> DomainArchiver {
        DomainArchiver::new(domain, self.data_dir.join(domain))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join(SESSIONS_DIR_NAME)
    }

    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{session_id}.json"))
    }

    /// Archive every domain in `domains` and save the session manifest.
    ///
    /// Fails on the first domain that cannot be archived; archives already
    /// written for earlier domains are kept.
    #[instrument(skip_all, fields(domains = domains.len()))]
    pub fn create_session(
        &self,
        domains: &[String],
        trigger_reason: &str,
        context: &BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<ArchiveSession> {
        let mut session = ArchiveSession {
            session_id: timestamped_id(now),
            created_at: now,
            trigger_reason: trigger_reason.to_string(),
            archives: Vec::new(),
            total_files: 0,
            total_bytes: 0,
            skipped_domains: Vec::new(),
        };

        for domain in domains {
            if domain.trim().is_empty() || domain.contains(['/', '\\']) || domain == ".." {
                bail!("invalid domain name '{domain}'");
            }
            match self
                .archiver(domain)
                .create_archive_at(trigger_reason, context, now)?
            {
                Some(manifest) => {
                    session.total_files += manifest.file_count;
                    session.total_bytes += manifest.size_bytes;
                    session.archives.push(manifest);
                }
                None => session.skipped_domains.push(domain.clone()),
            }
        }

        write_json_atomic(&self.session_path(&session.session_id), &session)?;
        info!(
            session = %session.session_id,
            archives = session.archives.len(),
            files = session.total_files,
            "archive session saved"
        );
        Ok(session)
    }

    pub fn load_session(&self, session_id: &str) -> Result<ArchiveSession> {
        let path = self.session_path(session_id);
        let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse session {}", path.display()))
    }

    pub fn cleanup_old_archives(&self, domain: &str, keep_count: usize) -> Result<Vec<PathBuf>> {
        self.archiver(domain).cleanup_old_archives(keep_count)
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
