//! Directory content hashing for pre/post snapshot decisions.
//!
//! The combined hash covers every regular file under a directory except the
//! top-level `archive/` subtree. Each file contributes its relative path and
//! the hex SHA-256 of its bytes, in sorted path order, so renaming a file
//! changes the hash even when the content does not.
//!
//! Two strategies produce identical hashes: [`ExternalHasher`] shells out to a
//! whole-file hashing tool in batches, [`InProcessHasher`] reads the files
//! itself. [`FallbackHasher`] tries the first and falls back to the second.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::io::config::HashConfig;
use crate::io::process::{RunLimits, run_captured};
use crate::io::snapshot::ARCHIVE_DIR_NAME;

const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(600);
const EXTERNAL_OUTPUT_LIMIT_BYTES: usize = 16 * 1024 * 1024;

/// Computes a deterministic content hash for a directory.
pub trait DirectoryHasher {
    fn hash_dir(&self, dir: &Path) -> Result<String>;
}

/// Sorted relative paths (with `/` separators) of the files that take part
/// in the hash. Missing directories have no files.
pub fn hashable_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    let walker = walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == ARCHIVE_DIR_NAME));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("strip prefix {}", dir.display()))?;
        files.push(rel.to_string_lossy().replace('\\', "/"));
    }
    files.sort();
    Ok(files)
}

/// Fold `(relative path, hex digest)` pairs into one hex hash.
fn combine(digests: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, digest) in digests {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(digest.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Reads and hashes every file in-process.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessHasher;

impl DirectoryHasher for InProcessHasher {
    fn hash_dir(&self, dir: &Path) -> Result<String> {
        let mut digests = BTreeMap::new();
        for rel in hashable_files(dir)? {
            let digest = file_sha256(&dir.join(&rel))?;
            digests.insert(rel, digest);
        }
        Ok(combine(&digests))
    }
}

/// Runs an external `sha256sum`-compatible tool over fixed-size batches of
/// files, with the directory as working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalHasher {
    program: Vec<String>,
    batch_size: usize,
}

impl ExternalHasher {
    pub fn new(program: Vec<String>, batch_size: usize) -> Self {
        Self {
            program,
            batch_size: batch_size.max(1),
        }
    }

    fn hash_batch(&self, dir: &Path, batch: &[String]) -> Result<BTreeMap<String, String>> {
        let (program, args) = self
            .program
            .split_first()
            .ok_or_else(|| anyhow!("hash program is empty"))?;
        let mut cmd = std::process::Command::new(program);
        cmd.args(args).args(batch).current_dir(dir);

        let output = run_captured(
            cmd,
            RunLimits::new(EXTERNAL_TIMEOUT, EXTERNAL_OUTPUT_LIMIT_BYTES),
        )?;
        if !output.succeeded() {
            bail!(output.failure_message(program));
        }
        if output.stdout.was_truncated() {
            bail!("{program} output exceeded {EXTERNAL_OUTPUT_LIMIT_BYTES} bytes");
        }

        let parsed = parse_checksum_lines(&output.stdout_text())?;
        let mut digests = BTreeMap::new();
        for rel in batch {
            let digest = parsed
                .get(rel)
                .ok_or_else(|| anyhow!("{program} did not report {rel}"))?;
            digests.insert(rel.clone(), digest.clone());
        }
        Ok(digests)
    }
}

impl DirectoryHasher for ExternalHasher {
    fn hash_dir(&self, dir: &Path) -> Result<String> {
        let files = hashable_files(dir)?;
        let mut digests = BTreeMap::new();
        for batch in files.chunks(self.batch_size) {
            digests.extend(self.hash_batch(dir, batch)?);
        }
        debug!(dir = %dir.display(), files = files.len(), "hashed directory externally");
        Ok(combine(&digests))
    }
}

/// Parse `<hex>  <path>` / `<hex> *<path>` lines into path → lowercase hex.
fn parse_checksum_lines(stdout: &str) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for line in stdout.lines().filter(|line| !line.trim().is_empty()) {
        // GNU coreutils prefixes lines for names with special characters
        // with a backslash and escapes the name.
        if line.starts_with('\\') {
            bail!("escaped checksum line not supported: {line}");
        }
        let (digest, rest) = line
            .split_once(' ')
            .ok_or_else(|| anyhow!("malformed checksum line: {line}"))?;
        let path = rest
            .strip_prefix(' ')
            .or_else(|| rest.strip_prefix('*'))
            .ok_or_else(|| anyhow!("malformed checksum line: {line}"))?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("malformed digest in checksum line: {line}");
        }
        parsed.insert(path.to_string(), digest.to_ascii_lowercase());
    }
    Ok(parsed)
}

/// Try `primary`; on any error log it and use `fallback`.
#[derive(Debug, Clone)]
pub struct FallbackHasher<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackHasher<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

impl<P: DirectoryHasher, F: DirectoryHasher> DirectoryHasher for FallbackHasher<P, F> {
    fn hash_dir(&self, dir: &Path) -> Result<String> {
        match self.primary.hash_dir(dir) {
            Ok(hash) => Ok(hash),
            Err(err) => {
                warn!(dir = %dir.display(), err = %format!("{err:#}"), "external hashing failed, hashing in-process");
                self.fallback.hash_dir(dir)
            }
        }
    }
}

/// Hasher for the configured external program with in-process fallback.
pub fn configured_hasher(config: &HashConfig) -> FallbackHasher<ExternalHasher, InProcessHasher> {
    FallbackHasher::new(
        ExternalHasher::new(config.program.clone(), config.batch_size),
        InProcessHasher,
    )
}
