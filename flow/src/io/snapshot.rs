//! Uncompressed per-node snapshots taken around a node's execution.
//!
//! Layout: `<output_dir>/archive/<YYYYMMDD_HHMMSS>_pre[_N]/` and `..._post[_N]/`.
//! The snapshot copies everything in the output directory except `archive/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Name of the subdirectory that holds snapshots (and domain archives).
pub const ARCHIVE_DIR_NAME: &str = "archive";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPhase {
    Pre,
    Post,
}

impl SnapshotPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotPhase::Pre => "pre",
            SnapshotPhase::Post => "post",
        }
    }
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// True when `dir` exists and holds at least one entry besides `archive/`.
pub fn has_content(dir: &Path) -> Result<bool> {
    if !dir.is_dir() {
        return Ok(false);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.context("read entry")?;
        if entry.file_name() != ARCHIVE_DIR_NAME {
            return Ok(true);
        }
    }
    Ok(false)
}

/// First free snapshot path for `phase` at `now`, appending `_1`, `_2`, ...
/// when a snapshot from the same second already exists.
pub fn snapshot_path(output_dir: &Path, phase: SnapshotPhase, now: DateTime<Utc>) -> PathBuf {
    let archive_dir = output_dir.join(ARCHIVE_DIR_NAME);
    let base = format!("{}_{}", now.format("%Y%m%d_%H%M%S"), phase.as_str());
    let mut candidate = archive_dir.join(&base);
    let mut suffix = 1u32;
    while candidate.exists() {
        candidate = archive_dir.join(format!("{base}_{suffix}"));
        suffix += 1;
    }
    candidate
}

/// Copy `output_dir` (minus `archive/`) into a fresh snapshot directory.
///
/// A partially written snapshot is removed before the error is returned.
pub fn create_snapshot(
    output_dir: &Path,
    phase: SnapshotPhase,
    now: DateTime<Utc>,
) -> Result<PathBuf> {
    let target = snapshot_path(output_dir, phase, now);
    let copied = copy_contents(output_dir, &target);
    if let Err(err) = copied {
        if target.exists() {
            let _ = fs::remove_dir_all(&target);
        }
        return Err(err.context(format!("{phase} snapshot of {}", output_dir.display())));
    }
    info!(snapshot = %target.display(), %phase, "snapshot created");
    Ok(target)
}

/// Copy regular files and directories. Symlinks are never followed or
/// copied, so a link back to an ancestor cannot recurse.
fn copy_contents(output_dir: &Path, target: &Path) -> Result<()> {
    if !output_dir.is_dir() {
        return Err(anyhow!("missing {}", output_dir.display()));
    }
    fs::create_dir_all(target).with_context(|| format!("create {}", target.display()))?;
    let walker = walkdir::WalkDir::new(output_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !(entry.depth() == 1 && entry.file_name() == ARCHIVE_DIR_NAME));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", output_dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(output_dir)
            .with_context(|| format!("strip prefix {}", output_dir.display()))?;
        let dest = target.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dest)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        } else {
            warn!(path = %entry.path().display(), "not a regular file, left out of snapshot");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-04-02T13:45:07Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn empty_or_archive_only_dir_has_no_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!has_content(&temp.path().join("missing")).expect("missing"));
        assert!(!has_content(temp.path()).expect("empty"));
        fs::create_dir_all(temp.path().join(ARCHIVE_DIR_NAME)).expect("archive");
        assert!(!has_content(temp.path()).expect("archive only"));
        fs::write(temp.path().join("a.json"), "[]").expect("write");
        assert!(has_content(temp.path()).expect("content"));
    }

    #[test]
    fn snapshot_copies_tree_without_archive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path();
        fs::create_dir_all(out.join("nested")).expect("nested");
        fs::write(out.join("a.json"), "[1]").expect("a");
        fs::write(out.join("nested/b.csv"), "x\n").expect("b");

        let first = create_snapshot(out, SnapshotPhase::Pre, ts()).expect("snapshot");
        assert_eq!(first, out.join("archive/20260402_134507_pre"));
        assert_eq!(fs::read_to_string(first.join("a.json")).expect("read"), "[1]");
        assert_eq!(
            fs::read_to_string(first.join("nested/b.csv")).expect("read"),
            "x\n"
        );

        // The second snapshot must not recurse into the first.
        let second = create_snapshot(out, SnapshotPhase::Post, ts()).expect("snapshot");
        assert_eq!(second, out.join("archive/20260402_134507_post"));
        assert!(!second.join(ARCHIVE_DIR_NAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_left_out_of_snapshots() {
        use std::os::unix::fs::symlink;

        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("ynab");
        fs::create_dir_all(out.join("nested")).expect("nested");
        fs::write(out.join("a.json"), "[1]").expect("a");
        symlink(&out, out.join("nested/loop")).expect("ancestor link");
        symlink(out.join("a.json"), out.join("alias.json")).expect("file link");

        let snapshot = create_snapshot(&out, SnapshotPhase::Pre, ts()).expect("snapshot");
        assert_eq!(fs::read_to_string(snapshot.join("a.json")).expect("read"), "[1]");
        assert!(snapshot.join("nested").is_dir());
        assert!(fs::symlink_metadata(snapshot.join("nested/loop")).is_err());
        assert!(fs::symlink_metadata(snapshot.join("alias.json")).is_err());
    }

    #[test]
    fn same_second_collisions_get_numeric_suffix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path();
        fs::write(out.join("a.json"), "[]").expect("a");

        let first = create_snapshot(out, SnapshotPhase::Pre, ts()).expect("first");
        let second = create_snapshot(out, SnapshotPhase::Pre, ts()).expect("second");
        let third = create_snapshot(out, SnapshotPhase::Pre, ts()).expect("third");
        assert_eq!(first.file_name().expect("name"), "20260402_134507_pre");
        assert_eq!(second.file_name().expect("name"), "20260402_134507_pre_1");
        assert_eq!(third.file_name().expect("name"), "20260402_134507_pre_2");
    }

    #[test]
    fn snapshot_of_missing_dir_fails_and_leaves_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("gone");
        let err = create_snapshot(&out, SnapshotPhase::Pre, ts()).expect_err("missing");
        assert!(format!("{err:#}").contains("pre snapshot"));
        assert!(!out.join(ARCHIVE_DIR_NAME).exists());
    }
}
