//! Scan a node's output directory into an [`OutputInfo`].

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::warn;

use crate::core::node::{OutputFile, OutputInfo};
use crate::io::snapshot::ARCHIVE_DIR_NAME;

/// List output files under `dir` (skipping `archive/` and hidden entries)
/// with their record counts. A missing directory yields no files.
pub fn scan_output_dir(dir: &Path) -> Result<OutputInfo> {
    let mut files = Vec::new();
    if !dir.is_dir() {
        return Ok(OutputInfo::from_files(files));
    }
    let walker = walkdir::WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0
                || !(name.starts_with('.') || (entry.depth() == 1 && name == ARCHIVE_DIR_NAME))
        });
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let modified = entry
            .metadata()
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from);
        files.push(OutputFile {
            path: path.to_path_buf(),
            record_count: count_records(path),
            modified,
        });
    }
    Ok(OutputInfo::from_files(files))
}

/// Best-effort record count; unreadable or unparseable data counts as zero
/// records. Bytes are never decoded as text, so non-UTF-8 exports still count.
pub fn count_records(path: &Path) -> u64 {
    let ext = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    if !matches!(ext.as_str(), "json" | "csv" | "tsv") {
        return 0;
    }
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot read output file, counting 0 records");
            return 0;
        }
    };
    if ext == "json" {
        return serde_json::from_slice::<Value>(&raw)
            .map(|value| json_records(&value))
            .unwrap_or(0);
    }
    let lines = raw
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.trim_ascii().is_empty())
        .count() as u64;
    // First line is the header.
    lines.saturating_sub(1)
}

fn json_records(value: &Value) -> u64 {
    match value {
        Value::Array(items) => items.len() as u64,
        Value::Object(map) => map
            .values()
            .find_map(|field| field.as_array().map(|items| items.len() as u64))
            .unwrap_or(1),
        _ => 0,
    }
}
