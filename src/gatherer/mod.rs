// Module: Gatherer
// Walks target paths and yields ordered file records with char/line stats.

use anyhow::{Context as _, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Directories never worth sending to a model.
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", "vendor", "__pycache__"];

/// One context file, in prompt order.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub content: String,
    pub char_count: u64,
    pub line_count: u64,
}

/// Aggregate stats over the gathered set, for dry-run output.
#[derive(Debug, Default, Clone, Copy)]
pub struct GatherStats {
    pub file_count: usize,
    pub total_chars: u64,
    pub total_lines: u64,
}

/// Collects file records from the target paths, in the order given.
///
/// Directories are walked recursively with lexicographically sorted
/// entries so the record order is stable between runs. Hidden entries,
/// well-known build/VCS directories and non-UTF-8 (binary) files are
/// skipped silently.
pub fn gather_context(targets: &[PathBuf]) -> Result<Vec<FileRecord>> {
    let mut records = Vec::new();
    for target in targets {
        collect(target, &mut records)
            .with_context(|| format!("failed to gather context from {}", target.display()))?;
    }
    Ok(records)
}

/// Stats over a gathered set.
pub fn stats(records: &[FileRecord]) -> GatherStats {
    GatherStats {
        file_count: records.len(),
        total_chars: records.iter().map(|r| r.char_count).sum(),
        total_lines: records.iter().map(|r| r.line_count).sum(),
    }
}

fn collect(path: &Path, out: &mut Vec<FileRecord>) -> Result<()> {
    let meta = fs::metadata(path)
        .with_context(|| format!("cannot access target path {}", path.display()))?;

    if meta.is_file() {
        if let Some(record) = read_record(path) {
            out.push(record);
        }
        return Ok(());
    }

    let mut entries: Vec<PathBuf> = fs::read_dir(path)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    entries.sort();

    for entry in entries {
        let name = entry
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if name.starts_with('.') || SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }

        if entry.is_dir() {
            collect(&entry, out)?;
        } else if let Some(record) = read_record(&entry) {
            out.push(record);
        }
    }

    Ok(())
}

/// Reads a file as UTF-8. Returns None for binary or unreadable files.
fn read_record(path: &Path) -> Option<FileRecord> {
    let content = fs::read_to_string(path).ok()?;
    if content.contains('\u{0}') {
        return None;
    }
    Some(FileRecord {
        char_count: content.chars().count() as u64,
        line_count: content.lines().count() as u64,
        content,
        path: path.to_path_buf(),
    })
}
