//! Input discovery: finding media artifacts under a path.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{Error, Result};

/// Extensions treated as media inputs when no filter is given.
pub const DEFAULT_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "avi", "webm", "flv", "ts"];

/// Discovery options.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Extension allow-list (lowercase, no dot); empty means defaults.
    pub extensions: Vec<String>,
    /// Stop after this many artifacts, if set.
    pub limit: Option<usize>,
}

/// Discover artifacts under `input`, sorted by path for deterministic
/// enqueue order. A single file is accepted as-is when its extension
/// matches.
pub fn scan_inputs(input: &Path, options: &ScanOptions) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(input)
        .map_err(|e| Error::config(format!("input path {} unusable: {}", input.display(), e)))?;

    let extensions: Vec<String> = if options.extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    } else {
        options.extensions.iter().map(|e| e.to_lowercase()).collect()
    };

    let mut found = Vec::new();
    if meta.is_file() {
        if matches_extension(input, &extensions) {
            found.push(input.to_path_buf());
        }
    } else {
        walk(input, options.recursive, &extensions, &mut found)?;
        found.sort();
    }

    if let Some(limit) = options.limit {
        found.truncate(limit);
    }

    debug!(input = %input.display(), count = found.len(), "scan complete");
    Ok(found)
}

fn walk(
    dir: &Path,
    recursive: bool,
    extensions: &[String],
    found: &mut Vec<PathBuf>,
) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            if recursive {
                walk(&path, recursive, extensions, found)?;
            }
        } else if file_type.is_file() && matches_extension(&path, extensions) {
            found.push(path);
        }
    }
    Ok(())
}

fn matches_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|allowed| allowed == &e.to_lowercase()))
        .unwrap_or(false)
}
