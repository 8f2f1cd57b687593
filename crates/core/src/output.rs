//! Discovery and cleanup of artifacts in the pipeline's output directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// First regular file (by name) matching `<prefix>_*.<extension>` in `dir`.
///
/// A missing directory yields `Ok(None)`: the pipeline simply produced nothing.
pub fn find_artifact(dir: &Path, prefix: &str, extension: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read output directory: {}", dir.display()))
        }
    };

    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("failed to read entry in output directory: {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if matches_artifact_name(name, prefix, extension) {
            matches.push(path);
        }
    }

    matches.sort();
    debug!(
        dir = %dir.display(),
        prefix,
        extension,
        candidates = matches.len(),
        "scanned output directory"
    );
    Ok(matches.into_iter().next())
}

fn matches_artifact_name(name: &str, prefix: &str, extension: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix).and_then(|r| r.strip_prefix('_')) else {
        return false;
    };
    // `prefix_.webp` is still a match, same as a `prefix_*.webp` glob.
    rest.strip_suffix(extension)
        .and_then(|r| r.strip_suffix('.'))
        .is_some()
}

/// Remove every regular file in `dir`. Failures are logged and skipped; a
/// missing directory is not an error. Returns how many files were removed.
pub fn clear_directory(dir: &Path) -> usize {
    info!(dir = %dir.display(), "Cleaning up directory");

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return 0,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to list directory for cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!(path = %path.display(), "Removed file");
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to remove file");
            }
        }
    }
    removed
}
