//! Deterministic walk of the watched tree.

use super::patterns::{to_forward_slashes, FilePattern};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A file seen during a walk. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedFile {
    /// Absolute path
    pub path: PathBuf,
    /// Path relative to the watched root, forward slashes
    pub relative_path: String,
    /// Milliseconds since the Unix epoch
    pub modified_ms: i64,
    pub len: u64,
}

impl WatchedFile {
    pub fn file_name(&self) -> &str {
        self.relative_path
            .rsplit('/')
            .next()
            .unwrap_or(self.relative_path.as_str())
    }

    pub fn is_hidden(&self) -> bool {
        self.file_name().starts_with('.')
    }
}

/// Statistics of one walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files_matched: usize,
    pub errors: usize,
    /// `false` when the visitor stopped the walk early
    pub completed: bool,
}

/// Walks the watched root in file-name order, yielding matching files.
#[derive(Debug, Clone)]
pub struct TreeWalker {
    root: PathBuf,
    pattern: FilePattern,
}

impl TreeWalker {
    pub fn new(root: impl Into<PathBuf>, pattern: FilePattern) -> Self {
        Self {
            root: root.into(),
            pattern,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Visit every matching file. The visitor returns `false` to stop.
    ///
    /// Unreadable entries are logged and skipped.
    pub fn walk<F>(&self, mut visit: F) -> WalkSummary
    where
        F: FnMut(WatchedFile) -> bool,
    {
        let mut summary = WalkSummary::default();

        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = %err, "Failed to read directory entry");
                    summary.errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            if !self.pattern.matches(relative) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(err) => {
                    // Usually removed between readdir and stat
                    debug!(path = %entry.path().display(), error = %err, "Skipping file");
                    continue;
                }
            };
            let modified_ms = match metadata.modified() {
                Ok(modified) => DateTime::<Utc>::from(modified).timestamp_millis(),
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "No modification time");
                    summary.errors += 1;
                    continue;
                }
            };

            summary.files_matched += 1;
            let file = WatchedFile {
                path: entry.path().to_path_buf(),
                relative_path: to_forward_slashes(relative),
                modified_ms,
                len: metadata.len(),
            };
            if !visit(file) {
                return summary;
            }
        }

        summary.completed = true;
        summary
    }

    /// Collect every matching file.
    pub fn snapshot(&self) -> Vec<WatchedFile> {
        let mut files = Vec::new();
        self.walk(|file| {
            files.push(file);
            true
        });
        files
    }
}
