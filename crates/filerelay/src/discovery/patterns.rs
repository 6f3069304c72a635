//! Glob pattern normalization and matching for watched files.

use crate::error::{RelayError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

/// Normalize a glob pattern for matching against paths relative to the
/// watched root.
///
/// Rules:
/// - Empty or "*" becomes "**/*" (match all)
/// - Leading slashes are stripped (relative matching)
/// - Patterns without a path separator get "**/" prefix
pub fn normalize_glob_pattern(raw: &str) -> String {
    let mut pattern = raw.trim().trim_start_matches('/').to_string();

    if pattern.is_empty() || pattern == "*" {
        pattern = "**/*".to_string();
    }

    if !pattern.contains('/') && !pattern.starts_with("**/") && pattern != "**/*" {
        pattern = format!("**/{}", pattern);
    }

    pattern
}

/// Render a relative path with forward slashes on every platform.
pub fn to_forward_slashes(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Compiled file pattern. Matching is case-sensitive.
#[derive(Debug, Clone)]
pub struct FilePattern {
    raw: String,
    matcher: GlobMatcher,
}

impl FilePattern {
    pub fn new(raw: &str) -> Result<Self> {
        let normalized = normalize_glob_pattern(raw);
        let matcher = GlobBuilder::new(&normalized)
            .literal_separator(false)
            .build()
            .map(|g| g.compile_matcher())
            .map_err(|e| RelayError::Pattern(format!("'{}': {}", raw, e)))?;
        Ok(Self {
            raw: raw.to_string(),
            matcher,
        })
    }

    /// The pattern as configured.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Match a path relative to the watched root.
    pub fn matches(&self, relative: &Path) -> bool {
        let candidate = to_forward_slashes(relative);
        self.matcher.is_match(candidate.trim_start_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_basics() {
        assert_eq!(normalize_glob_pattern(""), "**/*");
        assert_eq!(normalize_glob_pattern("*"), "**/*");
        assert_eq!(normalize_glob_pattern("app.log"), "**/app.log");
        assert_eq!(normalize_glob_pattern("logs/*.gz"), "logs/*.gz");
        assert_eq!(normalize_glob_pattern("/logs/*.gz"), "logs/*.gz");
    }

    #[test]
    fn matches_relative_paths() {
        let gz = FilePattern::new("*.gz").unwrap();
        assert!(gz.matches(Path::new("archive.2024-03-01_10-00.gz")));
        assert!(gz.matches(Path::new("nested/deep/archive.gz")));
        assert!(!gz.matches(Path::new("archive.log")));

        let scoped = FilePattern::new("logs/*.gz").unwrap();
        assert!(scoped.matches(Path::new("logs/a.gz")));
        assert!(!scoped.matches(Path::new("other/a.gz")));

        let all = FilePattern::new("*").unwrap();
        assert!(all.matches(Path::new("a/b/c.bin")));
    }

    #[test]
    fn matching_is_case_sensitive() {
        let gz = FilePattern::new("*.gz").unwrap();
        assert!(!gz.matches(Path::new("archive.GZ")));

        let named = FilePattern::new("App.log").unwrap();
        assert!(named.matches(Path::new("sub/App.log")));
        assert!(!named.matches(Path::new("sub/app.log")));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = FilePattern::new("logs/[.gz").unwrap_err();
        assert!(matches!(err, RelayError::Pattern(_)));
    }
}
