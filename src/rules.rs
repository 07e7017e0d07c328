//! Per-app reload rules compiled from the `.watch` pattern file.
//!
//! The pattern set is inverted relative to an ignore file: a change
//! *matching* the set is what triggers a reload. Paths with a dot-prefixed
//! component never match unless a pattern names the dot component literally.

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Dotfiles are excluded by default; `*` crosses directory separators so
/// `src/*` covers the whole subtree, the way ignore-file globs behave.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: true,
};

/// Compiled reload rules for one app directory.
#[derive(Debug)]
pub struct ReloadRules {
    dir: PathBuf,
    watch_file: PathBuf,
    patterns: Vec<Pattern>,
}

impl ReloadRules {
    /// Load and compile `dir/.watch`. A missing or empty file means the app
    /// never reloads on file events.
    pub async fn load(dir: &Path) -> Self {
        let watch_file = dir.join(".watch");
        let patterns = match tokio::fs::read_to_string(&watch_file).await {
            Ok(contents) => compile(&contents),
            Err(_) => Vec::new(),
        };
        Self {
            dir: dir.to_path_buf(),
            watch_file,
            patterns,
        }
    }

    #[cfg(test)]
    fn from_patterns(dir: &Path, lines: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            watch_file: dir.join(".watch"),
            patterns: compile(lines),
        }
    }

    /// Path of the `.watch` file these rules were loaded from.
    pub fn watch_file(&self) -> &Path {
        &self.watch_file
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether an event at `path` must stop the app.
    ///
    /// The `.watch` file itself always triggers so edits to the rules take
    /// effect on the next launch.
    pub fn triggers_reload(&self, path: &Path) -> bool {
        if path == self.watch_file {
            return true;
        }
        self.matches(path)
    }

    /// Whether `path` (absolute, inside the app directory) matches the
    /// pattern set.
    pub fn matches(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.dir) else {
            return false;
        };
        let rel = rel.to_string_lossy();
        self.patterns
            .iter()
            .any(|p| p.matches_with(&rel, MATCH_OPTIONS))
    }
}

fn compile(contents: &str) -> Vec<Pattern> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match Pattern::new(line) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = line, error = %e, "skipping unparseable watch pattern");
                None
            }
        })
        .collect()
}
