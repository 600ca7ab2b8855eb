//! Ignore rules for the backup walk
//!
//! Patterns use gitignore syntax and are evaluated relative to the source
//! root. An absolute pattern that points inside the root is accepted and
//! anchored at the root, so `/srv/data/cache` with root `/srv` behaves like
//! `/data/cache`. Excluded paths are pruned by prefix and never reach the
//! pattern matcher.

use crate::error::{Result, StrataError};
use ignore::overrides::{Override, OverrideBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Compiled ignore patterns plus hard path exclusions
#[derive(Debug)]
pub struct IgnoreRules {
    root: PathBuf,
    overrides: Override,
    excluded: Vec<PathBuf>,
    patterns: usize,
}

impl IgnoreRules {
    /// Compile `patterns` for a walk of `root`
    ///
    /// # Errors
    ///
    /// [`StrataError::InvalidPattern`] if a pattern does not compile.
    pub fn new(root: &Path, patterns: &[String]) -> Result<Self> {
        let mut builder = OverrideBuilder::new(root);
        let mut count = 0;

        for pattern in patterns {
            let Some(normalized) = normalize_pattern(root, pattern) else {
                warn!("Ignore pattern {:?} lies outside {:?}, dropping it", pattern, root);
                continue;
            };
            // Override globs select files; a leading '!' turns one into an ignore
            builder
                .add(&format!("!{}", normalized))
                .map_err(|e| StrataError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            count += 1;
        }

        let overrides = builder
            .build()
            .map_err(|e| StrataError::InvalidPattern(e.to_string()))?;
        debug!("Compiled {} ignore pattern(s) for {:?}", count, root);

        Ok(Self {
            root: root.to_path_buf(),
            overrides,
            excluded: Vec::new(),
            patterns: count,
        })
    }

    /// Rules that ignore nothing
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            overrides: Override::empty(),
            excluded: Vec::new(),
            patterns: 0,
        }
    }

    /// Exclude `path` and everything under it
    pub fn exclude(mut self, path: impl Into<PathBuf>) -> Self {
        self.excluded.push(path.into());
        self
    }

    /// Source root the patterns are relative to
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of compiled patterns
    pub fn pattern_count(&self) -> usize {
        self.patterns
    }

    /// Check whether `path` (absolute, under the root) should be left out
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        if self.excluded.iter().any(|excluded| path.starts_with(excluded)) {
            return true;
        }
        if self.patterns == 0 || path == self.root {
            return false;
        }
        self.overrides.matched(path, is_dir).is_ignore()
    }
}

/// Make an absolute pattern root-relative and anchored
///
/// Relative patterns pass through. Returns `None` for an absolute pattern
/// outside the root.
fn normalize_pattern(root: &Path, pattern: &str) -> Option<String> {
    let trimmed = pattern.trim();
    let path = Path::new(trimmed);
    if !path.is_absolute() {
        return Some(trimmed.to_string());
    }
    if root == Path::new("/") {
        return Some(trimmed.to_string());
    }
    let relative = path.strip_prefix(root).ok()?;
    let relative = relative.to_string_lossy();
    if relative.is_empty() {
        // The root itself; matching it would empty the snapshot
        return None;
    }
    Some(format!("/{}", relative))
}
