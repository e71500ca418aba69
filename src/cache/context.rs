//! Per-invocation settings passed explicitly into every engine call.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::cache::hasher::DEFAULT_IGNORE_PATTERNS;
use crate::paths::BuildPaths;

/// Target, project root and the clean/force directives for one invocation.
#[derive(Debug, Clone)]
pub struct CacheContext {
    pub project_root: PathBuf,
    pub target: String,
    pub clean: bool,
    pub force: BTreeSet<String>,
    /// Global ignore list applied to every directory hash.
    pub ignore_patterns: Vec<String>,
}

impl CacheContext {
    pub fn new(project_root: &Path, target: &str) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            target: target.to_string(),
            clean: false,
            force: BTreeSet::new(),
            ignore_patterns: DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }

    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn with_force<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.force.extend(steps.into_iter().map(Into::into));
        self
    }

    /// Add project ignore patterns on top of the defaults.
    pub fn with_ignore_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for pattern in patterns {
            let pattern = pattern.into();
            if !pattern.is_empty() && !self.ignore_patterns.contains(&pattern) {
                self.ignore_patterns.push(pattern);
            }
        }
        self
    }

    pub fn is_forced(&self, step_id: &str) -> bool {
        self.force.contains(step_id)
    }

    pub fn paths(&self) -> BuildPaths {
        BuildPaths::new(&self.project_root, &self.target)
    }
}
