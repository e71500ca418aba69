//! Cache for board lifecycle scripts.
//!
//! Scripts hook before or after a pipeline step but are not part of the step
//! graph. Each one is cached under `<target>:<hook>:<step>:<location>` and
//! skipped only when its declared outputs exist and neither the script nor
//! any declared dependency changed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use crate::cache::context::CacheContext;
use crate::cache::decision::RebuildDecision;
use crate::cache::hasher::ContentHasher;
use crate::cache::manifest::{now_timestamp, CacheManifest, ScriptCacheEntry};
use crate::cache::store::CacheStore;
use crate::paths::{declared_path_exists, BuildPaths};

const SCRIPT_RELATIVE_PREFIX: &str = "./";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptHook {
    Before,
    After,
}

impl ScriptHook {
    pub fn as_str(self) -> &'static str {
        match self {
            ScriptHook::Before => "before",
            ScriptHook::After => "after",
        }
    }
}

impl fmt::Display for ScriptHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A board-supplied script attached to a pipeline step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleScript {
    pub hook: ScriptHook,
    pub step: String,
    /// Location as declared in the board config; part of the cache key.
    pub location: String,
    /// Absolute path of the script file.
    pub path: PathBuf,
    /// `./`-prefixed entries are relative to the script's directory, the
    /// rest use the `cache/` / `output/` namespaces.
    pub depends_on: Vec<String>,
    /// Expected generated files, namespaced like artifacts.
    pub outputs: Vec<String>,
}

impl LifecycleScript {
    /// `"<hook>:<step>"`, e.g. `after:rootfs-post`.
    pub fn lifecycle_step(&self) -> String {
        format!("{}:{}", self.hook, self.step)
    }

    pub fn cache_key(&self, target: &str) -> String {
        script_cache_key(target, &self.lifecycle_step(), &self.location)
    }

    fn script_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    fn resolve_dependency(&self, dependency: &str, paths: &BuildPaths) -> PathBuf {
        match dependency.strip_prefix(SCRIPT_RELATIVE_PREFIX) {
            Some(rest) => self.script_dir().join(rest),
            None => paths.resolve_namespaced(dependency),
        }
    }

    fn dependency_hashes(&self, ctx: &CacheContext) -> BTreeMap<String, String> {
        let paths = ctx.paths();
        self.depends_on
            .iter()
            .filter_map(|dep| {
                let resolved = self.resolve_dependency(dep, &paths);
                ContentHasher::hash_path(&resolved, &ctx.ignore_patterns)
                    .map(|hash| (dep.clone(), hash))
            })
            .collect()
    }
}

pub fn script_cache_key(target: &str, lifecycle_step: &str, location: &str) -> String {
    format!("{target}:{lifecycle_step}:{location}")
}

/// Verdict for one script, with the reason it has to run.
pub fn evaluate(
    script: &LifecycleScript,
    cache_key: &str,
    manifest: &CacheManifest,
    ctx: &CacheContext,
) -> RebuildDecision {
    if ctx.clean {
        return RebuildDecision::rebuild("clean build requested");
    }
    if script.outputs.is_empty() {
        return RebuildDecision::rebuild("no declared outputs");
    }

    let paths = ctx.paths();
    for output in &script.outputs {
        if !declared_path_exists(output, &paths.resolve_namespaced(output)) {
            return RebuildDecision::rebuild(format!("output missing: {output}"));
        }
    }

    let Some(cached) = manifest.scripts.get(cache_key) else {
        return RebuildDecision::rebuild("no cache entry");
    };

    match ContentHasher::hash_file(&script.path) {
        Some(hash) if hash == cached.script_hash => {}
        _ => return RebuildDecision::rebuild("script changed"),
    }

    for dep in &script.depends_on {
        let resolved = script.resolve_dependency(dep, &paths);
        let Some(hash) = ContentHasher::hash_path(&resolved, &ctx.ignore_patterns) else {
            return RebuildDecision::rebuild(format!("dependency missing: {dep}"));
        };
        if cached.dependency_hashes.get(dep) != Some(&hash) {
            return RebuildDecision::rebuild(format!("dependency changed: {dep}"));
        }
    }
    for dep in cached.dependency_hashes.keys() {
        if !script.depends_on.contains(dep) {
            return RebuildDecision::rebuild(format!("dependency removed: {dep}"));
        }
    }

    RebuildDecision::skip()
}

/// True when `script` can be skipped.
pub fn should_skip(
    script: &LifecycleScript,
    cache_key: &str,
    manifest: &CacheManifest,
    ctx: &CacheContext,
) -> bool {
    let decision = evaluate(script, cache_key, manifest, ctx);
    match &decision.reason {
        Some(reason) => debug!(script = %script.location, key = cache_key, reason = %reason, "script must run"),
        None => debug!(script = %script.location, key = cache_key, "script cache hit"),
    }
    !decision.rebuild
}

/// Snapshot of `script` and its dependencies, taken before the script runs.
pub fn script_entry(script: &LifecycleScript, ctx: &CacheContext) -> ScriptCacheEntry {
    ScriptCacheEntry {
        last_run_at: now_timestamp(),
        script_hash: ContentHasher::hash_file(&script.path).unwrap_or_default(),
        dependency_hashes: script.dependency_hashes(ctx),
        generated_artifacts: script.outputs.clone(),
    }
}

/// Record a successful run from the pre-run snapshot `entry` and persist the
/// whole manifest.
pub fn record_run(
    cache_key: &str,
    mut entry: ScriptCacheEntry,
    manifest: &mut CacheManifest,
    ctx: &CacheContext,
    store: &CacheStore,
) -> Result<()> {
    entry.last_run_at = now_timestamp();
    manifest.record_script(cache_key, entry);
    store.save(manifest, &ctx.target)
}
