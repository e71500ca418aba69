//! Rebuild/skip verdicts for pipeline steps.
//!
//! `decide` is a pure function of the filesystem, the manifest and the
//! context. It never fails: every error path ends in a rebuild.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::context::CacheContext;
use crate::cache::hasher::ContentHasher;
use crate::cache::manifest::{compare_timestamps, now_timestamp, CacheManifest, StepCacheEntry};
use crate::cache::registry::{self, DependencyKind, StepDependencySpec};
use crate::paths::{declared_path_exists, expand_target};

/// Verdict for one step. A value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildDecision {
    pub rebuild: bool,
    pub reason: Option<String>,
}

impl RebuildDecision {
    pub fn rebuild(reason: impl Into<String>) -> Self {
        Self {
            rebuild: true,
            reason: Some(reason.into()),
        }
    }

    pub fn skip() -> Self {
        Self {
            rebuild: false,
            reason: None,
        }
    }
}

impl fmt::Display for RebuildDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.rebuild, &self.reason) {
            (true, Some(reason)) => write!(f, "rebuild ({reason})"),
            (true, None) => f.write_str("rebuild"),
            (false, _) => f.write_str("up to date"),
        }
    }
}

/// Hash every declared input of `spec` as it exists right now.
///
/// Inputs that cannot be hashed are left out of the map, so they surface as
/// added or removed keys when compared with a cached entry.
pub fn current_dependency_hashes(
    spec: &StepDependencySpec,
    ctx: &CacheContext,
    hasher: &ContentHasher,
) -> BTreeMap<String, String> {
    let paths = ctx.paths();
    let mut hashes = BTreeMap::new();

    for file in spec.files {
        if let Some(hash) = ContentHasher::hash_file(&paths.resolve_project(file)) {
            hashes.insert(DependencyKind::File.key(file), hash);
        }
    }

    let mut dir_ignore: Vec<&str> = ctx.ignore_patterns.iter().map(String::as_str).collect();
    dir_ignore.extend(spec.dir_excludes.iter().copied());
    for dir in spec.dirs {
        if let Some(hash) = ContentHasher::hash_directory(&paths.resolve_project(dir), &dir_ignore)
        {
            hashes.insert(DependencyKind::Dir.key(dir), hash);
        }
    }

    for config in spec.config {
        let path = paths.resolve_project(config.file);
        if let Some(hash) = ContentHasher::hash_config_value(&path, config.key_path) {
            hashes.insert(DependencyKind::Config.key(&config.identifier()), hash);
        }
    }

    for asset in spec.assets {
        if let Some(hash) = hasher.hash_bundled_asset(asset) {
            hashes.insert(DependencyKind::Asset.key(asset), hash);
        }
    }

    // First build: no project override yet, the shipped sources are the input.
    let dirs_present = spec
        .dirs
        .iter()
        .all(|dir| paths.resolve_project(dir).is_dir());
    if !dirs_present {
        for asset in spec.fallback_assets {
            if let Some(hash) = hasher.hash_bundled_asset(asset) {
                hashes.insert(DependencyKind::AssetFallback.key(asset), hash);
            }
        }
    }

    hashes
}

/// Decide whether `step_id` must run for the target in `ctx`.
pub fn decide(
    step_id: &str,
    manifest: &CacheManifest,
    ctx: &CacheContext,
    hasher: &ContentHasher,
) -> RebuildDecision {
    let decision = evaluate(step_id, manifest, ctx, hasher);
    match &decision.reason {
        Some(reason) if decision.rebuild => {
            debug!(step = step_id, board = %ctx.target, reason = %reason, "rebuild required");
        }
        _ => debug!(step = step_id, board = %ctx.target, "cache hit"),
    }
    decision
}

fn evaluate(
    step_id: &str,
    manifest: &CacheManifest,
    ctx: &CacheContext,
    hasher: &ContentHasher,
) -> RebuildDecision {
    if ctx.clean {
        return RebuildDecision::rebuild("clean build requested");
    }
    if ctx.is_forced(step_id) {
        return RebuildDecision::rebuild("force rebuild configured");
    }
    let Some(spec) = registry::lookup(step_id) else {
        return RebuildDecision::rebuild("unknown step");
    };
    let Some(cached) = manifest.step(step_id) else {
        return RebuildDecision::rebuild("no cache entry");
    };

    let paths = ctx.paths();
    for artifact in spec.artifacts {
        if !declared_path_exists(artifact, &paths.resolve_namespaced(artifact)) {
            return RebuildDecision::rebuild(format!(
                "artifact missing: {}",
                expand_target(artifact, &ctx.target)
            ));
        }
    }

    let current = current_dependency_hashes(spec, ctx, hasher);
    for (key, hash) in &current {
        match cached.dependency_hashes.get(key) {
            Some(previous) if previous == hash => {}
            Some(_) => return RebuildDecision::rebuild(format!("dependency changed: {key}")),
            None => return RebuildDecision::rebuild(format!("dependency added: {key}")),
        }
    }
    for key in cached.dependency_hashes.keys() {
        if !current.contains_key(key) {
            return RebuildDecision::rebuild(format!("dependency removed: {key}"));
        }
    }

    for upstream in spec.upstream {
        let Some(upstream_entry) = manifest.step(upstream) else {
            return RebuildDecision::rebuild(format!("upstream not cached: {upstream}"));
        };
        if compare_timestamps(&upstream_entry.last_run_at, &cached.last_run_at)
            == Ordering::Greater
        {
            return RebuildDecision::rebuild(format!("upstream rebuilt: {upstream}"));
        }
    }

    RebuildDecision::skip()
}

/// Entry describing a successful run of `spec`, stamped with the current time.
///
/// `dependency_hashes` must be taken with [`current_dependency_hashes`] before
/// the step starts. An input edited while the step runs then still differs
/// from the recorded hash on the next build.
pub fn record_step(
    spec: &StepDependencySpec,
    ctx: &CacheContext,
    dependency_hashes: BTreeMap<String, String>,
) -> StepCacheEntry {
    StepCacheEntry {
        last_run_at: now_timestamp(),
        dependency_hashes,
        artifacts: spec
            .artifacts
            .iter()
            .map(|artifact| expand_target(artifact, &ctx.target))
            .collect(),
        combined_artifact_hash: combined_artifact_hash(spec, ctx),
    }
}

/// One hash over every declared artifact, or `None` if any is unreadable.
fn combined_artifact_hash(spec: &StepDependencySpec, ctx: &CacheContext) -> Option<String> {
    let paths = ctx.paths();
    let mut hasher = Sha256::new();
    for artifact in spec.artifacts {
        let hash = ContentHasher::hash_path(&paths.resolve_namespaced(artifact), &ctx.ignore_patterns)?;
        hasher.update(format!("{artifact}:{hash}\n").as_bytes());
    }
    Some(format!("{:x}", hasher.finalize()))
}
