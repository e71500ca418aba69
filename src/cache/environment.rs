//! Global invalidation when the container build environment changes.
//!
//! Every step runs inside the same container image, so a new recipe makes
//! every step entry stale. Lifecycle script entries track their own inputs
//! and survive.

use tracing::info;

use crate::cache::assets::BUILD_ENVIRONMENT_ASSET;
use crate::cache::hasher::ContentHasher;
use crate::cache::manifest::{CacheManifest, TOOL_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    pub hash: Option<String>,
}

impl BuildEnvironment {
    pub fn from_hasher(hasher: &ContentHasher) -> Self {
        Self {
            hash: hasher.hash_bundled_asset(BUILD_ENVIRONMENT_ASSET),
        }
    }
}

/// True when the stored environment hash differs from `env` or is missing.
pub fn should_rebuild_environment(manifest: &CacheManifest, env: &BuildEnvironment) -> bool {
    match (&manifest.build_environment_hash, &env.hash) {
        (Some(stored), Some(current)) => stored != current,
        _ => true,
    }
}

/// Drop every step entry and stamp the manifest with `env`.
pub fn invalidate_all_steps(manifest: &mut CacheManifest, env: &BuildEnvironment) {
    if !manifest.steps.is_empty() {
        info!(
            steps = manifest.steps.len(),
            "build environment changed; invalidating cached steps"
        );
    }
    manifest.steps.clear();
    manifest.build_environment_hash = env.hash.clone();
    manifest.tool_version = Some(TOOL_VERSION.to_string());
}
