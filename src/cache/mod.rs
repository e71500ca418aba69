//! Incremental build cache.
//!
//! Decides, per pipeline step and per lifecycle script, whether work can be
//! skipped, and records successful runs in a per-target manifest.
//!
//! The worst outcome of any failure in here is an unnecessary rebuild:
//! unreadable inputs hash to "absent", unreadable manifests load as empty.

pub mod assets;
pub mod context;
pub mod decision;
pub mod environment;
pub mod hasher;
pub mod manifest;
pub mod registry;
pub mod scripts;
pub mod store;

pub use assets::{AssetRegistry, BUILD_ENVIRONMENT_ASSET};
pub use context::CacheContext;
pub use decision::{current_dependency_hashes, decide, record_step, RebuildDecision};
pub use environment::{invalidate_all_steps, should_rebuild_environment, BuildEnvironment};
pub use hasher::{ContentHasher, DEFAULT_IGNORE_PATTERNS};
pub use manifest::{
    CacheManifest, ScriptCacheEntry, StepCacheEntry, MANIFEST_FORMAT_VERSION, TOOL_VERSION,
};
pub use registry::{DependencyKind, StepDependencySpec};
pub use scripts::{LifecycleScript, ScriptHook};
pub use store::{CacheStore, ManifestLock};
