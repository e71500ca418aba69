//! Incremental builder for kiosk Linux OS images.
//!
//! A build is a fixed pipeline of containerized steps (frontend bundle,
//! application, compositor, kernel, root filesystem, final image) plus
//! board-supplied lifecycle scripts hooked before or after any step. This
//! crate decides which of those can be skipped and records what ran:
//!
//! - **Cache engine** - content hashing, the step dependency table, the
//!   per-target manifest and the rebuild decisions ([`cache`])
//! - **Configuration** - `kiosk.toml` and `bsp/<target>/bsp.toml` ([`config`])
//! - **Orchestration** - pipeline walk and the container step runner ([`pipeline`])
//! - **Preflight checks** - host tool validation before builds ([`preflight`])
//!
//! # Architecture
//!
//! ```text
//! kiosk-builder build <target>
//!     │
//!     ├── config: project + board config
//!     ├── cache::store: lock + load dist/cache/<target>/build-manifest.json
//!     ├── cache::environment: rebuild container, drop step entries if recipe changed
//!     └── for each step in cache::registry order
//!             ├── before-scripts  (cache::scripts)
//!             ├── cache::decision::decide → hash inputs → run via StepRunner → record + save
//!             └── after-scripts   (cache::scripts)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kiosk_builder::cache::{decide, AssetRegistry, CacheContext, CacheStore, ContentHasher};
//!
//! let ctx = CacheContext::new(project_root, "rpi4");
//! let hasher = ContentHasher::new(AssetRegistry::bundled());
//! let manifest = CacheStore::new(project_root).load("rpi4");
//! let decision = decide("frontend", &manifest, &ctx, &hasher);
//! if decision.rebuild {
//!     println!("frontend: {}", decision);
//! }
//! ```

pub mod cache;
pub mod config;
pub mod paths;
pub mod pipeline;
pub mod preflight;

pub use cache::{CacheContext, CacheManifest, CacheStore, ContentHasher, RebuildDecision};
pub use config::{BoardConfig, ProjectConfig};
pub use paths::BuildPaths;
pub use pipeline::{explain, run_build, BuildReport, ShellStepRunner, StepRunner};
