//! On-disk layout for a project and build target.
//!
//! ```text
//! <project>/
//!   kiosk.toml
//!   bsp/<target>/bsp.toml
//!   dist/                      shared output root
//!     cache/build-cache.json   legacy combined cache (read-only, migrated)
//!     cache/<target>/          target cache dir (manifest, lock, step outputs)
//!     output/<target>/         target output dir (final images)
//! ```
//!
//! Declared paths use two namespace prefixes: `cache/...` resolves into the
//! target cache dir and `output/...` into the target output dir. Anything else
//! resolves against the shared output root.

use std::path::{Path, PathBuf};

pub const DIST_DIR: &str = "dist";
pub const CACHE_SUBDIR: &str = "cache";
pub const OUTPUT_SUBDIR: &str = "output";
pub const BOARD_DIR: &str = "bsp";
pub const MANIFEST_FILENAME: &str = "build-manifest.json";
pub const LEGACY_CACHE_FILENAME: &str = "build-cache.json";
pub const LOCK_FILENAME: &str = ".build-manifest.lock";
/// Bundled assets are written here inside the target cache dir.
pub const ASSETS_DIRNAME: &str = ".assets";

/// Placeholder expanded to the active target inside declared paths.
pub const TARGET_PLACEHOLDER: &str = "{target}";

const CACHE_PREFIX: &str = "cache/";
const OUTPUT_PREFIX: &str = "output/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPaths {
    project_root: PathBuf,
    target: String,
}

impl BuildPaths {
    pub fn new(project_root: &Path, target: &str) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            target: target.to_string(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.project_root.join(DIST_DIR)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dist_dir().join(CACHE_SUBDIR).join(&self.target)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.dist_dir().join(OUTPUT_SUBDIR).join(&self.target)
    }

    pub fn board_dir(&self) -> PathBuf {
        self.project_root.join(BOARD_DIR).join(&self.target)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.cache_dir().join(MANIFEST_FILENAME)
    }

    pub fn legacy_cache_path(&self) -> PathBuf {
        self.dist_dir().join(CACHE_SUBDIR).join(LEGACY_CACHE_FILENAME)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.cache_dir().join(LOCK_FILENAME)
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.cache_dir().join(ASSETS_DIRNAME)
    }

    /// Resolve a project-relative declared path, expanding `{target}`.
    pub fn resolve_project(&self, declared: &str) -> PathBuf {
        resolve_repo_path(&self.project_root, &expand_target(declared, &self.target))
    }

    /// Resolve a namespaced artifact/dependency path (`cache/`, `output/`, or shared).
    pub fn resolve_namespaced(&self, declared: &str) -> PathBuf {
        let expanded = expand_target(declared, &self.target);
        let candidate = Path::new(&expanded);
        if candidate.is_absolute() {
            return candidate.to_path_buf();
        }
        if let Some(rest) = expanded.strip_prefix(CACHE_PREFIX) {
            self.cache_dir().join(rest)
        } else if let Some(rest) = expanded.strip_prefix(OUTPUT_PREFIX) {
            self.output_dir().join(rest)
        } else {
            self.dist_dir().join(expanded)
        }
    }
}

pub fn expand_target(raw: &str, target: &str) -> String {
    raw.replace(TARGET_PLACEHOLDER, target)
}

pub(crate) fn resolve_repo_path(repo_root: &Path, path: &str) -> PathBuf {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        repo_root.join(candidate)
    }
}

/// True when a declared path names a directory (trailing separator).
pub fn is_dir_declaration(declared: &str) -> bool {
    declared.ends_with('/')
}

/// Existence check honoring the trailing-separator directory convention.
pub fn declared_path_exists(declared: &str, resolved: &Path) -> bool {
    if is_dir_declaration(declared) {
        resolved.is_dir()
    } else {
        resolved.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_resolve_into_target_dirs() {
        let paths = BuildPaths::new(Path::new("/work/proj"), "rpi4");
        assert_eq!(
            paths.resolve_namespaced("cache/app"),
            PathBuf::from("/work/proj/dist/cache/rpi4/app")
        );
        assert_eq!(
            paths.resolve_namespaced("output/rootfs.ext4"),
            PathBuf::from("/work/proj/dist/output/rpi4/rootfs.ext4")
        );
        assert_eq!(
            paths.resolve_namespaced("shared/firmware.bin"),
            PathBuf::from("/work/proj/dist/shared/firmware.bin")
        );
    }

    #[test]
    fn target_placeholder_is_expanded() {
        let paths = BuildPaths::new(Path::new("/p"), "qemu-arm64");
        assert_eq!(
            paths.resolve_project("bsp/{target}/kernel.config"),
            PathBuf::from("/p/bsp/qemu-arm64/kernel.config")
        );
    }

    #[test]
    fn manifest_lives_in_target_cache_dir() {
        let paths = BuildPaths::new(Path::new("/p"), "x86");
        assert_eq!(
            paths.manifest_path(),
            PathBuf::from("/p/dist/cache/x86/build-manifest.json")
        );
        assert_eq!(
            paths.legacy_cache_path(),
            PathBuf::from("/p/dist/cache/build-cache.json")
        );
    }

    #[test]
    fn dir_declaration_requires_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("frontend");
        std::fs::write(&file, b"not a dir").unwrap();
        assert!(declared_path_exists("cache/frontend", &file));
        assert!(!declared_path_exists("cache/frontend/", &file));
    }
}
