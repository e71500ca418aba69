//! Loading and persisting per-target cache manifests.
//!
//! Loading never fails: a missing, unreadable, corrupt or version-mismatched
//! manifest becomes an empty one, which makes every step look uncached.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cache::manifest::{CacheManifest, ScriptCacheEntry, MANIFEST_FORMAT_VERSION};
use crate::paths::BuildPaths;

/// Reads and writes manifests under `<project>/dist/cache/<target>/`.
#[derive(Debug, Clone)]
pub struct CacheStore {
    project_root: PathBuf,
}

/// Only the version tag, read before trusting the rest of the document.
#[derive(Debug, Deserialize)]
struct VersionProbe {
    format_version: Option<u32>,
}

/// Combined cache written by older releases: one file for all targets.
/// Only its script entries are carried over.
#[derive(Debug, Deserialize)]
struct LegacyCache {
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyScriptEntry {
    last_run_at: String,
    script_hash: String,
    #[serde(default)]
    dependency_hashes: BTreeMap<String, String>,
    #[serde(default)]
    generated_artifacts: Vec<String>,
}

impl From<LegacyScriptEntry> for ScriptCacheEntry {
    fn from(legacy: LegacyScriptEntry) -> Self {
        Self {
            last_run_at: legacy.last_run_at,
            script_hash: legacy.script_hash,
            dependency_hashes: legacy.dependency_hashes,
            generated_artifacts: legacy.generated_artifacts,
        }
    }
}

impl CacheStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
        }
    }

    pub fn paths(&self, target: &str) -> BuildPaths {
        BuildPaths::new(&self.project_root, target)
    }

    /// Load the manifest for `target`, falling back to an empty one.
    pub fn load(&self, target: &str) -> CacheManifest {
        let paths = self.paths(target);
        let path = paths.manifest_path();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(_) => return self.migrate_legacy(&paths),
        };

        match parse_manifest(&bytes) {
            Ok(manifest) => manifest,
            Err(reason) => {
                warn!(board = target, path = %path.display(), %reason, "discarding cache manifest");
                CacheManifest::empty()
            }
        }
    }

    /// Persist `manifest` for `target`, replacing the whole file.
    pub fn save(&self, manifest: &CacheManifest, target: &str) -> Result<()> {
        let paths = self.paths(target);
        let cache_dir = paths.cache_dir();
        fs::create_dir_all(&cache_dir)
            .with_context(|| format!("creating cache directory '{}'", cache_dir.display()))?;

        let path = paths.manifest_path();
        let bytes = serde_json::to_vec_pretty(manifest)
            .with_context(|| format!("serializing cache manifest for '{target}'"))?;
        let tmp = cache_dir.join(tmp_name(".build-manifest.json"));
        if let Err(err) = fs::write(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(err)
                .with_context(|| format!("writing cache manifest '{}'", tmp.display()));
        }
        if let Err(err) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| {
                format!(
                    "replacing cache manifest '{}' -> '{}'",
                    tmp.display(),
                    path.display()
                )
            });
        }
        debug!(board = target, steps = manifest.steps.len(), scripts = manifest.scripts.len(), "saved cache manifest");
        Ok(())
    }

    /// Reset the manifest for `target` to an empty one (explicit clean request).
    ///
    /// An empty manifest is written rather than the file removed: a missing
    /// manifest would pull script entries back in from the legacy combined
    /// cache, which other targets still share. Returns whether anything was
    /// recorded before.
    pub fn clear(&self, target: &str) -> Result<bool> {
        let had_entries = !self.load(target).is_empty();
        self.save(&CacheManifest::empty(), target)?;
        Ok(had_entries)
    }

    /// Take the single-writer lock for `target` for the lifetime of the guard.
    pub fn lock(&self, target: &str) -> Result<ManifestLock> {
        let paths = self.paths(target);
        let lock_path = paths.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating cache directory '{}'", parent.display()))?;
        }

        // Never unlink the lock file: a second process could then create a
        // fresh file at the same path and lock it independently.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("opening cache lock '{}'", lock_path.display()))?;

        if file.try_lock_exclusive().is_err() {
            anyhow::bail!(
                "another build for target '{}' holds the cache lock '{}'",
                target,
                lock_path.display()
            );
        }

        Ok(ManifestLock { file })
    }

    fn migrate_legacy(&self, paths: &BuildPaths) -> CacheManifest {
        let legacy_path = paths.legacy_cache_path();
        let Ok(bytes) = fs::read(&legacy_path) else {
            return CacheManifest::empty();
        };

        let legacy: LegacyCache = match serde_json::from_slice(&bytes) {
            Ok(legacy) => legacy,
            Err(err) => {
                warn!(path = %legacy_path.display(), error = %err, "ignoring unreadable legacy cache");
                return CacheManifest::empty();
            }
        };

        let prefix = format!("{}:", paths.target());
        let mut manifest = CacheManifest::empty();
        for (key, value) in legacy.scripts {
            if !key.starts_with(&prefix) {
                continue;
            }
            match serde_json::from_value::<LegacyScriptEntry>(value) {
                Ok(entry) => manifest.record_script(&key, entry.into()),
                Err(err) => debug!(%key, error = %err, "skipping malformed legacy script entry"),
            }
        }

        if manifest.scripts.is_empty() {
            return manifest;
        }

        info!(
            board = paths.target(),
            scripts = manifest.scripts.len(),
            "migrated script cache from legacy combined cache"
        );
        if let Err(err) = self.save(&manifest, paths.target()) {
            warn!(error = %err, "could not persist migrated cache manifest");
        }
        manifest
    }
}

fn parse_manifest(bytes: &[u8]) -> std::result::Result<CacheManifest, String> {
    let probe: VersionProbe = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    match probe.format_version {
        Some(MANIFEST_FORMAT_VERSION) => {}
        Some(other) => {
            return Err(format!(
                "format version {other} (expected {MANIFEST_FORMAT_VERSION})"
            ))
        }
        None => return Err("missing format version".to_string()),
    }
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}

/// Exclusive advisory lock on a target's manifest; released on drop.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn tmp_name(prefix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{}-{n}.tmp", std::process::id())
}
