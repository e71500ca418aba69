//! Deterministic content hashing for step inputs.
//!
//! Every function here resolves failure to `None` ("absent"). An absent hash
//! never equals a cached one, so a read error can only cause an extra rebuild.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::cache::assets::AssetRegistry;

/// Names skipped in every directory hash.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    ".DS_Store",
    "node_modules",
    "*.log",
    "*.swp",
];

/// Hashes files, directory trees, config values and bundled assets.
#[derive(Debug)]
pub struct ContentHasher {
    assets: AssetRegistry,
}

impl ContentHasher {
    pub fn new(assets: AssetRegistry) -> Self {
        Self { assets }
    }

    pub fn assets(&self) -> &AssetRegistry {
        &self.assets
    }

    /// SHA-256 of a file's contents, or `None` if it cannot be read.
    pub fn hash_file(path: &Path) -> Option<String> {
        let f = File::open(path).ok()?;
        if !f.metadata().ok()?.is_file() {
            return None;
        }
        let mut r = BufReader::new(f);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = r.read(&mut buf).ok()?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Some(format!("{:x}", hasher.finalize()))
    }

    /// Hash of every non-ignored file below `path`.
    ///
    /// Lines of `"<relative path>:<file hash>\n"` are combined in sorted path
    /// order, so the result depends on names and contents only, never on
    /// enumeration order. A symlink to a regular file is hashed by its target's
    /// contents under the link's own path; directory symlinks are not
    /// descended. Returns `None` for a missing directory or one with no
    /// hashable files.
    pub fn hash_directory<S: AsRef<str>>(path: &Path, ignore_patterns: &[S]) -> Option<String> {
        if !path.is_dir() {
            return None;
        }

        let mut files: Vec<(String, PathBuf)> = WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_entry(|ent| {
                ent.depth() == 0
                    || !ent
                        .file_name()
                        .to_str()
                        .is_some_and(|name| is_ignored(name, ignore_patterns))
            })
            .filter_map(|res| match res {
                Ok(ent) => Some(ent),
                Err(err) => {
                    debug!(
                        path = ?err.path(),
                        error = %err,
                        "skipping unreadable entry while hashing directory"
                    );
                    None
                }
            })
            .filter(|ent| {
                ent.file_type().is_file() || (ent.path_is_symlink() && ent.path().is_file())
            })
            .map(|ent| {
                let rel = ent
                    .path()
                    .strip_prefix(path)
                    .unwrap_or(ent.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                (rel, ent.into_path())
            })
            .collect();

        files.sort_by(|a, b| a.0.cmp(&b.0));

        // Files that vanish between the walk and the read drop out of the hash.
        let lines: Vec<String> = files
            .par_iter()
            .filter_map(|(rel, abs)| Self::hash_file(abs).map(|h| format!("{rel}:{h}\n")))
            .collect();

        if lines.is_empty() {
            return None;
        }

        let mut hasher = Sha256::new();
        for line in &lines {
            hasher.update(line.as_bytes());
        }
        Some(format!("{:x}", hasher.finalize()))
    }

    /// Canonical JSON rendering of the value at `dotted_key_path` in a TOML or
    /// JSON config file (chosen by extension, TOML otherwise).
    pub fn extract_config_value(path: &Path, dotted_key_path: &str) -> Option<String> {
        let raw = fs::read_to_string(path).ok()?;
        let root: Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw).ok()?,
            _ => {
                let parsed: toml::Value = toml::from_str(&raw).ok()?;
                serde_json::to_value(parsed).ok()?
            }
        };

        let mut cursor = &root;
        for segment in dotted_key_path.split('.').filter(|s| !s.is_empty()) {
            cursor = cursor.as_object()?.get(segment)?;
        }
        serde_json::to_string(cursor).ok()
    }

    /// Hash of a value extracted with [`Self::extract_config_value`].
    pub fn hash_config_value(path: &Path, dotted_key_path: &str) -> Option<String> {
        Self::extract_config_value(path, dotted_key_path).map(|value| hash_bytes(value.as_bytes()))
    }

    /// Hash of a bundled asset; never touches the filesystem.
    pub fn hash_bundled_asset(&self, id: &str) -> Option<String> {
        self.assets.hash(id).map(str::to_string)
    }

    /// File hash for a file, tree hash for a directory.
    pub fn hash_path<S: AsRef<str>>(path: &Path, ignore_patterns: &[S]) -> Option<String> {
        if path.is_dir() {
            Self::hash_directory(path, ignore_patterns)
        } else {
            Self::hash_file(path)
        }
    }
}

pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Exact name match, or `*.ext` suffix glob.
pub fn is_ignored<S: AsRef<str>>(name: &str, patterns: &[S]) -> bool {
    patterns.iter().any(|pattern| {
        let pattern = pattern.as_ref();
        match pattern.strip_prefix('*') {
            Some(suffix) if !suffix.is_empty() => name.ends_with(suffix),
            _ => name == pattern,
        }
    })
}
