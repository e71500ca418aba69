//! Registry of text assets compiled into the binary.
//!
//! Step scripts, the build-environment recipe and the fallback sources used on
//! a first build ship inside the tool. Hashing them lets a new tool release
//! invalidate exactly the steps whose shipped inputs changed, independent of
//! the user's project tree.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};

use crate::cache::hasher::hash_bytes;

/// Asset id of the container recipe every step runs inside.
pub const BUILD_ENVIRONMENT_ASSET: &str = "builder/Dockerfile";

macro_rules! bundled {
    ($($id:literal),* $(,)?) => {
        &[$(($id, include_bytes!(concat!("../assets/", $id)) as &[u8])),*]
    };
}

const BUNDLED: &[(&str, &[u8])] = bundled![
    "builder/Dockerfile",
    "steps/frontend.sh",
    "steps/application.sh",
    "steps/cage.sh",
    "steps/wpe-extension.sh",
    "steps/client.sh",
    "steps/kernel.sh",
    "steps/rootfs-base.sh",
    "steps/rootfs-post.sh",
    "steps/image.sh",
    "client-base/main.go",
    "client-base/go.mod",
    "wpe-extension-base/extension.c",
];

#[derive(Debug)]
struct AssetEntry {
    content: Cow<'static, [u8]>,
    hash: OnceLock<String>,
}

/// Mapping from asset id to byte content, built once at startup.
#[derive(Debug, Default)]
pub struct AssetRegistry {
    entries: BTreeMap<String, AssetEntry>,
}

impl AssetRegistry {
    /// The assets shipped with this build of the tool.
    pub fn bundled() -> Self {
        let mut registry = Self::default();
        for (id, content) in BUNDLED {
            registry.insert_static(id, content);
        }
        registry
    }

    fn insert_static(&mut self, id: &str, content: &'static [u8]) {
        self.entries.insert(
            id.to_string(),
            AssetEntry {
                content: Cow::Borrowed(content),
                hash: OnceLock::new(),
            },
        );
    }

    /// Register (or replace) an asset with owned content.
    pub fn insert(&mut self, id: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.entries.insert(
            id.into(),
            AssetEntry {
                content: Cow::Owned(content.into()),
                hash: OnceLock::new(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&[u8]> {
        self.entries.get(id).map(|entry| entry.content.as_ref())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Content hash of an asset, computed on first use and memoized.
    pub fn hash(&self, id: &str) -> Option<&str> {
        let entry = self.entries.get(id)?;
        Some(
            entry
                .hash
                .get_or_init(|| hash_bytes(entry.content.as_ref()))
                .as_str(),
        )
    }

    /// Write every asset below `dest_dir`, keeping the id as relative path.
    pub fn materialize(&self, dest_dir: &Path) -> Result<()> {
        for (id, entry) in &self.entries {
            let dest = dest_dir.join(id);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("creating asset directory '{}'", parent.display())
                })?;
            }
            fs::write(&dest, entry.content.as_ref())
                .with_context(|| format!("writing bundled asset '{}'", dest.display()))?;
        }
        Ok(())
    }
}
