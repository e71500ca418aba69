//! Static table of build steps and their declared inputs and outputs.
//!
//! Paths in `files`, `dirs` and `config` are project-relative; artifacts use
//! the `cache/` / `output/` namespaces from [`crate::paths`]. `{target}` is
//! expanded at resolution time. Directory entries end in `/`.
//!
//! The table order is the pipeline order: every step appears after all of its
//! upstream steps.

use std::fmt;

pub const STEP_FRONTEND: &str = "frontend";
pub const STEP_APPLICATION: &str = "application";
pub const STEP_CAGE: &str = "cage";
pub const STEP_WPE_EXTENSION: &str = "wpe-extension";
pub const STEP_CLIENT: &str = "client";
pub const STEP_KERNEL: &str = "kernel";
pub const STEP_ROOTFS_BASE: &str = "rootfs-base";
pub const STEP_ROOTFS_POST: &str = "rootfs-post";
pub const STEP_IMAGE: &str = "image";

const PROJECT_CONFIG: &str = "kiosk.toml";
const BOARD_CONFIG: &str = "bsp/{target}/bsp.toml";

/// Kind prefix of a dependency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DependencyKind {
    File,
    Dir,
    Config,
    Asset,
    AssetFallback,
}

impl DependencyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyKind::File => "file",
            DependencyKind::Dir => "dir",
            DependencyKind::Config => "config",
            DependencyKind::Asset => "asset",
            DependencyKind::AssetFallback => "asset-fallback",
        }
    }

    /// Namespaced `kind:identifier` key.
    pub fn key(self, identifier: &str) -> String {
        format!("{}:{}", self.as_str(), identifier)
    }
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value inside a structured config file, addressed by a dotted path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDependency {
    pub file: &'static str,
    pub key_path: &'static str,
}

impl ConfigDependency {
    pub fn identifier(&self) -> String {
        format!("{}#{}", self.file, self.key_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDependencySpec {
    pub id: &'static str,
    pub files: &'static [&'static str],
    pub dirs: &'static [&'static str],
    /// Extra names skipped inside `dirs`, merged with the global ignore list.
    pub dir_excludes: &'static [&'static str],
    pub config: &'static [ConfigDependency],
    pub assets: &'static [&'static str],
    /// Hashed only while the declared `dirs` are not all present.
    pub fallback_assets: &'static [&'static str],
    pub upstream: &'static [&'static str],
    pub artifacts: &'static [&'static str],
}

impl StepDependencySpec {
    const EMPTY: StepDependencySpec = StepDependencySpec {
        id: "",
        files: &[],
        dirs: &[],
        dir_excludes: &[],
        config: &[],
        assets: &[],
        fallback_assets: &[],
        upstream: &[],
        artifacts: &[],
    };

    /// Bundled script that performs this step.
    pub fn script_asset(&self) -> String {
        format!("steps/{}.sh", self.id)
    }
}

const BOARD_ARCH: ConfigDependency = ConfigDependency {
    file: BOARD_CONFIG,
    key_path: "board.arch",
};

static STEPS: &[StepDependencySpec] = &[
    StepDependencySpec {
        id: STEP_FRONTEND,
        dirs: &["frontend/"],
        dir_excludes: &["dist", ".vite", ".cache"],
        assets: &["steps/frontend.sh"],
        artifacts: &["cache/frontend/"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_APPLICATION,
        files: &["main.go", "go.mod", "go.sum"],
        dirs: &["app/"],
        config: &[
            ConfigDependency {
                file: PROJECT_CONFIG,
                key_path: "project.name",
            },
            BOARD_ARCH,
        ],
        assets: &["steps/application.sh"],
        artifacts: &["cache/app"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_CAGE,
        config: &[BOARD_ARCH],
        assets: &["steps/cage.sh"],
        artifacts: &["cache/cage"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_WPE_EXTENSION,
        dirs: &["overrides/wpe-extension/"],
        config: &[BOARD_ARCH],
        assets: &["steps/wpe-extension.sh"],
        fallback_assets: &["wpe-extension-base/extension.c"],
        artifacts: &["cache/libkiosk-extension.so"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_CLIENT,
        dirs: &["overrides/client/"],
        config: &[BOARD_ARCH],
        assets: &["steps/client.sh"],
        fallback_assets: &["client-base/main.go", "client-base/go.mod"],
        artifacts: &["cache/client"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_KERNEL,
        files: &["bsp/{target}/kernel.config"],
        config: &[
            BOARD_ARCH,
            ConfigDependency {
                file: BOARD_CONFIG,
                key_path: "kernel",
            },
        ],
        assets: &["steps/kernel.sh"],
        artifacts: &["cache/Image"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_ROOTFS_BASE,
        config: &[
            BOARD_ARCH,
            ConfigDependency {
                file: BOARD_CONFIG,
                key_path: "rootfs.packages",
            },
        ],
        assets: &["steps/rootfs-base.sh"],
        artifacts: &["cache/rootfs-base.tar"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_ROOTFS_POST,
        dirs: &["bsp/{target}/overlay/"],
        assets: &["steps/rootfs-post.sh"],
        upstream: &[
            STEP_ROOTFS_BASE,
            STEP_APPLICATION,
            STEP_FRONTEND,
            STEP_CAGE,
            STEP_WPE_EXTENSION,
            STEP_CLIENT,
        ],
        artifacts: &["cache/rootfs.tar"],
        ..StepDependencySpec::EMPTY
    },
    StepDependencySpec {
        id: STEP_IMAGE,
        config: &[ConfigDependency {
            file: BOARD_CONFIG,
            key_path: "image",
        }],
        assets: &["steps/image.sh"],
        upstream: &[STEP_ROOTFS_POST, STEP_KERNEL],
        artifacts: &["output/rootfs.ext4", "output/Image"],
        ..StepDependencySpec::EMPTY
    },
];

/// All steps in pipeline order.
pub fn pipeline() -> &'static [StepDependencySpec] {
    STEPS
}

pub fn lookup(step_id: &str) -> Option<&'static StepDependencySpec> {
    STEPS.iter().find(|spec| spec.id == step_id)
}

pub fn step_ids() -> impl Iterator<Item = &'static str> {
    STEPS.iter().map(|spec| spec.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::assets::AssetRegistry;
    use std::collections::BTreeSet;

    #[test]
    fn dependency_keys_are_namespaced() {
        assert_eq!(DependencyKind::Dir.key("frontend/"), "dir:frontend/");
        assert_eq!(
            DependencyKind::AssetFallback.key("client-base/main.go"),
            "asset-fallback:client-base/main.go"
        );
        assert_ne!(
            DependencyKind::File.key("kiosk.toml"),
            DependencyKind::Config.key("kiosk.toml")
        );
    }

    #[test]
    fn step_ids_are_unique() {
        let ids: BTreeSet<_> = step_ids().collect();
        assert_eq!(ids.len(), pipeline().len());
    }

    #[test]
    fn upstream_steps_precede_their_dependents() {
        let mut seen = BTreeSet::new();
        for spec in pipeline() {
            for upstream in spec.upstream {
                assert!(
                    seen.contains(upstream),
                    "step '{}' depends on '{}' which runs later or does not exist",
                    spec.id,
                    upstream
                );
            }
            seen.insert(spec.id);
        }
    }

    #[test]
    fn every_declared_asset_is_bundled() {
        let assets = AssetRegistry::bundled();
        for spec in pipeline() {
            assert!(assets.contains(&spec.script_asset()), "{}", spec.id);
            for id in spec.assets.iter().chain(spec.fallback_assets) {
                assert!(assets.contains(id), "step '{}' asset '{}'", spec.id, id);
            }
        }
    }

    #[test]
    fn every_step_declares_artifacts() {
        for spec in pipeline() {
            assert!(!spec.artifacts.is_empty(), "{}", spec.id);
        }
    }

    #[test]
    fn lookup_unknown_step() {
        assert!(lookup("frontend").is_some());
        assert!(lookup("nope").is_none());
    }
}
