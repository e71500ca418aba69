//! Project (`kiosk.toml`) and board (`bsp/<target>/bsp.toml`) configuration.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::cache::registry;
use crate::cache::scripts::{LifecycleScript, ScriptHook};
use crate::paths::{resolve_repo_path, BuildPaths};

pub const PROJECT_CONFIG_FILENAME: &str = "kiosk.toml";
pub const BOARD_CONFIG_FILENAME: &str = "bsp.toml";

const DEFAULT_IMAGE_SIZE: &str = "1G";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    #[serde(default)]
    pub build: BuildSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildSection {
    /// Extra names skipped when hashing directories.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Steps rebuilt on every invocation.
    #[serde(default)]
    pub force_rebuild: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardConfig {
    pub board: BoardSection,
    pub kernel: KernelSection,
    #[serde(default)]
    pub rootfs: RootfsSection,
    #[serde(default)]
    pub image: ImageSection,
    #[serde(default)]
    pub scripts: Vec<ScriptDeclaration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoardSection {
    pub name: String,
    pub arch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelSection {
    pub version: String,
    #[serde(default)]
    pub cmdline: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RootfsSection {
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageSection {
    #[serde(default = "default_image_size")]
    pub size: String,
}

impl Default for ImageSection {
    fn default() -> Self {
        Self {
            size: default_image_size(),
        }
    }
}

fn default_image_size() -> String {
    DEFAULT_IMAGE_SIZE.to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptDeclaration {
    pub when: ScriptHook,
    pub step: String,
    /// Relative to the board directory.
    pub path: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
    let config_path = project_root.join(PROJECT_CONFIG_FILENAME);
    let raw = fs::read_to_string(&config_path)
        .with_context(|| format!("reading project config '{}'", config_path.display()))?;
    let parsed: ProjectConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing project config '{}'", config_path.display()))?;

    if parsed.project.name.trim().is_empty() {
        bail!(
            "invalid project config '{}': project.name must not be empty",
            config_path.display()
        );
    }
    for step in &parsed.build.force_rebuild {
        if registry::lookup(step).is_none() {
            bail!(
                "invalid project config '{}': force_rebuild names unknown step '{}'",
                config_path.display(),
                step
            );
        }
    }

    Ok(parsed)
}

pub fn load_board_config(paths: &BuildPaths) -> Result<BoardConfig> {
    let board_dir = paths.board_dir();
    if !board_dir.is_dir() {
        bail!(
            "unknown target '{}': board directory '{}' does not exist",
            paths.target(),
            board_dir.display()
        );
    }
    let config_path = board_dir.join(BOARD_CONFIG_FILENAME);
    let raw = fs::read_to_string(&config_path)
        .with_context(|| format!("reading board config '{}'", config_path.display()))?;
    let parsed: BoardConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing board config '{}'", config_path.display()))?;

    for script in &parsed.scripts {
        if registry::lookup(&script.step).is_none() {
            bail!(
                "invalid board config '{}': script '{}' hooks unknown step '{}'",
                config_path.display(),
                script.path,
                script.step
            );
        }
        let script_path = resolve_repo_path(&board_dir, &script.path);
        if !script_path.is_file() {
            bail!(
                "invalid board config '{}': script not found '{}'",
                config_path.display(),
                script_path.display()
            );
        }
    }

    Ok(parsed)
}

impl BoardConfig {
    /// Declared lifecycle scripts with paths resolved against `board_dir`.
    pub fn lifecycle_scripts(&self, board_dir: &Path) -> Vec<LifecycleScript> {
        self.scripts
            .iter()
            .map(|decl| LifecycleScript {
                hook: decl.when,
                step: decl.step.clone(),
                location: decl.path.clone(),
                path: resolve_repo_path(board_dir, &decl.path),
                depends_on: decl.depends_on.clone(),
                outputs: decl.outputs.clone(),
            })
            .collect()
    }

    /// Scripts hooked to `hook` on `step_id`, in declaration order.
    pub fn scripts_for(&self, board_dir: &Path, hook: ScriptHook, step_id: &str) -> Vec<LifecycleScript> {
        self.lifecycle_scripts(board_dir)
            .into_iter()
            .filter(|script| script.hook == hook && script.step == step_id)
            .collect()
    }
}
