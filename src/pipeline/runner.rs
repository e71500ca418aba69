//! Execution seam between the orchestrator and the container runtime.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::debug;

use crate::cache::assets::BUILD_ENVIRONMENT_ASSET;
use crate::cache::context::CacheContext;
use crate::cache::environment::BuildEnvironment;
use crate::cache::registry::StepDependencySpec;
use crate::cache::scripts::LifecycleScript;
use crate::config::{BoardConfig, ProjectConfig};

const IMAGE_REPOSITORY: &str = "kiosk-builder-env";

/// Runs the external work behind a step or lifecycle script.
///
/// Implementations report success only after the work fully completed; the
/// orchestrator records cache entries on `Ok` and nothing on `Err`.
pub trait StepRunner {
    fn build_environment(&self, ctx: &CacheContext) -> Result<()>;
    fn run_step(&self, spec: &StepDependencySpec, ctx: &CacheContext) -> Result<()>;
    fn run_script(&self, script: &LifecycleScript, ctx: &CacheContext) -> Result<()>;
}

/// Runs bundled step scripts and board scripts with `sh` inside the build
/// environment container. The project root is mounted at its host path so
/// every exported path is valid on both sides.
#[derive(Debug, Clone)]
pub struct ShellStepRunner {
    image: String,
    env: Vec<(&'static str, String)>,
}

impl ShellStepRunner {
    pub fn new(project: &ProjectConfig, board: &BoardConfig, environment: &BuildEnvironment) -> Self {
        let tag = environment
            .hash
            .as_deref()
            .map(|hash| hash.chars().take(12).collect::<String>())
            .unwrap_or_else(|| "latest".to_string());

        let mut env = vec![
            ("KIOSK_PROJECT_NAME", project.project.name.clone()),
            ("KIOSK_ARCH", board.board.arch.clone()),
            ("KIOSK_KERNEL_VERSION", board.kernel.version.clone()),
            ("KIOSK_ROOTFS_PACKAGES", board.rootfs.packages.join(",")),
            ("KIOSK_IMAGE_SIZE", board.image.size.clone()),
        ];
        if let Some(cmdline) = &board.kernel.cmdline {
            env.push(("KIOSK_KERNEL_CMDLINE", cmdline.clone()));
        }

        Self {
            image: format!("{IMAGE_REPOSITORY}:{tag}"),
            env,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn container_command(&self, ctx: &CacheContext, script: &Path) -> Command {
        let paths = ctx.paths();
        let root = ctx.project_root.display().to_string();

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--volume")
            .arg(format!("{root}:{root}"))
            .arg("--workdir")
            .arg(&root);

        let mut exported = vec![
            ("KIOSK_TARGET", ctx.target.clone()),
            ("KIOSK_PROJECT_DIR", root.clone()),
            ("KIOSK_CACHE_DIR", paths.cache_dir().display().to_string()),
            ("KIOSK_OUTPUT_DIR", paths.output_dir().display().to_string()),
            ("KIOSK_BOARD_DIR", paths.board_dir().display().to_string()),
        ];
        exported.extend(self.env.iter().cloned());
        for (key, value) in exported {
            cmd.arg("--env").arg(format!("{key}={value}"));
        }

        cmd.arg(&self.image).arg("sh").arg(script);
        cmd
    }
}

fn run_checked(mut cmd: Command, what: &str) -> Result<()> {
    debug!(command = ?cmd, "running {what}");
    let status = cmd
        .status()
        .with_context(|| format!("executing {what}"))?;
    if !status.success() {
        bail!("{what} failed (status {status})");
    }
    Ok(())
}

impl StepRunner for ShellStepRunner {
    fn build_environment(&self, ctx: &CacheContext) -> Result<()> {
        let assets_dir = ctx.paths().assets_dir();
        let recipe = assets_dir.join(BUILD_ENVIRONMENT_ASSET);
        if !recipe.is_file() {
            bail!("build environment recipe not found: {}", recipe.display());
        }

        let mut cmd = Command::new("docker");
        cmd.arg("build")
            .arg("--tag")
            .arg(&self.image)
            .arg("--file")
            .arg(&recipe)
            .arg(&assets_dir);
        run_checked(cmd, &format!("build environment image '{}'", self.image))
    }

    fn run_step(&self, spec: &StepDependencySpec, ctx: &CacheContext) -> Result<()> {
        let script = ctx.paths().assets_dir().join(spec.script_asset());
        if !script.is_file() {
            bail!("step script not found: {}", script.display());
        }
        run_checked(
            self.container_command(ctx, &script),
            &format!("step '{}'", spec.id),
        )
    }

    fn run_script(&self, script: &LifecycleScript, ctx: &CacheContext) -> Result<()> {
        if !script.path.is_file() {
            bail!("lifecycle script not found: {}", script.path.display());
        }
        run_checked(
            self.container_command(ctx, &script.path),
            &format!("{} script '{}'", script.lifecycle_step(), script.location),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BoardSection, BuildSection, ImageSection, KernelSection, ProjectSection, RootfsSection,
    };

    fn configs() -> (ProjectConfig, BoardConfig) {
        let project = ProjectConfig {
            project: ProjectSection {
                name: "lobby".to_string(),
            },
            build: BuildSection::default(),
        };
        let board = BoardConfig {
            board: BoardSection {
                name: "Pi".to_string(),
                arch: "arm64".to_string(),
            },
            kernel: KernelSection {
                version: "v6.6.30".to_string(),
                cmdline: None,
            },
            rootfs: RootfsSection {
                packages: vec!["udev".to_string(), "dbus".to_string()],
            },
            image: ImageSection::default(),
            scripts: Vec::new(),
        };
        (project, board)
    }

    #[test]
    fn image_tag_follows_environment_hash() {
        let (project, board) = configs();
        let env = BuildEnvironment {
            hash: Some("0123456789abcdef".to_string()),
        };
        let runner = ShellStepRunner::new(&project, &board, &env);
        assert_eq!(runner.image(), "kiosk-builder-env:0123456789ab");
    }

    #[test]
    fn container_command_exports_target_layout() {
        let (project, board) = configs();
        let runner = ShellStepRunner::new(&project, &board, &BuildEnvironment { hash: None });
        let ctx = CacheContext::new(Path::new("/work/lobby"), "rpi4");
        let cmd = runner.container_command(&ctx, Path::new("/work/lobby/bsp/rpi4/x.sh"));
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert!(args.contains(&"KIOSK_TARGET=rpi4".to_string()));
        assert!(args.contains(&"KIOSK_CACHE_DIR=/work/lobby/dist/cache/rpi4".to_string()));
        assert!(args.contains(&"KIOSK_ROOTFS_PACKAGES=udev,dbus".to_string()));
        assert!(args.contains(&"/work/lobby:/work/lobby".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/work/lobby/bsp/rpi4/x.sh"));
    }
}
