//! Pipeline orchestration: walk the steps in order, ask the cache, run what
//! is stale, record what succeeded.

pub mod runner;

use anyhow::{bail, Result};
use std::collections::BTreeSet;
use tracing::info;

use crate::cache::context::CacheContext;
use crate::cache::decision::{current_dependency_hashes, decide, record_step, RebuildDecision};
use crate::cache::environment::{invalidate_all_steps, should_rebuild_environment, BuildEnvironment};
use crate::cache::hasher::ContentHasher;
use crate::cache::manifest::CacheManifest;
use crate::cache::registry::{self, StepDependencySpec};
use crate::cache::scripts::{self, ScriptHook};
use crate::cache::store::CacheStore;
use crate::config::BoardConfig;
use crate::paths::declared_path_exists;

pub use runner::{ShellStepRunner, StepRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub step: &'static str,
    pub decision: RebuildDecision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    pub cache_key: String,
    pub ran: bool,
}

/// What one `run_build` invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub environment_rebuilt: bool,
    pub steps: Vec<StepOutcome>,
    pub scripts: Vec<ScriptOutcome>,
}

impl BuildReport {
    pub fn ran_steps(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|o| o.decision.rebuild)
            .map(|o| o.step)
            .collect()
    }

    pub fn skipped_steps(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .filter(|o| !o.decision.rebuild)
            .map(|o| o.step)
            .collect()
    }

    pub fn ran_scripts(&self) -> Vec<&str> {
        self.scripts
            .iter()
            .filter(|o| o.ran)
            .map(|o| o.cache_key.as_str())
            .collect()
    }
}

/// Run every stale step for `ctx.target`, in pipeline order.
///
/// The manifest is saved after each successful step or script, so a failure
/// part-way leaves every completed entry recorded and the failed one absent.
pub fn run_build(
    ctx: &CacheContext,
    board: &BoardConfig,
    runner: &dyn StepRunner,
    hasher: &ContentHasher,
) -> Result<BuildReport> {
    let paths = ctx.paths();
    let store = CacheStore::new(&ctx.project_root);
    let _lock = store.lock(&ctx.target)?;
    let prefix = format!("[build:{}]", ctx.target);

    let mut manifest = if ctx.clean {
        CacheManifest::empty()
    } else {
        store.load(&ctx.target)
    };
    let mut report = BuildReport::default();

    hasher.assets().materialize(&paths.assets_dir())?;

    let environment = BuildEnvironment::from_hasher(hasher);
    if ctx.clean || should_rebuild_environment(&manifest, &environment) {
        println!("{prefix} preparing build environment...");
        runner.build_environment(ctx)?;
        invalidate_all_steps(&mut manifest, &environment);
        store.save(&manifest, &ctx.target)?;
        report.environment_rebuilt = true;
    }

    for spec in registry::pipeline() {
        run_hooked_scripts(ctx, board, runner, &store, &mut manifest, ScriptHook::Before, spec.id, &mut report)?;

        let decision = decide(spec.id, &manifest, ctx, hasher);
        match &decision.reason {
            Some(reason) if decision.rebuild => {
                println!("{prefix} {}: running ({reason})", spec.id);
                let inputs = current_dependency_hashes(spec, ctx, hasher);
                runner.run_step(spec, ctx)?;
                verify_artifacts(spec, ctx)?;
                manifest.record_step(spec.id, record_step(spec, ctx, inputs));
                store.save(&manifest, &ctx.target)?;
            }
            _ => println!("{prefix} {}: up to date", spec.id),
        }
        report.steps.push(StepOutcome {
            step: spec.id,
            decision,
        });

        run_hooked_scripts(ctx, board, runner, &store, &mut manifest, ScriptHook::After, spec.id, &mut report)?;
    }

    info!(
        board = %ctx.target,
        ran = report.ran_steps().len(),
        skipped = report.skipped_steps().len(),
        "build finished"
    );
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn run_hooked_scripts(
    ctx: &CacheContext,
    board: &BoardConfig,
    runner: &dyn StepRunner,
    store: &CacheStore,
    manifest: &mut CacheManifest,
    hook: ScriptHook,
    step_id: &str,
    report: &mut BuildReport,
) -> Result<()> {
    let board_dir = ctx.paths().board_dir();
    for script in board.scripts_for(&board_dir, hook, step_id) {
        let key = script.cache_key(&ctx.target);
        let ran = if scripts::should_skip(&script, &key, manifest, ctx) {
            println!("[build:{}] {} {}: up to date", ctx.target, script.lifecycle_step(), script.location);
            false
        } else {
            println!("[build:{}] {} {}: running", ctx.target, script.lifecycle_step(), script.location);
            let inputs = scripts::script_entry(&script, ctx);
            runner.run_script(&script, ctx)?;
            scripts::record_run(&key, inputs, manifest, ctx, store)?;
            true
        };
        report.scripts.push(ScriptOutcome { cache_key: key, ran });
    }
    Ok(())
}

fn verify_artifacts(spec: &StepDependencySpec, ctx: &CacheContext) -> Result<()> {
    let paths = ctx.paths();
    for artifact in spec.artifacts {
        let resolved = paths.resolve_namespaced(artifact);
        if !declared_path_exists(artifact, &resolved) {
            bail!(
                "step '{}' finished without producing '{}'",
                spec.id,
                resolved.display()
            );
        }
    }
    Ok(())
}

/// Decisions a build would make right now, without running anything.
///
/// Steps downstream of a stale step are reported as rebuilding, the way the
/// timestamp check would see them once the upstream has run.
pub fn explain(ctx: &CacheContext, hasher: &ContentHasher) -> Vec<StepOutcome> {
    let mut manifest = if ctx.clean {
        CacheManifest::empty()
    } else {
        CacheStore::new(&ctx.project_root).load(&ctx.target)
    };
    let environment = BuildEnvironment::from_hasher(hasher);
    if should_rebuild_environment(&manifest, &environment) {
        invalidate_all_steps(&mut manifest, &environment);
    }

    let mut stale: BTreeSet<&'static str> = BTreeSet::new();
    registry::pipeline()
        .iter()
        .map(|spec| {
            let mut decision = decide(spec.id, &manifest, ctx, hasher);
            if !decision.rebuild {
                if let Some(upstream) = spec.upstream.iter().find(|up| stale.contains(*up)) {
                    decision = RebuildDecision::rebuild(format!("upstream rebuilt: {upstream}"));
                }
            }
            if decision.rebuild {
                stale.insert(spec.id);
            }
            StepOutcome {
                step: spec.id,
                decision,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::assets::AssetRegistry;
    use crate::cache::scripts::LifecycleScript;
    use crate::config::load_board_config;
    use crate::paths::is_dir_declaration;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const TARGET: &str = "rpi4";

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    /// Produces every declared artifact without running anything.
    #[derive(Default)]
    struct FakeRunner {
        calls: RefCell<Vec<String>>,
        fail_on: Option<&'static str>,
        /// `(step, file, content)`: rewrite a project file while `step` runs.
        edit_during: Option<(&'static str, &'static str, &'static str)>,
    }

    impl FakeRunner {
        fn failing_on(step: &'static str) -> Self {
            Self {
                fail_on: Some(step),
                ..Self::default()
            }
        }

        fn editing(step: &'static str, file: &'static str, content: &'static str) -> Self {
            Self {
                edit_during: Some((step, file, content)),
                ..Self::default()
            }
        }

        fn produce(ctx: &CacheContext, declared: &str) {
            let resolved = ctx.paths().resolve_namespaced(declared);
            if is_dir_declaration(declared) {
                fs::create_dir_all(&resolved).unwrap();
                fs::write(resolved.join("index.html"), "built").unwrap();
            } else {
                fs::create_dir_all(resolved.parent().unwrap()).unwrap();
                fs::write(&resolved, "built").unwrap();
            }
        }
    }

    impl StepRunner for FakeRunner {
        fn build_environment(&self, _ctx: &CacheContext) -> Result<()> {
            self.calls.borrow_mut().push("environment".to_string());
            Ok(())
        }

        fn run_step(&self, spec: &StepDependencySpec, ctx: &CacheContext) -> Result<()> {
            if self.fail_on == Some(spec.id) {
                bail!("step '{}' failed", spec.id);
            }
            self.calls.borrow_mut().push(spec.id.to_string());
            if let Some((step, file, content)) = self.edit_during {
                if step == spec.id {
                    write(&ctx.project_root, file, content);
                }
            }
            for artifact in spec.artifacts {
                Self::produce(ctx, artifact);
            }
            Ok(())
        }

        fn run_script(&self, script: &LifecycleScript, ctx: &CacheContext) -> Result<()> {
            self.calls.borrow_mut().push(script.location.clone());
            for output in &script.outputs {
                Self::produce(ctx, output);
            }
            Ok(())
        }
    }

    fn project() -> TempDir {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "kiosk.toml", "[project]\nname = \"lobby\"\n");
        write(tmp.path(), "main.go", "package main\n");
        write(tmp.path(), "frontend/index.html", "<html></html>");
        write(tmp.path(), "bsp/rpi4/kernel.config", "CONFIG_DRM=y\n");
        write(tmp.path(), "bsp/rpi4/scripts/wifi.sh", "#!/bin/sh\n");
        write(tmp.path(), "bsp/rpi4/scripts/wpa.conf", "network={}\n");
        write(
            tmp.path(),
            "bsp/rpi4/bsp.toml",
            r#"
[board]
name = "Raspberry Pi 4"
arch = "arm64"

[kernel]
version = "v6.6.30"

[[scripts]]
when = "after"
step = "rootfs-post"
path = "scripts/wifi.sh"
depends_on = ["./wpa.conf"]
outputs = ["cache/wifi.stamp"]
"#,
        );
        tmp
    }

    fn build(ctx: &CacheContext, runner: &FakeRunner) -> Result<BuildReport> {
        let board = load_board_config(&ctx.paths()).unwrap();
        let hasher = ContentHasher::new(AssetRegistry::bundled());
        run_build(ctx, &board, runner, &hasher)
    }

    fn all_steps() -> Vec<&'static str> {
        registry::step_ids().collect()
    }

    #[test]
    fn second_build_skips_everything() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);

        let first = build(&ctx, &FakeRunner::default()).unwrap();
        assert!(first.environment_rebuilt);
        assert_eq!(first.ran_steps(), all_steps());
        assert_eq!(first.ran_scripts(), vec!["rpi4:after:rootfs-post:scripts/wifi.sh"]);
        assert!(tmp.path().join("dist/cache/rpi4/.assets/steps/kernel.sh").is_file());

        let runner = FakeRunner::default();
        let second = build(&ctx, &runner).unwrap();
        assert!(!second.environment_rebuilt);
        assert!(second.ran_steps().is_empty());
        assert!(second.ran_scripts().is_empty());
        assert!(runner.calls.borrow().is_empty());
    }

    #[test]
    fn frontend_edit_reruns_frontend_and_dependents_only() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        build(&ctx, &FakeRunner::default()).unwrap();

        write(tmp.path(), "frontend/index.html", "<html>v2</html>");
        let report = build(&ctx, &FakeRunner::default()).unwrap();
        assert_eq!(report.ran_steps(), vec!["frontend", "rootfs-post", "image"]);

        let frontend = &report.steps[0];
        assert_eq!(
            frontend.decision,
            RebuildDecision::rebuild("dependency changed: dir:frontend/")
        );
        let image = report.steps.iter().find(|o| o.step == "image").unwrap();
        assert_eq!(image.decision.reason.as_deref(), Some("upstream rebuilt: rootfs-post"));
    }

    #[test]
    fn source_edited_while_step_runs_is_rebuilt_next_time() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        build(&ctx, &FakeRunner::editing("frontend", "frontend/index.html", "<html>saved mid-build</html>"))
            .unwrap();

        let manifest = CacheStore::new(tmp.path()).load(TARGET);
        let hasher = ContentHasher::new(AssetRegistry::bundled());
        assert_eq!(
            decide("frontend", &manifest, &ctx, &hasher),
            RebuildDecision::rebuild("dependency changed: dir:frontend/")
        );

        let report = build(&ctx, &FakeRunner::default()).unwrap();
        assert_eq!(report.ran_steps(), vec!["frontend", "rootfs-post", "image"]);
    }

    #[test]
    fn explain_predicts_downstream_rebuilds() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        build(&ctx, &FakeRunner::default()).unwrap();

        write(tmp.path(), "bsp/rpi4/kernel.config", "CONFIG_DRM=m\n");
        let hasher = ContentHasher::new(AssetRegistry::bundled());
        let stale: Vec<_> = explain(&ctx, &hasher)
            .into_iter()
            .filter(|o| o.decision.rebuild)
            .map(|o| o.step)
            .collect();
        assert_eq!(stale, vec!["kernel", "image"]);
    }

    #[test]
    fn forced_step_reruns_with_dependents() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        build(&ctx, &FakeRunner::default()).unwrap();

        let forced = ctx.clone().with_force(["kernel"]);
        let report = build(&forced, &FakeRunner::default()).unwrap();
        assert_eq!(report.ran_steps(), vec!["kernel", "image"]);
    }

    #[test]
    fn failed_step_is_not_recorded_and_resumes() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);

        assert!(build(&ctx, &FakeRunner::failing_on("cage")).is_err());
        let manifest = CacheStore::new(tmp.path()).load(TARGET);
        assert!(manifest.step("frontend").is_some());
        assert!(manifest.step("application").is_some());
        assert!(manifest.step("cage").is_none());

        let report = build(&ctx, &FakeRunner::default()).unwrap();
        assert!(!report.environment_rebuilt);
        assert_eq!(
            report.ran_steps(),
            vec!["cage", "wpe-extension", "client", "kernel", "rootfs-base", "rootfs-post", "image"]
        );
    }

    #[test]
    fn clean_build_reruns_everything() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        build(&ctx, &FakeRunner::default()).unwrap();

        let report = build(&ctx.clone().with_clean(true), &FakeRunner::default()).unwrap();
        assert!(report.environment_rebuilt);
        assert_eq!(report.ran_steps(), all_steps());
        assert_eq!(report.ran_scripts().len(), 1);
    }

    #[test]
    fn concurrent_build_of_same_target_is_refused() {
        let tmp = project();
        let ctx = CacheContext::new(tmp.path(), TARGET);
        let _held = CacheStore::new(tmp.path()).lock(TARGET).unwrap();
        let err = build(&ctx, &FakeRunner::default()).unwrap_err();
        assert!(err.to_string().contains("holds the cache lock"));
    }
}
