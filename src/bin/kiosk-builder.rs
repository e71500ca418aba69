use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kiosk_builder::cache::environment::BuildEnvironment;
use kiosk_builder::cache::registry;
use kiosk_builder::cache::{AssetRegistry, CacheContext, CacheStore, ContentHasher};
use kiosk_builder::config::{load_board_config, load_project_config, ProjectConfig};
use kiosk_builder::pipeline::{explain, run_build, ShellStepRunner};
use kiosk_builder::preflight;
use tracing_subscriber::EnvFilter;

/// Incremental builder for kiosk Linux OS images
#[derive(Parser)]
#[command(name = "kiosk-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable debug logging (including every rebuild reason)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Project directory containing kiosk.toml
    #[arg(long, global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the image for a board target, skipping up-to-date steps
    Build {
        /// Board target (directory name under bsp/)
        target: String,

        /// Ignore the cache and rebuild every step
        #[arg(long)]
        clean: bool,

        /// Rebuild this step even if cached (repeatable)
        #[arg(long = "force", value_name = "STEP")]
        force: Vec<String>,
    },

    /// Inspect or reset the build cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// List pipeline steps in build order
    Steps,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show what the manifest records for a target
    Status { target: String },
    /// Show which steps would rebuild and why
    Explain { target: String },
    /// Reset the manifest so the next build starts from scratch
    Clean { target: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    match cli.command {
        Commands::Build {
            target,
            clean,
            force,
        } => cmd_build(&cli.project, &target, clean, force),
        Commands::Cache { command } => match command {
            CacheCommands::Status { target } => cmd_cache_status(&cli.project, &target),
            CacheCommands::Explain { target } => cmd_cache_explain(&cli.project, &target),
            CacheCommands::Clean { target } => cmd_cache_clean(&cli.project, &target),
        },
        Commands::Steps => cmd_steps(),
    }
}

fn project_root(project: &Path) -> Result<PathBuf> {
    fs::canonicalize(project)
        .with_context(|| format!("resolving project directory '{}'", project.display()))
}

fn cache_context(root: &Path, target: &str, project: &ProjectConfig) -> CacheContext {
    CacheContext::new(root, target)
        .with_force(project.build.force_rebuild.iter().cloned())
        .with_ignore_patterns(project.build.ignore.iter().cloned())
}

fn cmd_build(project: &Path, target: &str, clean: bool, force: Vec<String>) -> Result<()> {
    for step in &force {
        if registry::lookup(step).is_none() {
            bail!(
                "unknown step '{}' (expected one of: {})",
                step,
                registry::step_ids().collect::<Vec<_>>().join(", ")
            );
        }
    }

    let root = project_root(project)?;
    let project_config = load_project_config(&root)?;
    let ctx = cache_context(&root, target, &project_config)
        .with_clean(clean)
        .with_force(force);
    let board = load_board_config(&ctx.paths())?;

    preflight::check_build_host()?;

    println!("[build:{target}] building {}...", board.board.name);
    let hasher = ContentHasher::new(AssetRegistry::bundled());
    let environment = BuildEnvironment::from_hasher(&hasher);
    let runner = ShellStepRunner::new(&project_config, &board, &environment);

    let report = run_build(&ctx, &board, &runner, &hasher)?;

    let ran = report.ran_steps();
    println!(
        "[build:{target}] done: {} step(s) rebuilt, {} up to date",
        ran.len(),
        report.skipped_steps().len()
    );
    println!("  output: {}", ctx.paths().output_dir().display());
    Ok(())
}

fn cmd_cache_status(project: &Path, target: &str) -> Result<()> {
    let root = project_root(project)?;
    let store = CacheStore::new(&root);
    let manifest = store.load(target);

    println!("cache for '{target}': {}", store.paths(target).manifest_path().display());
    println!(
        "  environment: {}",
        manifest.build_environment_hash.as_deref().unwrap_or("(not built)")
    );
    if let Some(version) = &manifest.tool_version {
        println!("  tool version: {version}");
    }

    println!("steps:");
    for step in registry::step_ids() {
        match manifest.step(step) {
            Some(entry) => println!(
                "  {step:<14} {}  ({} inputs)",
                entry.last_run_at,
                entry.dependency_hashes.len()
            ),
            None => println!("  {step:<14} (not cached)"),
        }
    }

    if !manifest.scripts.is_empty() {
        println!("scripts:");
        for (key, entry) in &manifest.scripts {
            println!("  {key}  {}", entry.last_run_at);
        }
    }
    Ok(())
}

fn cmd_cache_explain(project: &Path, target: &str) -> Result<()> {
    let root = project_root(project)?;
    let project_config = load_project_config(&root)?;
    let ctx = cache_context(&root, target, &project_config);
    let hasher = ContentHasher::new(AssetRegistry::bundled());

    for outcome in explain(&ctx, &hasher) {
        println!("  {:<14} {}", outcome.step, outcome.decision);
    }
    Ok(())
}

fn cmd_cache_clean(project: &Path, target: &str) -> Result<()> {
    let root = project_root(project)?;
    let store = CacheStore::new(&root);
    let _lock = store.lock(target)?;
    if store.clear(target)? {
        println!("[cache:{target}] manifest reset");
    } else {
        println!("[cache:{target}] nothing to clean");
    }
    Ok(())
}

fn cmd_steps() -> Result<()> {
    for spec in registry::pipeline() {
        if spec.upstream.is_empty() {
            println!("{}", spec.id);
        } else {
            println!("{}  (after: {})", spec.id, spec.upstream.join(", "));
        }
    }
    Ok(())
}
