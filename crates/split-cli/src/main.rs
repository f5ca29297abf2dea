mod clear_cache;
mod install;
mod startup;
mod status;
mod uninstall;
mod update_manifest;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use split_installer::{InstallConfig, Manifest, ManifestVersions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "splitctl")]
#[command(about = "Install optional application modules on demand")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to split-config.json in the working directory)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download and install modules
    Install(install::InstallArgs),

    /// Show every module of the current manifest
    Status(status::StatusArgs),

    /// Remove module versions the current manifest no longer uses
    #[command(name = "clear-cache", alias = "clearcache")]
    ClearCache(clear_cache::ClearCacheArgs),

    /// Schedule modules for removal at the next start
    Uninstall(uninstall::UninstallArgs),

    /// Record a new manifest version, applied at the next start
    #[command(name = "update-manifest")]
    UpdateManifest(update_manifest::UpdateManifestArgs),

    /// Run start-of-process work: manifest promotion and pending removals
    Startup(startup::StartupArgs),
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

/// The manifest currently in effect under the configured root.
pub(crate) fn current_manifest(config: &InstallConfig) -> Result<Manifest> {
    ManifestVersions::new(&config.root_dir, config.lock_timeout())
        .current_manifest()
        .context("Failed to load the current manifest")?
        .with_context(|| {
            format!(
                "No manifest recorded under {}, run 'splitctl update-manifest' first",
                config.root_dir.display()
            )
        })
}

fn load_config(path: Option<&Path>) -> Result<InstallConfig> {
    InstallConfig::build(path, true).context("Failed to load configuration")
}

fn run() -> Result<i32> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = load_config(args.config.as_deref())?;
    log::debug!("Using root {}", config.root_dir.display());

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| anyhow::anyhow!("Failed to create async runtime: {}", e))?;

    match args.command {
        Commands::Install(install_args) => rt.block_on(install::execute(install_args, config)),
        Commands::Status(status_args) => status::execute(status_args, config),
        Commands::ClearCache(clear_args) => clear_cache::execute(clear_args, config),
        Commands::Uninstall(uninstall_args) => uninstall::execute(uninstall_args, config),
        Commands::UpdateManifest(update_args) => update_manifest::execute(update_args, config),
        Commands::Startup(startup_args) => startup::execute(startup_args, config),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("Error: {}", e);
            for cause in e.chain().skip(1) {
                eprintln!("  Caused by: {}", cause);
            }
            ExitCode::FAILURE
        }
    }
}
