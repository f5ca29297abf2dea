//! Uninstall command - schedule modules for removal at the next start.

use anyhow::{bail, Context, Result};
use clap::Args;
use console::style;

use split_installer::{InstallConfig, PathStore, PendingUninstall};

use crate::current_manifest;

#[derive(Args, Debug)]
pub struct UninstallArgs {
    /// Modules to remove
    #[arg(required = true)]
    pub modules: Vec<String>,
}

pub fn execute(args: UninstallArgs, config: InstallConfig) -> Result<i32> {
    let manifest = current_manifest(&config)?;

    for name in &args.modules {
        if manifest.get(name).is_none() {
            bail!("Module {} is not part of manifest {}", name, manifest.id());
        }
    }

    let paths = PathStore::new(&config.root_dir, manifest.id());
    let pending = PendingUninstall::new(&paths, config.lock_timeout())
        .and_then(|record| record.with_max_attempts(config.max_attempts).record(&args.modules))
        .context("Failed to record the uninstall")?;

    println!(
        "{} {} will be removed at the next start",
        style("Success:").green().bold(),
        args.modules.join(", ")
    );
    if pending.len() > args.modules.len() {
        println!("  pending removals: {}", pending.join(", "));
    }
    Ok(0)
}
