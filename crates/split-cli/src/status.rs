//! Status command - show the modules of the current manifest.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use serde_json::json;

use split_installer::{InstallConfig, PathStore, PendingUninstall};

use crate::current_manifest;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Print machine-readable JSON
    #[arg(long)]
    pub json: bool,

    /// Only list installed modules
    #[arg(long)]
    pub installed: bool,
}

pub fn execute(args: StatusArgs, config: InstallConfig) -> Result<i32> {
    let manifest = current_manifest(&config)?;
    let paths = PathStore::new(&config.root_dir, manifest.id());
    let pending = PendingUninstall::new(&paths, config.lock_timeout())
        .and_then(|record| record.pending())
        .context("Failed to read pending removals")?;

    let rows: Vec<_> = manifest
        .modules()
        .map(|m| (m, paths.is_installed(m)))
        .filter(|(_, installed)| !args.installed || *installed)
        .collect();

    if args.json {
        let modules: Vec<_> = rows
            .iter()
            .map(|(m, installed)| {
                json!({
                    "name": m.name,
                    "version": m.version,
                    "size": m.size,
                    "builtIn": m.built_in,
                    "compatible": m.is_compatible(&config.device),
                    "installed": installed,
                    "pendingUninstall": pending.contains(&m.name),
                })
            })
            .collect();
        let output = json!({
            "manifestId": manifest.id(),
            "appVersionName": manifest.app_version_name(),
            "modules": modules,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(0);
    }

    println!(
        "{} {} ({})",
        style("Manifest").green().bold(),
        manifest.id(),
        manifest.app_version_name()
    );

    if rows.is_empty() {
        println!("No modules");
        return Ok(0);
    }

    let width = rows.iter().map(|(m, _)| m.name.len()).max().unwrap_or(0);
    for (module, installed) in rows {
        let state = if installed {
            style("installed").green()
        } else if !module.is_compatible(&config.device) {
            style("incompatible").red()
        } else {
            style("not installed").dim()
        };
        let mut line = format!("  {:width$}  {:10}  {}", module.name, module.version, state, width = width);
        if module.built_in {
            line.push_str("  [bundled]");
        }
        if pending.contains(&module.name) {
            line.push_str("  [uninstall pending]");
        }
        println!("{}", line);
    }

    Ok(0)
}
