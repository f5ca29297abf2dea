//! Update-manifest command - record a new manifest version.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use std::path::PathBuf;

use split_installer::{InstallConfig, Manifest, ManifestVersions};

#[derive(Args, Debug)]
pub struct UpdateManifestArgs {
    /// Version name of the new manifest
    pub version: String,

    /// Manifest file (JSON)
    pub file: PathBuf,
}

pub fn execute(args: UpdateManifestArgs, config: InstallConfig) -> Result<i32> {
    let manifest = Manifest::load(&args.file)
        .with_context(|| format!("Failed to read manifest {}", args.file.display()))?;
    manifest
        .validate()
        .with_context(|| format!("Manifest {} is invalid", args.file.display()))?;

    let versions = ManifestVersions::new(&config.root_dir, config.lock_timeout());
    let previous = versions.current_version()?;
    versions
        .update(&args.version, &args.file)
        .context("Failed to record the manifest version")?;

    match previous {
        Some(previous) if previous != args.version => println!(
            "{} Manifest {} ({} modules) recorded, replaces {} at the next start",
            style("Success:").green().bold(),
            args.version,
            manifest.len(),
            previous
        ),
        _ => println!(
            "{} Manifest {} ({} modules) is current",
            style("Success:").green().bold(),
            args.version,
            manifest.len()
        ),
    }
    Ok(0)
}
