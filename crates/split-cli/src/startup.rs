//! Startup command - promote a pending manifest and run pending removals.

use anyhow::{Context, Result};
use clap::Args;
use console::style;

use split_installer::{process_startup, InstallConfig, VersionStartup};

#[derive(Args, Debug)]
pub struct StartupArgs {}

pub fn execute(_args: StartupArgs, config: InstallConfig) -> Result<i32> {
    let report = process_startup(&config).context("Start-up work failed")?;

    match &report.version {
        VersionStartup::Unversioned => println!("{} No manifest recorded", style("Info:").cyan()),
        VersionStartup::Unchanged { current } => {
            println!("{} Manifest {} is current", style("Info:").cyan(), current)
        }
        VersionStartup::Promoted { from, to } => println!(
            "{} Manifest {} replaced {}, restart other processes",
            style("Success:").green().bold(),
            to,
            from
        ),
    }

    if !report.removed.is_empty() {
        println!(
            "{} Removed {}",
            style("Success:").green().bold(),
            report.removed.join(", ")
        );
    }
    Ok(0)
}
