//! Clear-cache command - remove module versions the manifest no longer uses.

use anyhow::{Context, Result};
use clap::Args;
use console::style;

use split_installer::{InstallConfig, PathStore};

use crate::current_manifest;

#[derive(Args, Debug)]
pub struct ClearCacheArgs {
    /// List what was removed
    #[arg(long)]
    pub list: bool,
}

pub fn execute(args: ClearCacheArgs, config: InstallConfig) -> Result<i32> {
    let manifest = current_manifest(&config)?;
    let paths = PathStore::new(&config.root_dir, manifest.id());

    println!(
        "{} Clearing stale modules under {}...",
        style("Info:").cyan(),
        config.root_dir.display()
    );

    let report = paths
        .clear_cache(&manifest, config.lock_timeout())
        .context("Failed to clear the module cache")?;

    if args.list {
        for path in &report.removed {
            println!("  removed {}", path.display());
        }
    }

    println!(
        "\n{} Removed {} director{}. Freed {}",
        style("Success:").green().bold(),
        report.removed.len(),
        if report.removed.len() == 1 { "y" } else { "ies" },
        format_bytes(report.freed_bytes)
    );
    Ok(0)
}

/// Format bytes into human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
