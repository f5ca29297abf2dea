//! Install command - download and install modules.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tokio::runtime::Handle;

use split_installer::session::ChannelListener;
use split_installer::{
    DeferredReport, ErrorCode, HttpDownloader, HttpDownloaderConfig, InstallConfig, InstallOrchestrator,
    InstallResult, NetworkMonitor, SessionStatus, StartInstall,
};

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Modules to install
    #[arg(required = true)]
    pub modules: Vec<String>,

    /// Install every module independently, at low priority
    #[arg(long)]
    pub deferred: bool,

    /// Treat the network as metered
    #[arg(long)]
    pub metered: bool,

    /// Confirm large downloads on a metered network without asking
    #[arg(short, long)]
    pub yes: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

struct CliNetwork {
    metered: bool,
}

impl NetworkMonitor for CliNetwork {
    fn is_available(&self) -> bool {
        true
    }

    fn is_metered(&self) -> bool {
        self.metered
    }
}

/// Process exit code for a failed session.
fn exit_code(code: ErrorCode) -> i32 {
    code.value().abs().max(1)
}

fn report_error(code: ErrorCode, message: &str) -> i32 {
    eprintln!("{} {} (code {})", style("Error:").red().bold(), message, code.value());
    exit_code(code)
}

fn print_results(results: &[InstallResult]) {
    for result in results {
        let note = if result.first_installed { "installed" } else { "already installed" };
        println!(
            "  - {} {} ({})",
            style(&result.module_name).green(),
            note,
            result.package_path.display()
        );
        if let Some(dir) = &result.native_lib_dir {
            println!("    native libraries: {}", dir.display());
        }
        for archive in &result.code_archives {
            println!("    code archive: {}", archive.display());
        }
    }
}

/// Ask before downloading on a metered network. Unattended runs decline.
fn confirm_download(bytes: u64) -> bool {
    if !console::user_attended() {
        return false;
    }
    Confirm::new()
        .with_prompt(format!("Download {} bytes on a metered network?", bytes))
        .default(false)
        .interact()
        .unwrap_or(false)
}

fn progress_bar(hidden: bool) -> ProgressBar {
    if hidden {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb
}

pub async fn execute(args: InstallArgs, config: InstallConfig) -> Result<i32> {
    let network: Arc<dyn NetworkMonitor> = Arc::new(CliNetwork { metered: args.metered });
    let downloader = HttpDownloader::with_config(
        Handle::current(),
        HttpDownloaderConfig::new().with_metered_threshold(config.metered_threshold),
    )
    .context("Failed to create HTTP client")?
    .with_network(network.clone());

    let orchestrator = InstallOrchestrator::builder(config, Arc::new(downloader))
        .network(network)
        .build()
        .context("Failed to set up the installer")?;

    if orchestrator.manifest().is_none() {
        eprintln!(
            "{} No manifest recorded, run 'splitctl update-manifest' first",
            style("Error:").red().bold()
        );
        return Ok(exit_code(ErrorCode::InternalError));
    }

    if args.deferred {
        return execute_deferred(&orchestrator, &args.modules).await;
    }

    let (listener, mut rx) = ChannelListener::new();
    orchestrator.register_listener(Arc::new(listener));

    let session_id = match orchestrator.start_install(&args.modules) {
        Ok(StartInstall::AlreadyInstalled(state)) => {
            println!("{} Nothing to do", style("Success:").green().bold());
            print_results(state.result_artifacts.as_deref().unwrap_or_default());
            return Ok(0);
        }
        Ok(StartInstall::Started(id)) => id,
        Err(e) => return Ok(report_error(e.code(), &e.to_string())),
    };

    println!(
        "{} Installing {} (session {})",
        style("Split").green().bold(),
        args.modules.join(", "),
        session_id
    );

    let pb = progress_bar(args.no_progress);

    while let Some(state) = rx.recv().await {
        if state.session_id != session_id {
            continue;
        }
        match state.status {
            SessionStatus::RequiresUserConfirmation => {
                let bytes = state
                    .confirmation_handle
                    .as_ref()
                    .map(|h| h.bytes_to_download)
                    .unwrap_or(state.total_bytes_to_download);
                if args.yes || pb.suspend(|| confirm_download(bytes)) {
                    orchestrator.continue_install_with_user_confirmation(session_id)?;
                } else {
                    pb.abandon();
                    println!(
                        "{} Skipped {} bytes on a metered network, rerun with --yes to download",
                        style("Info:").cyan(),
                        bytes
                    );
                    orchestrator.cancel_install_without_user_confirmation(session_id)?;
                    return Ok(1);
                }
            }
            SessionStatus::Pending => pb.set_message("waiting"),
            SessionStatus::Downloading => {
                pb.set_length(state.total_bytes_to_download);
                pb.set_position(state.bytes_downloaded);
                pb.set_message("downloading");
            }
            SessionStatus::Downloaded => pb.set_message("downloaded"),
            SessionStatus::Installing => pb.set_message("installing"),
            SessionStatus::Canceling => pb.set_message("canceling"),
            SessionStatus::PostInstalled => {
                pb.finish_and_clear();
                println!("{} Installed {}", style("Success:").green().bold(), args.modules.join(", "));
                print_results(state.result_artifacts.as_deref().unwrap_or_default());
                return Ok(0);
            }
            SessionStatus::Canceled => {
                pb.abandon();
                println!("{} Session {} was canceled", style("Info:").cyan(), session_id);
                return Ok(1);
            }
            SessionStatus::Failed => {
                pb.abandon();
                return Ok(report_error(state.error_code, "Installation failed"));
            }
        }
    }

    Ok(exit_code(ErrorCode::InternalError))
}

async fn execute_deferred(orchestrator: &InstallOrchestrator, modules: &[String]) -> Result<i32> {
    let deferred = match orchestrator.deferred_install(modules) {
        Ok(deferred) => deferred,
        Err(e) => return Ok(report_error(e.code(), &e.to_string())),
    };
    println!(
        "{} Deferred install of {} (session {})",
        style("Split").green().bold(),
        modules.join(", "),
        deferred.session_id()
    );

    let DeferredReport {
        installed,
        failures,
        canceled,
        ..
    } = deferred.wait().await;

    print_results(&installed);
    if canceled {
        println!("{} Download was canceled", style("Info:").cyan());
        return Ok(1);
    }
    for (name, code) in &failures {
        eprintln!("  - {} failed: {} (code {})", style(name).red(), code, code.value());
    }
    Ok(failures.first().map(|(_, code)| exit_code(*code)).unwrap_or(0))
}
