//! Module installation and deferred removal.

mod installer;
mod uninstall;

pub use installer::{InstallResult, Installer};
pub use uninstall::PendingUninstall;
