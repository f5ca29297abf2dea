pub mod config;
pub mod downloader;
pub mod error;
pub mod extract;
pub mod installer;
pub mod integrity;
pub mod lock;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod preprocess;
pub mod session;
pub mod util;

pub use error::{ErrorCode, Result, SplitError};
pub use config::{ConfigLoader, ConfigSource, InstallConfig};
pub use downloader::{
    AlwaysOnline, DownloadCallback, DownloadRequest, Downloader, HttpDownloader, HttpDownloaderConfig,
    NetworkMonitor,
};
pub use installer::{InstallResult, Installer, PendingUninstall};
pub use integrity::{CertificateVerifier, SignatureVerifier};
pub use manifest::{DeviceProfile, Manifest, ManifestVersions, ModuleDescriptor, VersionStartup};
pub use orchestrator::{
    process_startup, DeferredInstall, DeferredReport, InstallOrchestrator, OrchestratorBuilder,
    StartInstall, StartupReport,
};
pub use paths::{CacheReport, PathStore};
pub use preprocess::{BundledDir, BundledSource, DownloadPlan, DownloadPreprocessor};
pub use session::{
    ChannelListener, SessionListener, SessionRegistry, SessionState, SessionStatus,
};
