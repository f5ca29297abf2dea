//! The download capability consumed by the orchestrator.
//!
//! The orchestrator never moves bytes itself. It hands [`DownloadRequest`]s
//! to a [`Downloader`] and reacts to the [`DownloadCallback`] events, which
//! may arrive on any thread.

mod http;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

pub use http::{HttpDownloader, HttpDownloaderConfig};

/// One package to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub file_dir: PathBuf,
    pub file_name: String,
    pub module_name: String,
    pub md5: String,
    pub size: u64,
}

impl DownloadRequest {
    /// Final location of the downloaded file.
    pub fn target(&self) -> PathBuf {
        self.file_dir.join(&self.file_name)
    }
}

/// Progress events for one session's downloads.
pub trait DownloadCallback: Send + Sync {
    fn on_start(&self);

    /// Cumulative bytes downloaded for the whole session.
    fn on_progress(&self, bytes_downloaded: u64);

    fn on_completed(&self);

    fn on_canceled(&self);

    fn on_error(&self, code: ErrorCode);
}

/// Moves packages from their URL to the requested location.
pub trait Downloader: Send + Sync {
    fn start_download(&self, session_id: u32, requests: Vec<DownloadRequest>, callback: Arc<dyn DownloadCallback>);

    /// Low-priority download, possibly postponed until the network allows it.
    fn deferred_download(
        &self,
        session_id: u32,
        requests: Vec<DownloadRequest>,
        callback: Arc<dyn DownloadCallback>,
        allow_metered_network: bool,
    );

    /// Request cancellation. Returns whether the downloader accepted it.
    fn cancel_download_sync(&self, session_id: u32) -> bool;

    /// Bytes above which a download on a metered network needs user
    /// confirmation. Negative means no limit.
    fn download_size_threshold_when_metered(&self) -> i64;

    fn is_deferred_download_only_on_unmetered(&self) -> bool;
}

/// Network conditions as seen by the host.
pub trait NetworkMonitor: Send + Sync {
    fn is_available(&self) -> bool;

    fn is_metered(&self) -> bool;
}

/// Unmetered network that is always reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl NetworkMonitor for AlwaysOnline {
    fn is_available(&self) -> bool {
        true
    }

    fn is_metered(&self) -> bool {
        false
    }
}
