use serde::{Deserialize, Serialize};

use crate::downloader::DownloadRequest;
use crate::error::{ErrorCode, Result};
use crate::installer::InstallResult;
use crate::manifest::ModuleDescriptor;

/// Lifecycle of an install session.
///
/// ```text
/// REQUIRES_USER_CONFIRMATION -> PENDING -> DOWNLOADING -> DOWNLOADED -> INSTALLING -> POST_INSTALLED
///                                  |            |
///                                  +--------> CANCELING -> CANCELED
/// any non-terminal status -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    RequiresUserConfirmation,
    Downloading,
    Downloaded,
    Installing,
    PostInstalled,
    Canceling,
    Canceled,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::PostInstalled | SessionStatus::Canceled | SessionStatus::Failed
        )
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (RequiresUserConfirmation, Pending)
                | (RequiresUserConfirmation, Canceled)
                | (Pending, Downloading)
                | (Pending, Downloaded)
                | (Pending, Installing)
                | (Pending, Canceling)
                | (Pending, Canceled)
                | (Downloading, Downloaded)
                | (Downloading, Canceling)
                | (Downloading, Canceled)
                | (Downloaded, Installing)
                | (Installing, PostInstalled)
                | (Canceling, Canceled)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::RequiresUserConfirmation => "REQUIRES_USER_CONFIRMATION",
            SessionStatus::Downloading => "DOWNLOADING",
            SessionStatus::Downloaded => "DOWNLOADED",
            SessionStatus::Installing => "INSTALLING",
            SessionStatus::PostInstalled => "POST_INSTALLED",
            SessionStatus::Canceling => "CANCELING",
            SessionStatus::Canceled => "CANCELED",
            SessionStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Token the host hands back to continue or abort a session waiting for
/// the user's approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationHandle {
    pub session_id: u32,
    pub bytes_to_download: u64,
}

/// Snapshot of a session, as broadcast to listeners and other processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: u32,
    pub status: SessionStatus,
    pub error_code: ErrorCode,
    pub bytes_downloaded: u64,
    pub total_bytes_to_download: u64,
    pub module_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_handle: Option<ConfirmationHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_artifacts: Option<Vec<InstallResult>>,
}

impl SessionState {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One in-flight install request.
#[derive(Debug, Clone)]
pub struct InstallSession {
    pub(super) id: u32,
    pub(super) modules: Vec<ModuleDescriptor>,
    pub(super) requests: Vec<DownloadRequest>,
    pub(super) status: SessionStatus,
    pub(super) error_code: ErrorCode,
    pub(super) bytes_downloaded: u64,
    pub(super) total_bytes: u64,
    pub(super) confirmation: Option<ConfirmationHandle>,
    pub(super) results: Vec<InstallResult>,
}

impl InstallSession {
    pub fn new(
        id: u32,
        status: SessionStatus,
        modules: Vec<ModuleDescriptor>,
        requests: Vec<DownloadRequest>,
        total_bytes: u64,
    ) -> Self {
        let confirmation = (status == SessionStatus::RequiresUserConfirmation).then(|| ConfirmationHandle {
            session_id: id,
            bytes_to_download: requests.iter().map(|r| r.size).sum(),
        });
        Self {
            id,
            modules,
            requests,
            status,
            error_code: ErrorCode::NoError,
            bytes_downloaded: 0,
            total_bytes,
            confirmation,
            results: Vec::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn modules(&self) -> &[ModuleDescriptor] {
        &self.modules
    }

    pub fn requests(&self) -> &[DownloadRequest] {
        &self.requests
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    pub fn targets_any(&self, names: &[String]) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| names.contains(&m.name))
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn snapshot(&self) -> SessionState {
        SessionState {
            session_id: self.id,
            status: self.status,
            error_code: self.error_code,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes_to_download: self.total_bytes,
            module_names: self.module_names(),
            confirmation_handle: self.confirmation.clone(),
            result_artifacts: (!self.results.is_empty()).then(|| self.results.clone()),
        }
    }
}

/// Session id derived from the requested modules: stable for the same
/// set, never zero.
pub fn session_id_for(modules: &[ModuleDescriptor]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut keys: Vec<String> = modules.iter().map(|m| format!("{}@{}", m.name, m.version)).collect();
    keys.sort();
    keys.dedup();

    let mut hash = FNV_OFFSET;
    for key in &keys {
        for byte in key.bytes().chain(std::iter::once(0)) {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }

    match hash & 0x7fff_ffff {
        0 => 1,
        id => id,
    }
}
