use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error codes surfaced to the host process.
///
/// Request errors come back synchronously from the orchestrator, transport and
/// artifact errors arrive through the session-state broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ErrorCode {
    NoError,
    ActiveSessionsLimitExceeded,
    ModuleUnavailable,
    InvalidRequest,
    SessionNotFound,
    NetworkError,
    AccessDenied,
    IncompatibleWithExistingSession,
    DownloadFailed,
    ApkFileIllegal,
    SignatureMismatch,
    Md5Error,
    LibExtractFailed,
    DexExtractFailed,
    MarkCreateFailed,
    BuiltinSplitApkCopiedFailed,
    InternalError,
}

impl ErrorCode {
    pub fn value(self) -> i32 {
        match self {
            ErrorCode::NoError => 0,
            ErrorCode::ActiveSessionsLimitExceeded => -1,
            ErrorCode::ModuleUnavailable => -2,
            ErrorCode::InvalidRequest => -3,
            ErrorCode::SessionNotFound => -4,
            ErrorCode::NetworkError => -6,
            ErrorCode::AccessDenied => -7,
            ErrorCode::IncompatibleWithExistingSession => -8,
            ErrorCode::DownloadFailed => -10,
            ErrorCode::ApkFileIllegal => -11,
            ErrorCode::SignatureMismatch => -12,
            ErrorCode::Md5Error => -13,
            ErrorCode::LibExtractFailed => -21,
            ErrorCode::DexExtractFailed => -22,
            ErrorCode::MarkCreateFailed => -41,
            ErrorCode::BuiltinSplitApkCopiedFailed => -98,
            ErrorCode::InternalError => -100,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        let code = match value {
            0 => ErrorCode::NoError,
            -1 => ErrorCode::ActiveSessionsLimitExceeded,
            -2 => ErrorCode::ModuleUnavailable,
            -3 => ErrorCode::InvalidRequest,
            -4 => ErrorCode::SessionNotFound,
            -6 => ErrorCode::NetworkError,
            -7 => ErrorCode::AccessDenied,
            -8 => ErrorCode::IncompatibleWithExistingSession,
            -10 => ErrorCode::DownloadFailed,
            -11 => ErrorCode::ApkFileIllegal,
            -12 => ErrorCode::SignatureMismatch,
            -13 => ErrorCode::Md5Error,
            -21 => ErrorCode::LibExtractFailed,
            -22 => ErrorCode::DexExtractFailed,
            -41 => ErrorCode::MarkCreateFailed,
            -98 => ErrorCode::BuiltinSplitApkCopiedFailed,
            -100 => ErrorCode::InternalError,
            _ => return None,
        };
        Some(code)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> i32 {
        code.value()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        ErrorCode::from_value(value).ok_or_else(|| format!("unknown error code {}", value))
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

#[derive(Error, Debug)]
pub enum SplitError {
    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Module unavailable: {name}")]
    ModuleUnavailable { name: String },

    #[error("Session not found: {0}")]
    SessionNotFound(u32),

    #[error("Another session is already downloading")]
    ActiveSessionsLimitExceeded,

    #[error("Modules {modules:?} are already targeted by session {session_id}")]
    IncompatibleWithExistingSession { session_id: u32, modules: Vec<String> },

    #[error("No network available, {bytes} bytes still need to be downloaded")]
    NetworkUnavailable { bytes: u64 },

    // Transport errors
    #[error("Download failed for session {session_id}: {reason}")]
    DownloadFailed { session_id: u32, reason: String },

    // Artifact errors
    #[error("Package for {module} is missing or empty: {}", path.display())]
    ApkFileIllegal { module: String, path: PathBuf },

    #[error("Signature of {module} does not match the host certificates")]
    SignatureMismatch { module: String },

    #[error("Checksum mismatch for {module}")]
    ChecksumMismatch { module: String },

    #[error("Failed to extract native libraries of {module}: {reason}")]
    LibExtractFailed { module: String, reason: String },

    #[error("Failed to extract code archives of {module}: {reason}")]
    DexExtractFailed { module: String, reason: String },

    #[error("Failed to create installed marker for {module}: {source}")]
    MarkCreateFailed {
        module: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to materialize bundled package of {module}: {reason}")]
    BundledCopyFailed { module: String, reason: String },

    // Internal errors
    #[error("Invalid manifest: {message}")]
    InvalidManifest { message: String },

    #[error("Failed to parse manifest: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Timed out waiting for lock {}", path.display())]
    LockTimeout { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SplitError {
    /// The numeric code reported to the host for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SplitError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SplitError::ModuleUnavailable { .. } => ErrorCode::ModuleUnavailable,
            SplitError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            SplitError::ActiveSessionsLimitExceeded => ErrorCode::ActiveSessionsLimitExceeded,
            SplitError::IncompatibleWithExistingSession { .. } => {
                ErrorCode::IncompatibleWithExistingSession
            }
            SplitError::NetworkUnavailable { .. } => ErrorCode::NetworkError,
            SplitError::DownloadFailed { .. } => ErrorCode::DownloadFailed,
            SplitError::ApkFileIllegal { .. } => ErrorCode::ApkFileIllegal,
            SplitError::SignatureMismatch { .. } => ErrorCode::SignatureMismatch,
            SplitError::ChecksumMismatch { .. } => ErrorCode::Md5Error,
            SplitError::LibExtractFailed { .. } => ErrorCode::LibExtractFailed,
            SplitError::DexExtractFailed { .. } => ErrorCode::DexExtractFailed,
            SplitError::MarkCreateFailed { .. } => ErrorCode::MarkCreateFailed,
            SplitError::BundledCopyFailed { .. } => ErrorCode::BuiltinSplitApkCopiedFailed,
            SplitError::InvalidManifest { .. }
            | SplitError::JsonParse(_)
            | SplitError::Archive(_)
            | SplitError::LockTimeout { .. }
            | SplitError::Config(_)
            | SplitError::Io(_) => ErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, SplitError>;
