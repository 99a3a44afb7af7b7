//! Error types for the download engine.
//!
//! Every failure surfaced by the engine maps onto one taxonomy variant with a
//! stable wire code. The code string is what callers of the tool facade see in
//! `error.code`; the display text is a human-readable description owned by
//! this crate, never a raw message from an underlying library.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result type for download engine operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors surfaced by the download engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Connection, DNS, or TLS level failure.
    #[error("network error while contacting {url}: {detail}")]
    Network { url: String, detail: String },

    /// An HTTP attempt exceeded its configured timeout.
    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// Server responded with a 5xx status.
    #[error("server error {status} from {url}")]
    Server5xx { url: String, status: u16 },

    /// Server responded with a non-retryable 4xx status.
    #[error("client error {status} from {url}")]
    Client4xx { url: String, status: u16 },

    /// Server ignored or rejected a byte-range request.
    #[error("server did not honour range request for {url}")]
    RangeNotSatisfiable { url: String },

    /// Redirect chain exceeded the configured cap.
    #[error("too many redirects (limit {limit}) following {url}")]
    TooManyRedirects { url: String, limit: usize },

    /// Redirect response carried a missing or unparseable Location.
    #[error("invalid redirect from {url}: {detail}")]
    InvalidRedirect { url: String, detail: String },

    /// A file or directory was not found.
    #[error("file not found: {path}")]
    FsNotFound { path: PathBuf },

    /// Permission denied on a filesystem operation.
    #[error("permission denied: {path}")]
    FsPermission { path: PathBuf },

    /// The filesystem ran out of space.
    #[error("out of disk space writing {path}")]
    FsOutOfSpace { path: PathBuf },

    /// Any other filesystem failure.
    #[error("filesystem error on {path}: {detail}")]
    FsOther { path: PathBuf, detail: String },

    /// Final digest did not match the expected checksum.
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Requested hash algorithm is not supported.
    #[error("unsupported hash algorithm: {name}")]
    UnsupportedAlgorithm { name: String },

    /// Requested task state transition is not allowed.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    /// No task registered under the given id.
    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Process-wide concurrent task limit reached.
    #[error("download queue is full ({limit} tasks already downloading)")]
    QueueFull { limit: usize },

    /// Configuration failed validation.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// Segmentation inputs were inconsistent.
    #[error("invalid segmentation plan: {detail}")]
    InvalidPlan { detail: String },

    /// Merging part files into the output failed.
    #[error("merge failed: {detail}")]
    MergeError { detail: String },

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Stable wire code for this error, surfaced as `error.code` by the facade.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Network { .. } => "Network",
            Self::Timeout { .. } => "Timeout",
            Self::Server5xx { .. } => "Server5xx",
            Self::Client4xx { .. } => "Client4xx",
            Self::RangeNotSatisfiable { .. } => "RangeNotSatisfiable",
            Self::TooManyRedirects { .. } => "TooManyRedirects",
            Self::InvalidRedirect { .. } => "InvalidRedirect",
            Self::FsNotFound { .. } => "FileSystemNotFound",
            Self::FsPermission { .. } => "FileSystemPermission",
            Self::FsOutOfSpace { .. } => "FileSystemOutOfSpace",
            Self::FsOther { .. } => "FileSystemOther",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::UnsupportedAlgorithm { .. } => "UnsupportedAlgorithm",
            Self::InvalidStateTransition { .. } => "InvalidStateTransition",
            Self::TaskNotFound { .. } => "TaskNotFound",
            Self::QueueFull { .. } => "QueueFull",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::InvalidPlan { .. } => "InvalidPlan",
            Self::MergeError { .. } => "MergeError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Whether a failed attempt with this error may be retried.
    ///
    /// Timeouts, network failures, and 5xx responses are transient. 408 and
    /// 429 are the only retryable client statuses. Permission and disk-space
    /// failures are permanent; other filesystem errors are treated as
    /// transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network { .. } | Self::Server5xx { .. } => true,
            Self::Client4xx { status, .. } => *status == 408 || *status == 429,
            Self::FsOther { .. } => true,
            _ => false,
        }
    }

    /// Classify an I/O error against the path it occurred on.
    pub fn from_io(path: &std::path::Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::FsNotFound {
                path: path.to_path_buf(),
            },
            io::ErrorKind::PermissionDenied => Self::FsPermission {
                path: path.to_path_buf(),
            },
            _ if err.raw_os_error() == Some(ENOSPC) => Self::FsOutOfSpace {
                path: path.to_path_buf(),
            },
            _ => Self::FsOther {
                path: path.to_path_buf(),
                detail: err.to_string(),
            },
        }
    }

    /// Classify a reqwest error against the URL it was issued to.
    pub fn from_http(url: &str, timeout_ms: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
                timeout_ms,
            }
        } else if let Some(status) = err.status() {
            Self::from_status(url, status.as_u16())
        } else {
            Self::Network {
                url: url.to_string(),
                detail: err.to_string(),
            }
        }
    }

    /// Classify an unexpected HTTP status code.
    pub fn from_status(url: &str, status: u16) -> Self {
        match status {
            416 => Self::RangeNotSatisfiable {
                url: url.to_string(),
            },
            500..=599 => Self::Server5xx {
                url: url.to_string(),
                status,
            },
            _ => Self::Client4xx {
                url: url.to_string(),
                status,
            },
        }
    }
}

#[cfg(target_os = "windows")]
const ENOSPC: i32 = 112;
#[cfg(not(target_os = "windows"))]
const ENOSPC: i32 = 28;
