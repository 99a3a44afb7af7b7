//! Download task configuration.
//!
//! A [`DownloadConfig`] is immutable for the life of its task. All bounds are
//! enforced by [`DownloadConfig::validate`], which is called before a task is
//! registered; out-of-range values surface as `InvalidConfig` rather than
//! being silently clamped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, DownloadResult};
use crate::hash::HashAlgorithm;

/// Allowed range for per-task worker concurrency.
pub const MAX_CONCURRENCY_LIMIT: usize = 16;

/// Smallest permitted chunk size (1KB).
pub const MIN_CHUNK_SIZE: u64 = 1024;

/// Default chunk size (1MB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Smallest permitted per-attempt timeout.
pub const MIN_TIMEOUT_MS: u64 = 1000;

/// Default per-attempt timeout (30s).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Largest permitted retry count.
pub const MAX_RETRY_COUNT: u32 = 10;

/// How task creation interacts with the caller and with persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkMode {
    /// `create` waits for the task to reach a terminal state.
    Blocking,
    /// `create` schedules the download and returns immediately.
    NonBlocking,
    /// Like `NonBlocking`, and the task record plus resume data survive
    /// process restarts.
    Persistent,
    /// Like `NonBlocking`, but record and resume data are deleted once the
    /// task reaches a terminal state.
    Temporary,
}

impl Default for WorkMode {
    fn default() -> Self {
        Self::NonBlocking
    }
}

/// Integrity checking options for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityConfig {
    /// Digest algorithm for all hashing on this task.
    pub algorithm: HashAlgorithm,
    /// When set, the merged file's digest must equal this value.
    pub expected_checksum: Option<String>,
    /// Record a digest per completed segment.
    pub verify_segments: bool,
    /// Hash the merged output file after merge.
    pub verify_final: bool,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            expected_checksum: None,
            verify_segments: true,
            verify_final: true,
        }
    }
}

/// Immutable configuration of one download task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Absolute HTTP or HTTPS URL of the resource.
    pub url: String,
    /// Directory the merged file is written into; created if missing.
    pub output_path: PathBuf,
    /// Optional filename override; defaults to the URL's last path component.
    pub filename: Option<String>,
    pub max_concurrency: usize,
    pub chunk_size: u64,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub work_mode: WorkMode,
    pub enable_resume: bool,
    /// Extra request headers; keys are stored lowercase so lookups are
    /// case-insensitive.
    pub headers: BTreeMap<String, String>,
    /// Session whose cookies and defaults apply to this task's requests.
    pub session_id: Option<String>,
    pub integrity: IntegrityConfig,
}

impl DownloadConfig {
    /// Create a config with defaults for everything but url and output path.
    pub fn new(url: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            output_path: output_path.into(),
            filename: None,
            max_concurrency: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_count: 3,
            work_mode: WorkMode::default(),
            enable_resume: true,
            headers: BTreeMap::new(),
            session_id: None,
            integrity: IntegrityConfig::default(),
        }
    }

    /// Insert a header, normalizing the key to lowercase.
    pub fn with_header(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Check every configured bound.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` naming the first violated constraint.
    pub fn validate(&self) -> DownloadResult<()> {
        let url = url::Url::parse(&self.url).map_err(|_| DownloadError::InvalidConfig {
            detail: format!("url is not absolute: {}", self.url),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DownloadError::InvalidConfig {
                detail: format!("unsupported url scheme: {}", url.scheme()),
            });
        }
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY_LIMIT {
            return Err(DownloadError::InvalidConfig {
                detail: format!(
                    "max_concurrency must be in [1, {MAX_CONCURRENCY_LIMIT}], got {}",
                    self.max_concurrency
                ),
            });
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(DownloadError::InvalidConfig {
                detail: format!(
                    "chunk_size must be at least {MIN_CHUNK_SIZE} bytes, got {}",
                    self.chunk_size
                ),
            });
        }
        if self.timeout_ms < MIN_TIMEOUT_MS {
            return Err(DownloadError::InvalidConfig {
                detail: format!(
                    "timeout_ms must be at least {MIN_TIMEOUT_MS}, got {}",
                    self.timeout_ms
                ),
            });
        }
        if self.retry_count > MAX_RETRY_COUNT {
            return Err(DownloadError::InvalidConfig {
                detail: format!(
                    "retry_count must be at most {MAX_RETRY_COUNT}, got {}",
                    self.retry_count
                ),
            });
        }
        if let Some(name) = &self.filename {
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(DownloadError::InvalidConfig {
                    detail: format!("filename must be a bare file name, got {name:?}"),
                });
            }
        }
        if let Some(expected) = &self.integrity.expected_checksum {
            if expected.is_empty() || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(DownloadError::InvalidConfig {
                    detail: "expected_checksum must be a hex string".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Maximum HTTP attempts per segment: the initial try plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.retry_count + 1
    }
}
