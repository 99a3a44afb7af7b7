//! Task and segment domain types.
//!
//! A download is tracked as one [`TaskRecord`] holding its immutable
//! [`DownloadConfig`](crate::config::DownloadConfig), current [`Status`],
//! aggregated [`Progress`], and the server metadata captured at probe time.
//! The byte range of the remote resource is partitioned into [`Segment`]s,
//! each owned by exactly one worker while downloading.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::error::{DownloadError, DownloadResult};

/// Opaque, durable identifier for one download task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wrap an existing id string (for lookups from the wire).
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state shared by tasks and segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl Status {
    /// Whether this state has no outgoing transitions besides explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the transition `self -> to` is allowed.
    ///
    /// `Failed -> Downloading` is permitted so an explicit retry through
    /// `start` can restart a failed task.
    pub fn can_transition(&self, to: Status) -> bool {
        use Status::*;
        matches!(
            (self, to),
            (Pending, Downloading)
                | (Pending, Cancelled)
                | (Downloading, Paused)
                | (Downloading, Completed)
                | (Downloading, Failed)
                | (Downloading, Cancelled)
                | (Paused, Downloading)
                | (Paused, Cancelled)
                | (Failed, Downloading)
        )
    }

    /// Validate and perform a transition, or fail with the taxonomy error.
    pub fn transition(&mut self, to: Status) -> DownloadResult<()> {
        if !self.can_transition(to) {
            return Err(DownloadError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            });
        }
        *self = to;
        Ok(())
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One contiguous byte range of the remote resource.
///
/// `start` and `end` are inclusive offsets. The segment id is stable for the
/// life of the task; rebalancing assigns new ids to child segments rather
/// than reusing the parent's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub start: u64,
    pub end: u64,
    /// Bytes already written to the part file, always `<= len()`.
    pub downloaded: u64,
    pub status: Status,
    pub part_path: PathBuf,
    /// Digest of the part file once the segment completed.
    pub checksum: Option<String>,
    pub retry_count: u32,
}

impl Segment {
    /// Create a pending segment covering `[start, end]`.
    pub fn new(id: impl Into<String>, start: u64, end: u64, part_path: PathBuf) -> Self {
        Self {
            id: id.into(),
            start,
            end,
            downloaded: 0,
            status: Status::Pending,
            part_path,
            checksum: None,
            retry_count: 0,
        }
    }

    /// Total length of the range in bytes.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Bytes still to fetch.
    pub fn remaining(&self) -> u64 {
        self.byte_len().saturating_sub(self.downloaded)
    }

    /// Next byte offset to request from the server.
    pub fn resume_offset(&self) -> u64 {
        self.start + self.downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.status == Status::Completed
    }
}

/// Metadata captured from the HEAD probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMetadata {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub accept_ranges: bool,
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

/// Aggregated progress derived from the segment set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Progress {
    pub total_size: u64,
    /// Sum of per-segment downloaded counters.
    pub downloaded_size: u64,
    /// Fraction complete in `[0, 100]`.
    pub percentage: f64,
    /// Rolling-window speed in bytes per second.
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
    /// Segments ordered by start offset.
    pub segments: Vec<Segment>,
}

impl Progress {
    /// Recompute the derived fields from the segment set.
    pub fn recompute(&mut self) {
        self.downloaded_size = self.segments.iter().map(|s| s.downloaded).sum();
        self.percentage = if self.total_size == 0 {
            if self.segments.iter().all(Segment::is_complete) {
                100.0
            } else {
                0.0
            }
        } else {
            (self.downloaded_size as f64 / self.total_size as f64) * 100.0
        };
        self.eta_seconds = if self.speed_bps > 0.0 {
            let remaining = self.total_size.saturating_sub(self.downloaded_size);
            Some((remaining as f64 / self.speed_bps).ceil() as u64)
        } else {
            None
        };
    }
}

/// Terminal failure recorded on a task, surfaced via `get_download_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    /// Stable taxonomy code, e.g. `ChecksumMismatch`.
    pub code: String,
    pub message: String,
}

impl From<&DownloadError> for TaskError {
    fn from(err: &DownloadError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Full record of one download task as held by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub config: DownloadConfig,
    pub status: Status,
    pub progress: Progress,
    pub server_metadata: ServerMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<TaskError>,
}

impl TaskRecord {
    /// Create a fresh `Pending` record for the given config.
    pub fn new(config: DownloadConfig) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            config,
            status: Status::Pending,
            progress: Progress::default(),
            server_metadata: ServerMetadata::default(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Effective output filename: the configured override, else the last path
    /// component of the URL, else `"download"`.
    pub fn filename(&self) -> String {
        if let Some(name) = &self.config.filename {
            return name.clone();
        }
        suggested_filename(&self.config.url)
    }

    /// Full path of the merged output file.
    pub fn output_file(&self) -> PathBuf {
        self.config.output_path.join(self.filename())
    }

    /// Path of the part file for segment index `k`.
    pub fn part_path(&self, index: usize) -> PathBuf {
        let file = self.output_file();
        let mut name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        name.push_str(&format!(".part{index}"));
        file.with_file_name(name)
    }
}

/// Derive a filename from a URL's last path segment, falling back to
/// `"download"` when the URL has no usable one.
pub fn suggested_filename(url: &str) -> String {
    let candidate = url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string)
        })
        .unwrap_or_default();
    if candidate.is_empty() {
        "download".to_string()
    } else {
        candidate
    }
}
