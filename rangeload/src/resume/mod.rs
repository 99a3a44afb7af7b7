//! Durable resume records.
//!
//! One JSON file per task under the store directory captures everything a
//! restart needs to continue a download: the segment partition with its
//! per-segment byte counters, and the server validators (etag,
//! last-modified) the partition was planned against. Writes go through a
//! temp file and an atomic rename so a crash never leaves a truncated
//! record.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::task::{Segment, ServerMetadata, TaskId};

/// Current record schema version.
pub const RESUME_VERSION: u32 = 1;

/// Default directory name for resume records.
pub const DEFAULT_RESUME_DIR: &str = ".download-resume";

/// Default retention for stale records (7 days).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Persisted snapshot of a task's remaining work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub version: u32,
    pub task_id: TaskId,
    pub url: String,
    pub output_path: PathBuf,
    pub total_size: u64,
    pub segments: Vec<Segment>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeRecord {
    /// Build a record for the given task state.
    pub fn new(
        task_id: TaskId,
        url: impl Into<String>,
        output_path: PathBuf,
        total_size: u64,
        segments: Vec<Segment>,
        metadata: &ServerMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: RESUME_VERSION,
            task_id,
            url: url.into(),
            output_path,
            total_size,
            segments,
            etag: metadata.etag.clone(),
            last_modified: metadata.last_modified.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of per-segment downloaded counters.
    pub fn downloaded(&self) -> u64 {
        self.segments.iter().map(|s| s.downloaded).sum()
    }

    /// Check the structural invariants: segments ordered by start, exactly
    /// partitioning `[0, total_size)`, each counter within its range.
    fn invariants_hold(&self) -> bool {
        if self.total_size == 0 {
            return true;
        }
        if self.segments.is_empty() {
            return false;
        }
        if self.segments[0].start != 0 {
            return false;
        }
        if self.segments.last().map(|s| s.end) != Some(self.total_size - 1) {
            return false;
        }
        for pair in self.segments.windows(2) {
            if pair[0].end + 1 != pair[1].start {
                return false;
            }
        }
        self.segments.iter().all(|s| s.downloaded <= s.byte_len())
    }
}

/// Why a resume record cannot be applied to a live task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeRejection {
    UrlChanged,
    SizeChanged,
    ValidatorChanged,
    PartFileMissing(String),
    CorruptRecord,
}

impl std::fmt::Display for ResumeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UrlChanged => f.write_str("url changed"),
            Self::SizeChanged => f.write_str("content length changed"),
            Self::ValidatorChanged => f.write_str("etag or last-modified changed"),
            Self::PartFileMissing(id) => write!(f, "part file missing for {id}"),
            Self::CorruptRecord => f.write_str("record violates segment invariants"),
        }
    }
}

/// Directory-backed store of resume records.
#[derive(Debug, Clone)]
pub struct ResumeStore {
    dir: PathBuf,
}

impl ResumeStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> DownloadResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::from_io(&dir, e))?;
        Ok(Self { dir })
    }

    /// The store's root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{task_id}.resume.json"))
    }

    /// Persist a record atomically (write temp, then rename into place).
    pub async fn save(&self, record: &ResumeRecord) -> DownloadResult<()> {
        let path = self.record_path(&record.task_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record).map_err(|e| DownloadError::FsOther {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| DownloadError::from_io(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| DownloadError::from_io(&path, e))?;
        Ok(())
    }

    /// Load the record for a task, if one exists and parses.
    ///
    /// A record that fails to parse is treated as absent and removed; the
    /// download simply starts over.
    pub async fn load(&self, task_id: &TaskId) -> DownloadResult<Option<ResumeRecord>> {
        let path = self.record_path(task_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DownloadError::from_io(&path, e)),
        };
        match serde_json::from_slice::<ResumeRecord>(&bytes) {
            Ok(record) if record.version == RESUME_VERSION => Ok(Some(record)),
            Ok(record) => {
                warn!(
                    task_id = %task_id,
                    version = record.version,
                    "discarding resume record with unknown version"
                );
                self.cleanup(task_id).await?;
                Ok(None)
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "discarding unreadable resume record");
                self.cleanup(task_id).await?;
                Ok(None)
            }
        }
    }

    /// Remove a task's record. Missing records are not an error.
    pub async fn cleanup(&self, task_id: &TaskId) -> DownloadResult<()> {
        let path = self.record_path(task_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::from_io(&path, e)),
        }
    }

    /// List the task ids with a stored record.
    pub async fn list(&self) -> DownloadResult<Vec<TaskId>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| DownloadError::from_io(&self.dir, e))?;
        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::from_io(&self.dir, e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".resume.json") {
                ids.push(TaskId::from_string(id));
            }
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(ids)
    }

    /// Remove records not updated within `max_age`. Returns how many were
    /// removed.
    pub async fn cleanup_expired(&self, max_age: Duration) -> DownloadResult<usize> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let mut removed = 0;
        for task_id in self.list().await? {
            if let Some(record) = self.load(&task_id).await? {
                if record.updated_at < cutoff {
                    debug!(task_id = %task_id, "removing expired resume record");
                    self.cleanup(&task_id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Decide whether a stored record still applies against a fresh probe.
    ///
    /// The record must reference the same URL, agree on total size, carry an
    /// unchanged etag when both sides have one (falling back to
    /// last-modified), satisfy the partition invariants, and every partially
    /// downloaded segment's part file must still exist with at least the
    /// recorded length. A rejected record is removed from the store.
    pub async fn validate(
        &self,
        record: &ResumeRecord,
        url: &str,
        head: &ServerMetadata,
    ) -> DownloadResult<Result<(), ResumeRejection>> {
        let rejection = self.check(record, url, head).await;
        if let Err(reason) = &rejection {
            warn!(task_id = %record.task_id, reason = %reason, "resume record is stale");
            self.cleanup(&record.task_id).await?;
        }
        Ok(rejection)
    }

    async fn check(
        &self,
        record: &ResumeRecord,
        url: &str,
        head: &ServerMetadata,
    ) -> Result<(), ResumeRejection> {
        if record.url != url {
            return Err(ResumeRejection::UrlChanged);
        }
        if let Some(length) = head.content_length {
            if length != record.total_size {
                return Err(ResumeRejection::SizeChanged);
            }
        }
        match (&record.etag, &head.etag) {
            (Some(stored), Some(fresh)) => {
                if stored != fresh {
                    return Err(ResumeRejection::ValidatorChanged);
                }
            }
            _ => {
                if let (Some(stored), Some(fresh)) = (&record.last_modified, &head.last_modified) {
                    if stored != fresh {
                        return Err(ResumeRejection::ValidatorChanged);
                    }
                }
            }
        }
        if !record.invariants_hold() {
            return Err(ResumeRejection::CorruptRecord);
        }
        for segment in &record.segments {
            if segment.downloaded == 0 {
                continue;
            }
            let len = tokio::fs::metadata(&segment.part_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            if len < segment.downloaded {
                return Err(ResumeRejection::PartFileMissing(segment.id.clone()));
            }
        }
        Ok(())
    }
}
