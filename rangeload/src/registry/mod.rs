//! Process-wide task registry.
//!
//! Maps task ids to their [`TaskRecord`]s, hands out copy-on-read snapshots
//! to observers, and persists the whole set to `tasks.json` after every
//! mutation so a restart can pick up where the process left off. The file is
//! replaced atomically (write temp, rename), matching the resume store's
//! crash-safety.
//!
//! Only the orchestrator mutates the registry; everything the tool facade
//! reads goes through [`TaskRegistry::get`] / [`TaskRegistry::list`] and
//! sees a consistent snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::task::{Status, TaskId, TaskRecord};

/// Default file name for the persisted task list.
pub const TASKS_FILE: &str = "tasks.json";

/// Aggregate counters returned by [`TaskRegistry::stats`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Bytes downloaded across all tasks, terminal ones included.
    pub total_downloaded_bytes: u64,
}

/// One page of a filtered task listing.
#[derive(Debug, Clone)]
pub struct TaskPage {
    pub tasks: Vec<TaskRecord>,
    pub total: usize,
    pub has_more: bool,
}

/// In-memory task map with JSON persistence.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, TaskRecord>>,
    save_path: Option<PathBuf>,
}

impl TaskRegistry {
    /// Registry without persistence (tests, temporary engines).
    pub fn in_memory() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            save_path: None,
        }
    }

    /// Open a registry backed by `path`, loading any existing task list.
    ///
    /// An absent file is a cold start with an empty registry; an unreadable
    /// file is logged and treated the same rather than refusing to start.
    pub async fn open(path: impl Into<PathBuf>) -> DownloadResult<Self> {
        let path = path.into();
        let tasks = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<TaskRecord>>(&bytes) {
                Ok(records) => records.into_iter().map(|r| (r.id.clone(), r)).collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable task list");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(DownloadError::from_io(&path, e)),
        };
        debug!(path = %path.display(), count = tasks.len(), "task registry loaded");
        Ok(Self {
            tasks: Mutex::new(tasks),
            save_path: Some(path),
        })
    }

    /// Register a new task.
    pub async fn insert(&self, record: TaskRecord) -> DownloadResult<()> {
        {
            let mut tasks = self.tasks.lock().await;
            tasks.insert(record.id.clone(), record);
        }
        self.save().await
    }

    /// Snapshot of one task.
    pub async fn get(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Apply a mutation to one task and persist, returning the new snapshot.
    pub async fn update<F>(&self, task_id: &TaskId, mutate: F) -> DownloadResult<TaskRecord>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let snapshot = {
            let mut tasks = self.tasks.lock().await;
            let record = tasks
                .get_mut(task_id)
                .ok_or_else(|| DownloadError::TaskNotFound {
                    task_id: task_id.to_string(),
                })?;
            mutate(record);
            record.updated_at = Utc::now();
            record.clone()
        };
        self.save().await?;
        Ok(snapshot)
    }

    /// Remove a task outright (temporary work mode, explicit delete).
    pub async fn remove(&self, task_id: &TaskId) -> DownloadResult<Option<TaskRecord>> {
        let removed = self.tasks.lock().await.remove(task_id);
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Filtered, paginated listing ordered by creation time (oldest first).
    pub async fn list(&self, status: Option<Status>, limit: usize, offset: usize) -> TaskPage {
        let tasks = self.tasks.lock().await;
        let mut matching: Vec<&TaskRecord> = tasks
            .values()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });

        let total = matching.len();
        let page: Vec<TaskRecord> = matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        let has_more = offset + page.len() < total;
        TaskPage {
            tasks: page,
            total,
            has_more,
        }
    }

    /// Number of tasks currently in `Downloading`.
    pub async fn downloading_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|r| r.status == Status::Downloading)
            .count()
    }

    /// Aggregate counters across all tasks.
    pub async fn stats(&self) -> RegistryStats {
        let tasks = self.tasks.lock().await;
        let mut stats = RegistryStats {
            total: tasks.len(),
            ..Default::default()
        };
        for record in tasks.values() {
            match record.status {
                Status::Pending => stats.pending += 1,
                Status::Downloading => stats.downloading += 1,
                Status::Paused => stats.paused += 1,
                Status::Completed => stats.completed += 1,
                Status::Failed => stats.failed += 1,
                Status::Cancelled => stats.cancelled += 1,
            }
            stats.total_downloaded_bytes += record.progress.downloaded_size;
        }
        stats
    }

    /// Drop every task in a terminal `Completed` state. Returns the count
    /// removed.
    pub async fn clear_completed(&self) -> DownloadResult<usize> {
        let removed = {
            let mut tasks = self.tasks.lock().await;
            let before = tasks.len();
            tasks.retain(|_, r| r.status != Status::Completed);
            before - tasks.len()
        };
        if removed > 0 {
            self.save().await?;
        }
        Ok(removed)
    }

    /// Persist the current task set, if a save path is configured.
    pub async fn save(&self) -> DownloadResult<()> {
        let Some(path) = &self.save_path else {
            return Ok(());
        };
        let records: Vec<TaskRecord> = {
            let tasks = self.tasks.lock().await;
            let mut records: Vec<TaskRecord> = tasks.values().cloned().collect();
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            records
        };
        write_atomic(path, &records).await
    }
}

async fn write_atomic(path: &Path, records: &[TaskRecord]) -> DownloadResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::from_io(parent, e))?;
    }
    let json = serde_json::to_vec_pretty(records).map_err(|e| DownloadError::FsOther {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &json)
        .await
        .map_err(|e| DownloadError::from_io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| DownloadError::from_io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use tempfile::TempDir;

    fn record(url: &str) -> TaskRecord {
        TaskRecord::new(DownloadConfig::new(url, "/tmp/out"))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let registry = TaskRegistry::in_memory();
        let rec = record("http://host/a.bin");
        let id = rec.id.clone();
        registry.insert(rec).await.unwrap();

        let snapshot = registry.get(&id).await.unwrap();
        assert_eq!(snapshot.config.url, "http://host/a.bin");
        assert_eq!(snapshot.status, Status::Pending);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let registry = TaskRegistry::in_memory();
        let err = registry
            .update(&TaskId::new(), |_| {})
            .await
            .unwrap_err();
        assert_eq!(err.code(), "TaskNotFound");
    }

    #[tokio::test]
    async fn test_update_bumps_updated_at() {
        let registry = TaskRegistry::in_memory();
        let rec = record("http://host/a.bin");
        let id = rec.id.clone();
        let created = rec.updated_at;
        registry.insert(rec).await.unwrap();

        let snapshot = registry
            .update(&id, |r| r.status = Status::Downloading)
            .await
            .unwrap();
        assert_eq!(snapshot.status, Status::Downloading);
        assert!(snapshot.updated_at >= created);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let registry = TaskRegistry::in_memory();
        for i in 0..3 {
            registry
                .insert(record(&format!("http://host/{i}.bin")))
                .await
                .unwrap();
        }
        let one = record("http://host/done.bin");
        let done_id = one.id.clone();
        registry.insert(one).await.unwrap();
        registry
            .update(&done_id, |r| r.status = Status::Completed)
            .await
            .unwrap();

        let page = registry.list(Some(Status::Pending), 10, 0).await;
        assert_eq!(page.total, 3);
        assert!(!page.has_more);

        let page = registry.list(Some(Status::Completed), 10, 0).await;
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let registry = TaskRegistry::in_memory();
        for i in 0..5 {
            registry
                .insert(record(&format!("http://host/{i}.bin")))
                .await
                .unwrap();
        }

        let page = registry.list(None, 2, 0).await;
        assert_eq!(page.tasks.len(), 2);
        assert_eq!(page.total, 5);
        assert!(page.has_more);

        let page = registry.list(None, 2, 4).await;
        assert_eq!(page.tasks.len(), 1);
        assert!(!page.has_more);

        let page = registry.list(None, 2, 10).await;
        assert!(page.tasks.is_empty());
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_stats() {
        let registry = TaskRegistry::in_memory();
        let a = record("http://host/a.bin");
        let a_id = a.id.clone();
        registry.insert(a).await.unwrap();
        registry.insert(record("http://host/b.bin")).await.unwrap();
        registry
            .update(&a_id, |r| {
                r.status = Status::Downloading;
                r.progress.downloaded_size = 1234;
            })
            .await
            .unwrap();

        let stats = registry.stats().await;
        assert_eq!(stats.total, 2);
        assert_eq!(stats.downloading, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total_downloaded_bytes, 1234);
    }

    #[tokio::test]
    async fn test_downloading_count() {
        let registry = TaskRegistry::in_memory();
        let rec = record("http://host/a.bin");
        let id = rec.id.clone();
        registry.insert(rec).await.unwrap();
        assert_eq!(registry.downloading_count().await, 0);

        registry
            .update(&id, |r| r.status = Status::Downloading)
            .await
            .unwrap();
        assert_eq!(registry.downloading_count().await, 1);
    }

    #[tokio::test]
    async fn test_clear_completed() {
        let registry = TaskRegistry::in_memory();
        let a = record("http://host/a.bin");
        let a_id = a.id.clone();
        registry.insert(a).await.unwrap();
        registry.insert(record("http://host/b.bin")).await.unwrap();
        registry
            .update(&a_id, |r| r.status = Status::Completed)
            .await
            .unwrap();

        let removed = registry.clear_completed().await.unwrap();
        assert_eq!(removed, 1);
        assert!(registry.get(&a_id).await.is_none());
        assert_eq!(registry.stats().await.total, 1);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join(TASKS_FILE);

        let rec = record("http://host/a.bin");
        let id = rec.id.clone();
        {
            let registry = TaskRegistry::open(&path).await.unwrap();
            registry.insert(rec).await.unwrap();
            registry
                .update(&id, |r| r.status = Status::Paused)
                .await
                .unwrap();
        }

        let reloaded = TaskRegistry::open(&path).await.unwrap();
        let snapshot = reloaded.get(&id).await.unwrap();
        assert_eq!(snapshot.status, Status::Paused);
    }

    #[tokio::test]
    async fn test_cold_start_empty() {
        let temp = TempDir::new().unwrap();
        let registry = TaskRegistry::open(temp.path().join(TASKS_FILE)).await.unwrap();
        assert_eq!(registry.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_corrupt_state_file_tolerated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TASKS_FILE);
        tokio::fs::write(&path, b"{{{{").await.unwrap();

        let registry = TaskRegistry::open(&path).await.unwrap();
        assert_eq!(registry.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = TaskRegistry::in_memory();
        let rec = record("http://host/a.bin");
        let id = rec.id.clone();
        registry.insert(rec).await.unwrap();

        let removed = registry.remove(&id).await.unwrap();
        assert!(removed.is_some());
        assert!(registry.get(&id).await.is_none());
        assert!(registry.remove(&id).await.unwrap().is_none());
    }
}
