//! Download orchestrator.
//!
//! One orchestrator owns the whole engine: it registers tasks, probes
//! servers, adopts or plans segment partitions, runs the per-task worker
//! pool, aggregates progress events, merges part files, and drives the task
//! state machine. Workers never reference the orchestrator back; they only
//! send [`WorkerEvent`]s over the channel the supervisor loop owns.
//!
//! # Per-task flow
//!
//! ```text
//! create ──► registry (Pending)
//! start  ──► probe (HEAD) ──► resume-adopt | plan ──► N workers
//!                                    │
//!            events: ProgressTick / SegmentCompleted / SegmentFailed
//!                                    │
//!            all complete ──► merge ──► final digest ──► Completed
//! ```
//!
//! Pause and cancel share the cancellation path: both flip the task's
//! cancellation token and wait for workers to quiesce; pause keeps part
//! files and the resume record, cancel deletes both.

mod merge;

pub use merge::merge_parts;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DownloadConfig, WorkMode};
use crate::error::{DownloadError, DownloadResult};
use crate::hash::{verify_file, StreamingHasher};
use crate::planner::{self, SegmentationLimits};
use crate::progress::SpeedWindow;
use crate::registry::{RegistryStats, TaskPage, TaskRegistry, TASKS_FILE};
use crate::resume::{ResumeRecord, ResumeStore, DEFAULT_MAX_AGE, DEFAULT_RESUME_DIR};
use crate::session::SessionManager;
use crate::task::{Segment, Status, TaskError, TaskId, TaskRecord};
use crate::worker::{BackoffPolicy, SegmentWorker, WorkerEvent};

/// Process-wide ceiling on tasks in `Downloading` at once.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

/// Resume-record and registry persistence throttle during streaming.
const PERSIST_INTERVAL: Duration = Duration::from_millis(500);

/// How many times a failed segment may be split or reassigned per task
/// before the task itself fails.
const MAX_SEGMENT_REASSIGNMENTS: u32 = 3;

/// Poll interval for blocking-mode waits.
const BLOCKING_POLL_INTERVAL: Duration = Duration::from_millis(50);

const INTENT_RUN: u8 = 0;
const INTENT_PAUSE: u8 = 1;
const INTENT_CANCEL: u8 = 2;

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding `tasks.json` and (by default) the resume store.
    pub work_dir: PathBuf,
    /// Directory for resume records.
    pub resume_dir: PathBuf,
    pub max_concurrent_tasks: usize,
}

impl OrchestratorConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let resume_dir = work_dir.join(DEFAULT_RESUME_DIR);
        Self {
            work_dir,
            resume_dir,
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }

    pub fn with_max_concurrent_tasks(mut self, limit: usize) -> Self {
        self.max_concurrent_tasks = limit;
        self
    }
}

/// Handle to one live task's supervisor.
struct RunningTask {
    cancel: CancellationToken,
    intent: Arc<AtomicU8>,
    handle: JoinHandle<()>,
}

/// How the worker pool ended.
enum Ended {
    Completed,
    Stopped(u8),
    Failed(DownloadError),
}

/// The download engine.
pub struct DownloadOrchestrator {
    registry: Arc<TaskRegistry>,
    resume_store: ResumeStore,
    sessions: Arc<SessionManager>,
    client: reqwest::Client,
    running: Mutex<HashMap<TaskId, RunningTask>>,
    max_concurrent_tasks: usize,
}

impl DownloadOrchestrator {
    /// Start the engine: load the registry, open the resume store, and sweep
    /// expired resume records.
    pub async fn new(
        config: OrchestratorConfig,
        sessions: Arc<SessionManager>,
    ) -> DownloadResult<Arc<Self>> {
        let registry = Arc::new(TaskRegistry::open(config.work_dir.join(TASKS_FILE)).await?);
        let resume_store = ResumeStore::open(&config.resume_dir).await?;

        let swept = resume_store.cleanup_expired(DEFAULT_MAX_AGE).await?;
        if swept > 0 {
            info!(count = swept, "swept expired resume records at startup");
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Arc::new(Self {
            registry,
            resume_store,
            sessions,
            client,
            running: Mutex::new(HashMap::new()),
            max_concurrent_tasks: config.max_concurrent_tasks,
        }))
    }

    /// Register a task and, per its work mode, schedule or await it.
    ///
    /// Only `Blocking` and `NonBlocking` schedule the download from here:
    /// blocking waits for a terminal state, non-blocking returns the fresh
    /// record (a full queue leaves it `Pending` for a later `start`).
    /// `Persistent` and `Temporary` tasks are registered `Pending` and wait
    /// for an explicit `start`.
    pub async fn create(self: &Arc<Self>, config: DownloadConfig) -> DownloadResult<TaskRecord> {
        config.validate()?;
        let record = TaskRecord::new(config);
        let task_id = record.id.clone();
        self.registry.insert(record).await?;
        info!(task_id = %task_id, "task created");

        match self.registry.get(&task_id).await.map(|r| r.config.work_mode) {
            Some(WorkMode::Blocking) => {
                self.start(&task_id).await?;
                self.wait_terminal(&task_id).await
            }
            Some(WorkMode::NonBlocking) => {
                match self.start(&task_id).await {
                    Ok(()) => {}
                    Err(DownloadError::QueueFull { limit }) => {
                        debug!(task_id = %task_id, limit, "queue full, task left pending");
                    }
                    Err(err) => return Err(err),
                }
                self.get_record(&task_id).await
            }
            Some(WorkMode::Persistent) | Some(WorkMode::Temporary) => {
                self.get_record(&task_id).await
            }
            None => Err(DownloadError::TaskNotFound {
                task_id: task_id.to_string(),
            }),
        }
    }

    /// Begin (or retry) downloading a task.
    ///
    /// Preconditions: status is `Pending`, `Paused`, or `Failed` (explicit
    /// retry), and fewer than `max_concurrent_tasks` tasks are downloading.
    pub async fn start(self: &Arc<Self>, task_id: &TaskId) -> DownloadResult<()> {
        let record = self.get_record(task_id).await?;
        if !record.status.can_transition(Status::Downloading) {
            return Err(DownloadError::InvalidStateTransition {
                from: record.status.to_string(),
                to: Status::Downloading.to_string(),
            });
        }
        if self.registry.downloading_count().await >= self.max_concurrent_tasks {
            return Err(DownloadError::QueueFull {
                limit: self.max_concurrent_tasks,
            });
        }

        self.registry
            .update(task_id, |r| {
                r.status = Status::Downloading;
                r.started_at.get_or_insert_with(Utc::now);
                r.error = None;
            })
            .await?;

        let cancel = CancellationToken::new();
        let intent = Arc::new(AtomicU8::new(INTENT_RUN));
        let supervisor = {
            let this = Arc::clone(self);
            let task_id = task_id.clone();
            let cancel = cancel.clone();
            let intent = Arc::clone(&intent);
            tokio::spawn(async move {
                this.supervise(task_id, cancel, intent).await;
            })
        };

        self.running.lock().await.insert(
            task_id.clone(),
            RunningTask {
                cancel,
                intent,
                handle: supervisor,
            },
        );
        Ok(())
    }

    /// Pause a downloading task, waiting for its workers to quiesce.
    ///
    /// Pausing a `Paused` task is a no-op. Part files and the resume record
    /// are kept.
    pub async fn pause(&self, task_id: &TaskId) -> DownloadResult<TaskRecord> {
        let record = self.get_record(task_id).await?;
        match record.status {
            Status::Paused => Ok(record),
            Status::Downloading => {
                let running = self.running.lock().await.remove(task_id);
                if let Some(running) = running {
                    running.intent.store(INTENT_PAUSE, Ordering::SeqCst);
                    running.cancel.cancel();
                    let _ = running.handle.await;
                }
                self.get_record(task_id).await
            }
            other => Err(DownloadError::InvalidStateTransition {
                from: other.to_string(),
                to: Status::Paused.to_string(),
            }),
        }
    }

    /// Resume a paused (or failed) task. Equivalent to [`Self::start`].
    pub async fn resume_task(self: &Arc<Self>, task_id: &TaskId) -> DownloadResult<()> {
        self.start(task_id).await
    }

    /// Cancel a task from any non-terminal state.
    ///
    /// Cancelling a `Cancelled` task is a no-op. Part files and the resume
    /// record are deleted.
    pub async fn cancel(&self, task_id: &TaskId) -> DownloadResult<TaskRecord> {
        let record = self.get_record(task_id).await?;
        match record.status {
            Status::Cancelled => Ok(record),
            Status::Downloading => {
                let running = self.running.lock().await.remove(task_id);
                if let Some(running) = running {
                    running.intent.store(INTENT_CANCEL, Ordering::SeqCst);
                    running.cancel.cancel();
                    let _ = running.handle.await;
                }
                self.get_record(task_id).await
            }
            Status::Pending | Status::Paused => {
                self.delete_scratch(&record).await;
                let updated = self
                    .registry
                    .update(task_id, |r| {
                        r.status = Status::Cancelled;
                        r.completed_at = Some(Utc::now());
                    })
                    .await?;
                self.finish_temporary(&updated).await;
                Ok(updated)
            }
            other => Err(DownloadError::InvalidStateTransition {
                from: other.to_string(),
                to: Status::Cancelled.to_string(),
            }),
        }
    }

    /// Snapshot of one task.
    pub async fn get(&self, task_id: &TaskId) -> DownloadResult<TaskRecord> {
        self.get_record(task_id).await
    }

    /// Filtered, paginated task listing.
    pub async fn list(&self, status: Option<Status>, limit: usize, offset: usize) -> TaskPage {
        self.registry.list(status, limit, offset).await
    }

    /// Aggregate counters across all tasks.
    pub async fn stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    /// Remove completed tasks from the registry.
    pub async fn clear_completed(&self) -> DownloadResult<usize> {
        self.registry.clear_completed().await
    }

    /// Pause every live task and flush the registry. Called at graceful
    /// shutdown; paused state plus resume records allow a restart to pick
    /// everything back up.
    pub async fn shutdown(&self) {
        let ids: Vec<TaskId> = self.running.lock().await.keys().cloned().collect();
        for task_id in ids {
            if let Err(err) = self.pause(&task_id).await {
                warn!(task_id = %task_id, error = %err, "failed to pause task at shutdown");
            }
        }
        if let Err(err) = self.registry.save().await {
            warn!(error = %err, "failed to flush registry at shutdown");
        }
    }

    async fn get_record(&self, task_id: &TaskId) -> DownloadResult<TaskRecord> {
        self.registry
            .get(task_id)
            .await
            .ok_or_else(|| DownloadError::TaskNotFound {
                task_id: task_id.to_string(),
            })
    }

    async fn wait_terminal(&self, task_id: &TaskId) -> DownloadResult<TaskRecord> {
        loop {
            let record = self.get_record(task_id).await?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            tokio::time::sleep(BLOCKING_POLL_INTERVAL).await;
        }
    }

    // =========================================================================
    // Supervisor
    // =========================================================================

    async fn supervise(
        self: Arc<Self>,
        task_id: TaskId,
        cancel: CancellationToken,
        intent: Arc<AtomicU8>,
    ) {
        let result = self.drive(&task_id, &cancel, &intent).await;
        if let Err(err) = result {
            self.fail_task(&task_id, err).await;
        }
        self.running.lock().await.remove(&task_id);
    }

    /// Run one download attempt end to end.
    async fn drive(
        &self,
        task_id: &TaskId,
        cancel: &CancellationToken,
        intent: &Arc<AtomicU8>,
    ) -> DownloadResult<()> {
        let record = self.get_record(task_id).await?;
        let config = record.config.clone();

        // Probe through the session layer.
        let (metadata, final_url) = self
            .sessions
            .probe(
                &config.url,
                config.session_id.as_deref(),
                &config.headers,
                config.timeout_ms,
            )
            .await?;
        debug!(
            task_id = %task_id,
            content_length = ?metadata.content_length,
            accept_ranges = metadata.accept_ranges,
            "probe complete"
        );

        let total_size = metadata.content_length.ok_or_else(|| DownloadError::InvalidPlan {
            detail: "server did not report a content length".to_string(),
        })?;

        let record = self
            .registry
            .update(task_id, |r| r.server_metadata = metadata.clone())
            .await?;

        tokio::fs::create_dir_all(&config.output_path)
            .await
            .map_err(|e| DownloadError::from_io(&config.output_path, e))?;

        if total_size == 0 {
            return self.complete_empty(&record).await;
        }

        let segments = self.adopt_or_plan(&record, total_size).await?;
        let record = self
            .registry
            .update(task_id, |r| {
                r.progress.total_size = total_size;
                r.progress.segments = segments.clone();
                r.progress.recompute();
            })
            .await?;

        if config.enable_resume {
            let resume = ResumeRecord::new(
                task_id.clone(),
                config.url.clone(),
                record.output_file(),
                total_size,
                segments.clone(),
                &record.server_metadata,
            );
            self.resume_store.save(&resume).await?;
        }

        let (segments, ended) = self
            .run_workers(&record, segments, &final_url, cancel, intent)
            .await;

        // Whatever happened, persist final per-segment counters first.
        let record = self
            .registry
            .update(task_id, |r| {
                r.progress.segments = segments.clone();
                r.progress.recompute();
            })
            .await?;
        if config.enable_resume {
            self.save_resume(&record, &segments).await;
        }

        match ended {
            Ended::Completed => self.finalize(&record, &segments).await,
            Ended::Stopped(INTENT_CANCEL) => {
                self.delete_scratch(&record).await;
                let updated = self
                    .registry
                    .update(task_id, |r| {
                        r.status = Status::Cancelled;
                        r.completed_at = Some(Utc::now());
                    })
                    .await?;
                info!(task_id = %task_id, "task cancelled");
                self.finish_temporary(&updated).await;
                Ok(())
            }
            Ended::Stopped(_) => {
                self.registry
                    .update(task_id, |r| {
                        r.status = Status::Paused;
                        for segment in &mut r.progress.segments {
                            if segment.status != Status::Completed {
                                segment.status = Status::Paused;
                            }
                        }
                    })
                    .await?;
                info!(task_id = %task_id, "task paused");
                Ok(())
            }
            Ended::Failed(err) => Err(err),
        }
    }

    /// Adopt a valid resume record's segments or plan a fresh partition.
    async fn adopt_or_plan(
        &self,
        record: &TaskRecord,
        total_size: u64,
    ) -> DownloadResult<Vec<Segment>> {
        let config = &record.config;

        if config.enable_resume {
            if let Some(resume) = self.resume_store.load(&record.id).await? {
                let verdict = self
                    .resume_store
                    .validate(&resume, &config.url, &record.server_metadata)
                    .await?;
                match verdict {
                    Ok(()) if resume.total_size == total_size => {
                        info!(
                            task_id = %record.id,
                            downloaded = resume.downloaded(),
                            "resuming from stored record"
                        );
                        let mut segments = resume.segments;
                        for segment in &mut segments {
                            if segment.status != Status::Completed {
                                segment.status = Status::Pending;
                            }
                        }
                        return Ok(segments);
                    }
                    _ => {
                        debug!(task_id = %record.id, "resume record rejected, replanning");
                    }
                }
            }
        }

        // Fresh plan: clear any scratch left behind by a previous partition.
        self.delete_stale_parts(record).await;

        let limits = SegmentationLimits::from_chunk_size(config.chunk_size);
        planner::plan(
            total_size,
            record.server_metadata.accept_ranges,
            config.max_concurrency,
            None,
            &limits,
            |i| record.part_path(i),
        )
    }

    /// The per-task event loop: spawn workers, aggregate events, decide the
    /// outcome.
    async fn run_workers(
        &self,
        record: &TaskRecord,
        mut segments: Vec<Segment>,
        url: &str,
        cancel: &CancellationToken,
        intent: &Arc<AtomicU8>,
    ) -> (Vec<Segment>, Ended) {
        let config = &record.config;
        let parsed_url = match url::Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => {
                return (
                    segments,
                    Ended::Failed(DownloadError::InvalidConfig {
                        detail: format!("url is not absolute: {url}"),
                    }),
                );
            }
        };
        let headers = self
            .sessions
            .build_headers(config.session_id.as_deref(), &parsed_url, &config.headers)
            .await;

        let (event_tx, mut event_rx) = mpsc::channel::<WorkerEvent>(256);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let mut pool: JoinSet<Segment> = JoinSet::new();

        let spawn = |pool: &mut JoinSet<Segment>, segment: Segment| {
            let worker = SegmentWorker {
                client: self.client.clone(),
                url: url.to_string(),
                headers: headers.clone(),
                segment,
                timeout_ms: config.timeout_ms,
                backoff: BackoffPolicy::new(config.max_attempts()),
                hash_algorithm: config
                    .integrity
                    .verify_segments
                    .then_some(config.integrity.algorithm),
                events: event_tx.clone(),
                cancel: cancel.clone(),
            };
            let permits = Arc::clone(&semaphore);
            pool.spawn(async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return worker.segment,
                };
                if worker.cancel.is_cancelled() {
                    return worker.segment;
                }
                worker.run().await
            });
        };

        for segment in segments.iter().filter(|s| !s.is_complete()) {
            spawn(&mut pool, segment.clone());
        }

        let mut window = SpeedWindow::default();
        // Backdated so the first tick persists right away.
        let mut last_persist = Instant::now()
            .checked_sub(PERSIST_INTERVAL)
            .unwrap_or_else(Instant::now);
        let mut reassignments: u32 = 0;
        let mut next_index = segments.len();
        let mut pending_error: Option<DownloadError> = None;

        let ended = loop {
            if segments.iter().all(Segment::is_complete) {
                break Ended::Completed;
            }

            tokio::select! {
                Some(event) = event_rx.recv() => {
                    match event {
                        WorkerEvent::ProgressTick { segment_id, downloaded, .. } => {
                            if let Some(segment) =
                                segments.iter_mut().find(|s| s.id == segment_id)
                            {
                                segment.downloaded = segment.downloaded.max(downloaded);
                                if segment.status == Status::Pending {
                                    segment.status = Status::Downloading;
                                }
                            }
                            let total: u64 = segments.iter().map(|s| s.downloaded).sum();
                            window.record(total);

                            if last_persist.elapsed() >= PERSIST_INTERVAL {
                                last_persist = Instant::now();
                                self.persist_progress(record, &segments, &window).await;
                            }
                        }
                        WorkerEvent::SegmentCompleted { segment_id, downloaded, checksum } => {
                            if let Some(segment) =
                                segments.iter_mut().find(|s| s.id == segment_id)
                            {
                                segment.downloaded = downloaded;
                                segment.status = Status::Completed;
                                segment.checksum = checksum;
                            }
                            self.persist_progress(record, &segments, &window).await;
                            last_persist = Instant::now();
                        }
                        WorkerEvent::SegmentFailed { segment_id, downloaded, error } => {
                            if let Some(segment) =
                                segments.iter_mut().find(|s| s.id == segment_id)
                            {
                                segment.downloaded = segment.downloaded.max(downloaded);
                                segment.status = Status::Failed;
                            }
                            let recoverable = pending_error.is_none()
                                && intent.load(Ordering::SeqCst) == INTENT_RUN
                                && reassignments < MAX_SEGMENT_REASSIGNMENTS;
                            if recoverable {
                                reassignments += 1;
                                self.reassign(
                                    record,
                                    &mut segments,
                                    &segment_id,
                                    &mut next_index,
                                    |seg| spawn(&mut pool, seg),
                                );
                            } else if pending_error.is_none() {
                                pending_error = Some(error);
                                cancel.cancel();
                            }
                        }
                    }
                }
                joined = pool.join_next() => {
                    match joined {
                        Some(Ok(finished)) => {
                            if let Some(segment) =
                                segments.iter_mut().find(|s| s.id == finished.id)
                            {
                                segment.downloaded = segment.downloaded.max(finished.downloaded);
                                segment.retry_count = finished.retry_count;
                                if finished.status == Status::Completed {
                                    segment.status = Status::Completed;
                                    segment.checksum = finished.checksum;
                                }
                            }
                        }
                        Some(Err(join_err)) => {
                            warn!(task_id = %record.id, error = %join_err, "worker panicked");
                            if pending_error.is_none() {
                                pending_error = Some(DownloadError::Network {
                                    url: url.to_string(),
                                    detail: "worker aborted unexpectedly".to_string(),
                                });
                                cancel.cancel();
                            }
                        }
                        None => {
                            // No workers left; decide how this run ended.
                            let stop = intent.load(Ordering::SeqCst);
                            if stop != INTENT_RUN {
                                break Ended::Stopped(stop);
                            }
                            if let Some(err) = pending_error.take() {
                                break Ended::Failed(err);
                            }
                            if segments.iter().all(Segment::is_complete) {
                                break Ended::Completed;
                            }
                            break Ended::Failed(DownloadError::Network {
                                url: url.to_string(),
                                detail: "workers exited before the download finished".to_string(),
                            });
                        }
                    }
                }
            }
        };

        // Drain any workers still finishing so their counters are final.
        drop(spawn);
        drop(event_tx);
        while let Some(joined) = pool.join_next().await {
            if let Ok(finished) = joined {
                if let Some(segment) = segments.iter_mut().find(|s| s.id == finished.id) {
                    segment.downloaded = segment.downloaded.max(finished.downloaded);
                    if finished.status == Status::Completed {
                        segment.status = Status::Completed;
                        segment.checksum = finished.checksum;
                    }
                }
            }
        }

        (segments, ended)
    }

    /// Replace a failed segment with a split pair (or itself) and respawn.
    fn reassign(
        &self,
        record: &TaskRecord,
        segments: &mut Vec<Segment>,
        failed_id: &str,
        next_index: &mut usize,
        mut spawn: impl FnMut(Segment),
    ) {
        let Some(position) = segments.iter().position(|s| s.id == failed_id) else {
            return;
        };
        let failed = segments[position].clone();
        let limits = SegmentationLimits::from_chunk_size(record.config.chunk_size);

        let left_id = format!("segment_{}", *next_index);
        let right_id = format!("segment_{}", *next_index + 1);
        let right_part = record.part_path(*next_index + 1);

        match planner::split_segment(&failed, left_id, right_id, right_part, limits.min_chunk) {
            Some((left, right)) => {
                debug!(
                    task_id = %record.id,
                    failed = failed_id,
                    left = %left.id,
                    right = %right.id,
                    "splitting failed segment"
                );
                *next_index += 2;
                segments[position] = left.clone();
                segments.insert(position + 1, right.clone());
                spawn(left);
                spawn(right);
            }
            None => {
                debug!(task_id = %record.id, failed = failed_id, "reassigning failed segment");
                let mut retry = failed;
                retry.status = Status::Pending;
                segments[position] = retry.clone();
                spawn(retry);
            }
        }
    }

    async fn persist_progress(
        &self,
        record: &TaskRecord,
        segments: &[Segment],
        window: &SpeedWindow,
    ) {
        let downloaded: u64 = segments.iter().map(|s| s.downloaded).sum();
        let speed = window.speed_bps();
        let update = self
            .registry
            .update(&record.id, |r| {
                r.progress.segments = segments.to_vec();
                r.progress.speed_bps = speed;
                r.progress.recompute();
            })
            .await;
        if let Err(err) = update {
            warn!(task_id = %record.id, error = %err, "failed to persist progress");
        }
        if record.config.enable_resume {
            self.save_resume(record, segments).await;
        }
        debug!(task_id = %record.id, downloaded, "progress persisted");
    }

    async fn save_resume(&self, record: &TaskRecord, segments: &[Segment]) {
        let mut resume = ResumeRecord::new(
            record.id.clone(),
            record.config.url.clone(),
            record.output_file(),
            record.progress.total_size,
            segments.to_vec(),
            &record.server_metadata,
        );
        resume.created_at = record.created_at;
        if let Err(err) = self.resume_store.save(&resume).await {
            warn!(task_id = %record.id, error = %err, "failed to save resume record");
        }
    }

    /// Merge, verify, and mark the task complete.
    async fn finalize(&self, record: &TaskRecord, segments: &[Segment]) -> DownloadResult<()> {
        let output = record.output_file();
        let merged = merge_parts(&output, segments).await?;
        debug!(task_id = %record.id, bytes = merged, "merge complete");

        let integrity = &record.config.integrity;
        if integrity.verify_final || integrity.expected_checksum.is_some() {
            let verification = verify_file(
                &output,
                integrity.algorithm,
                integrity.expected_checksum.as_deref(),
            )
            .await?;
            if !verification.ok {
                // Keep part files for inspection; only the merged output is
                // removed.
                let _ = tokio::fs::remove_file(&output).await;
                return Err(DownloadError::ChecksumMismatch {
                    expected: verification.expected.unwrap_or_default(),
                    actual: verification.actual,
                });
            }
        }

        for segment in segments {
            let _ = tokio::fs::remove_file(&segment.part_path).await;
        }
        if let Err(err) = self.resume_store.cleanup(&record.id).await {
            warn!(task_id = %record.id, error = %err, "failed to remove resume record");
        }

        let updated = self
            .registry
            .update(&record.id, |r| {
                r.status = Status::Completed;
                r.completed_at = Some(Utc::now());
                r.progress.recompute();
            })
            .await?;
        info!(task_id = %record.id, bytes = merged, "task completed");
        self.finish_temporary(&updated).await;
        Ok(())
    }

    /// Zero-byte resource: create the empty output and complete in one step.
    async fn complete_empty(&self, record: &TaskRecord) -> DownloadResult<()> {
        let output = record.output_file();
        tokio::fs::write(&output, b"")
            .await
            .map_err(|e| DownloadError::from_io(&output, e))?;

        if let Some(expected) = &record.config.integrity.expected_checksum {
            let empty = StreamingHasher::new(record.config.integrity.algorithm).finalize();
            if !empty.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&output).await;
                return Err(DownloadError::ChecksumMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual: empty,
                });
            }
        }

        let mut placeholder = Segment::new("segment_0", 0, 0, record.part_path(0));
        placeholder.status = Status::Completed;
        let updated = self
            .registry
            .update(&record.id, |r| {
                r.status = Status::Completed;
                r.completed_at = Some(Utc::now());
                r.progress.total_size = 0;
                r.progress.segments = vec![placeholder.clone()];
                r.progress.recompute();
            })
            .await?;
        let _ = self.resume_store.cleanup(&record.id).await;
        info!(task_id = %record.id, "empty resource completed");
        self.finish_temporary(&updated).await;
        Ok(())
    }

    /// Record a terminal failure. Part files and the resume record are kept
    /// so an explicit retry can continue.
    async fn fail_task(&self, task_id: &TaskId, error: DownloadError) {
        warn!(task_id = %task_id, code = error.code(), error = %error, "task failed");
        let result = self
            .registry
            .update(task_id, |r| {
                if r.status.can_transition(Status::Failed) {
                    r.status = Status::Failed;
                }
                r.completed_at = Some(Utc::now());
                r.error = Some(TaskError::from(&error));
            })
            .await;
        match result {
            Ok(updated) => self.finish_temporary(&updated).await,
            Err(err) => warn!(task_id = %task_id, error = %err, "failed to record task failure"),
        }
    }

    /// Delete part files and the resume record.
    async fn delete_scratch(&self, record: &TaskRecord) {
        for segment in &record.progress.segments {
            let _ = tokio::fs::remove_file(&segment.part_path).await;
        }
        self.delete_stale_parts(record).await;
        let _ = self.resume_store.cleanup(&record.id).await;
    }

    /// Remove every `{filename}.part*` in the output directory, catching
    /// scratch left by an older partition of the same file.
    async fn delete_stale_parts(&self, record: &TaskRecord) {
        let prefix = format!("{}.part", record.filename());
        let Ok(mut entries) = tokio::fs::read_dir(&record.config.output_path).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                let _ = tokio::fs::remove_file(entry.path()).await;
            }
        }
    }

    /// Temporary work mode drops all traces once the task is terminal.
    async fn finish_temporary(&self, record: &TaskRecord) {
        if record.config.work_mode != WorkMode::Temporary || !record.status.is_terminal() {
            return;
        }
        let _ = self.resume_store.cleanup(&record.id).await;
        if let Err(err) = self.registry.remove(&record.id).await {
            warn!(task_id = %record.id, error = %err, "failed to drop temporary task");
        }
    }
}
