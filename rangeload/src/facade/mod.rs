//! Tool protocol facade.
//!
//! The thin surface an external tool-protocol server calls into. Each tool
//! takes a JSON argument object, validates it strictly (unknown keys are an
//! `InvalidConfig` error), invokes the engine, and wraps the outcome in the
//! standard response envelope:
//!
//! ```json
//! { "success": true, "data": { ... }, "timestamp": "..." }
//! { "success": false, "error": { "code": "...", "message": "...", "details": null }, "timestamp": "..." }
//! ```
//!
//! Error messages come from the engine's own taxonomy descriptions, never
//! from underlying library errors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{DownloadConfig, IntegrityConfig, WorkMode};
use crate::error::{DownloadError, DownloadResult};
use crate::hash::{verify_file, HashAlgorithm};
use crate::orchestrator::DownloadOrchestrator;
use crate::session::{PreRequestOptions, SessionManager, DEFAULT_MAX_REDIRECTS};
use crate::task::{Status, TaskId, TaskRecord};

// =============================================================================
// Response envelope
// =============================================================================

/// Wire error inside the envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

/// Envelope wrapping every tool result.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub timestamp: DateTime<Utc>,
}

impl ToolResponse {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn err(error: &DownloadError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolError {
                code: error.code().to_string(),
                message: error.to_string(),
                details: None,
            }),
            timestamp: Utc::now(),
        }
    }

    /// Failure envelope for errors raised outside the facade (e.g. a caller
    /// that could not even parse its request).
    pub fn from_error(error: &DownloadError) -> Self {
        Self::err(error)
    }
}

// =============================================================================
// Tool arguments
// =============================================================================

fn default_method() -> String {
    "GET".to_string()
}
fn default_timeout() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
fn default_max_concurrency() -> usize {
    4
}
fn default_chunk_size() -> u64 {
    1_048_576
}
fn default_retry_count() -> u32 {
    3
}
fn default_list_limit() -> usize {
    20
}
fn default_algorithm() -> String {
    "sha256".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PreRequestArgs {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_true")]
    follow_redirects: bool,
    #[serde(default)]
    user_agent: Option<String>,
    #[serde(default)]
    referer: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntegrityArgs {
    #[serde(default = "default_algorithm")]
    algorithm: String,
    #[serde(default)]
    expected_checksum: Option<String>,
    #[serde(default = "default_true")]
    verify_segments: bool,
    #[serde(default = "default_true")]
    verify_final: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadFileArgs {
    url: String,
    output_path: PathBuf,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default = "default_max_concurrency")]
    max_concurrency: usize,
    #[serde(default = "default_chunk_size")]
    chunk_size: u64,
    #[serde(default = "default_timeout")]
    timeout: u64,
    #[serde(default = "default_retry_count")]
    retry_count: u32,
    #[serde(default)]
    work_mode: Option<WorkMode>,
    #[serde(default = "default_true")]
    enable_resume: bool,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    integrity: Option<IntegrityArgs>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskArgs {
    task_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListArgs {
    #[serde(default)]
    status: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyArgs {
    file_path: PathBuf,
    #[serde(default = "default_algorithm")]
    algorithm: String,
    #[serde(default)]
    expected_checksum: Option<String>,
    #[serde(default)]
    generate_report: bool,
}

// =============================================================================
// Facade
// =============================================================================

/// The tool surface over one engine instance.
pub struct ToolFacade {
    orchestrator: Arc<DownloadOrchestrator>,
    sessions: Arc<SessionManager>,
}

impl ToolFacade {
    pub fn new(orchestrator: Arc<DownloadOrchestrator>, sessions: Arc<SessionManager>) -> Self {
        Self {
            orchestrator,
            sessions,
        }
    }

    /// Dispatch one tool call, always returning an envelope.
    pub async fn handle(&self, tool: &str, args: Value) -> ToolResponse {
        debug!(tool, "tool call");
        let result = match tool {
            "pre_request" => self.pre_request(args).await,
            "download_file" => self.download_file(args).await,
            "get_download_status" => self.get_download_status(args).await,
            "pause_download" => self.pause_download(args).await,
            "resume_download" => self.resume_download(args).await,
            "cancel_download" => self.cancel_download(args).await,
            "list_downloads" => self.list_downloads(args).await,
            "verify_integrity" => self.verify_integrity(args).await,
            other => Err(DownloadError::InvalidConfig {
                detail: format!("unknown tool: {other}"),
            }),
        };
        match result {
            Ok(data) => ToolResponse::ok(data),
            Err(error) => ToolResponse::err(&error),
        }
    }

    async fn pre_request(&self, args: Value) -> DownloadResult<Value> {
        let args: PreRequestArgs = parse_args(args)?;
        let mut options = PreRequestOptions::new(args.url);
        options.method = args.method;
        options.headers = lowercase_keys(args.headers);
        options.body = args.body;
        options.timeout_ms = args.timeout;
        options.follow_redirects = args.follow_redirects;
        options.max_redirects = DEFAULT_MAX_REDIRECTS;
        options.user_agent = args.user_agent;
        options.referer = args.referer;
        options.session_id = args.session_id;

        let outcome = self.sessions.pre_request(options).await?;
        Ok(json!({
            "session_id": outcome.session_id,
            "status": outcome.status,
            "headers": outcome.headers,
            "cookies": outcome.cookies,
            "redirect_chain": outcome.redirect_chain,
            "final_url": outcome.final_url,
            "elapsed_ms": outcome.elapsed_ms,
        }))
    }

    async fn download_file(&self, args: Value) -> DownloadResult<Value> {
        let args: DownloadFileArgs = parse_args(args)?;

        let mut config = DownloadConfig::new(args.url, args.output_path);
        config.filename = args.filename;
        config.max_concurrency = args.max_concurrency;
        config.chunk_size = args.chunk_size;
        config.timeout_ms = args.timeout;
        config.retry_count = args.retry_count;
        config.work_mode = args.work_mode.unwrap_or_default();
        config.enable_resume = args.enable_resume;
        config.session_id = args.session_id;
        config.headers = lowercase_keys(args.headers);
        if let Some(integrity) = args.integrity {
            config.integrity = IntegrityConfig {
                algorithm: HashAlgorithm::parse(&integrity.algorithm)?,
                expected_checksum: integrity.expected_checksum,
                verify_segments: integrity.verify_segments,
                verify_final: integrity.verify_final,
            };
        }

        let blocking = config.work_mode == WorkMode::Blocking;
        let record = self.orchestrator.create(config).await?;

        if blocking {
            Ok(status_payload(&record))
        } else {
            let message = match record.status {
                Status::Pending if record.config.work_mode == WorkMode::NonBlocking => {
                    "download created; queue full, start it again later"
                }
                Status::Pending => "download created; start it with resume_download",
                _ => "download scheduled",
            };
            Ok(json!({
                "task_id": record.id.to_string(),
                "status": record.status,
                "message": message,
            }))
        }
    }

    async fn get_download_status(&self, args: Value) -> DownloadResult<Value> {
        let args: TaskArgs = parse_args(args)?;
        let record = self.orchestrator.get(&TaskId::from_string(args.task_id)).await?;
        Ok(status_payload(&record))
    }

    async fn pause_download(&self, args: Value) -> DownloadResult<Value> {
        let args: TaskArgs = parse_args(args)?;
        let task_id = TaskId::from_string(args.task_id);
        let record = self.orchestrator.pause(&task_id).await?;
        Ok(op_payload(&record))
    }

    async fn resume_download(&self, args: Value) -> DownloadResult<Value> {
        let args: TaskArgs = parse_args(args)?;
        let task_id = TaskId::from_string(args.task_id);
        self.orchestrator.resume_task(&task_id).await?;
        let record = self.orchestrator.get(&task_id).await?;
        Ok(op_payload(&record))
    }

    async fn cancel_download(&self, args: Value) -> DownloadResult<Value> {
        let args: TaskArgs = parse_args(args)?;
        let task_id = TaskId::from_string(args.task_id);
        let record = self.orchestrator.cancel(&task_id).await?;
        Ok(op_payload(&record))
    }

    async fn list_downloads(&self, args: Value) -> DownloadResult<Value> {
        let args: ListArgs = parse_args(args)?;
        let status = args.status.as_deref().map(parse_status).transpose()?;
        let page = self.orchestrator.list(status, args.limit, args.offset).await;
        let tasks: Vec<Value> = page.tasks.iter().map(status_payload).collect();
        Ok(json!({
            "tasks": tasks,
            "total": page.total,
            "has_more": page.has_more,
        }))
    }

    async fn verify_integrity(&self, args: Value) -> DownloadResult<Value> {
        let args: VerifyArgs = parse_args(args)?;
        let algorithm = HashAlgorithm::parse(&args.algorithm)?;
        let result = verify_file(&args.file_path, algorithm, args.expected_checksum.as_deref())
            .await?;

        let mut payload = json!({
            "success": true,
            "algorithm": algorithm.name(),
            "checksum": result.actual,
            "verified": result.ok,
            "file_size": result.bytes,
            "elapsed_ms": result.elapsed_ms,
        });
        if args.generate_report {
            payload["report"] = json!({
                "file_path": args.file_path,
                "algorithm": algorithm.name(),
                "expected": result.expected,
                "actual": result.actual,
                "verified_at": Utc::now(),
            });
        }
        Ok(payload)
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_args<T: serde::de::DeserializeOwned>(args: Value) -> DownloadResult<T> {
    serde_json::from_value(args).map_err(|e| DownloadError::InvalidConfig {
        detail: e.to_string(),
    })
}

fn lowercase_keys(headers: BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect()
}

fn parse_status(name: &str) -> DownloadResult<Status> {
    serde_json::from_value(Value::String(name.to_ascii_lowercase())).map_err(|_| {
        DownloadError::InvalidConfig {
            detail: format!("unknown status filter: {name}"),
        }
    })
}

/// The `get_download_status` result shape, also used per task in listings.
fn status_payload(record: &TaskRecord) -> Value {
    let progress = &record.progress;
    let mut metadata = json!({
        "filename": record.filename(),
        "url": record.config.url,
        "created_at": record.created_at,
    });
    if let Some(started) = record.started_at {
        metadata["started_at"] = json!(started);
    }
    if let Some(completed) = record.completed_at {
        metadata["completed_at"] = json!(completed);
    }

    let mut payload = json!({
        "task_id": record.id.to_string(),
        "status": record.status,
        "progress": {
            "percentage": progress.percentage,
            "downloaded": progress.downloaded_size,
            "total": progress.total_size,
            "speed": progress.speed_bps,
            "eta": progress.eta_seconds,
        },
        "metadata": metadata,
    });
    if let Some(error) = &record.error {
        payload["error"] = json!({
            "code": error.code,
            "message": error.message,
        });
    }
    payload
}

fn op_payload(record: &TaskRecord) -> Value {
    json!({
        "task_id": record.id.to_string(),
        "success": true,
        "new_status": record.status,
    })
}
