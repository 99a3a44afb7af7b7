//! Rangeload - segmented, resumable HTTP downloads behind a tool facade.
//!
//! The crate splits a remote file into byte-range segments, fetches them
//! concurrently with bounded parallelism, verifies integrity incrementally
//! and on completion, and persists enough state to resume precisely across
//! process restarts. A thin [`facade::ToolFacade`] exposes the engine to a
//! JSON tool protocol; everything below it is usable as a library.
//!
//! # Architecture
//!
//! ```text
//! ToolFacade ──► DownloadOrchestrator ──► SessionManager (HEAD, headers)
//!                      │                        │
//!                      │                   CookieJar / auth
//!                      ▼
//!              planner ──► N x SegmentWorker ──► part files + hashes
//!                      │         │
//!                      │    WorkerEvent channel
//!                      ▼
//!              TaskRegistry / ResumeStore / merge + final digest
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod hash;
pub mod orchestrator;
pub mod planner;
pub mod progress;
pub mod registry;
pub mod resume;
pub mod session;
pub mod task;
pub mod worker;

pub use config::{DownloadConfig, IntegrityConfig, WorkMode};
pub use error::{DownloadError, DownloadResult};
pub use facade::{ToolFacade, ToolResponse};
pub use hash::HashAlgorithm;
pub use orchestrator::{DownloadOrchestrator, OrchestratorConfig};
pub use session::SessionManager;
pub use task::{Progress, Segment, Status, TaskId, TaskRecord};
