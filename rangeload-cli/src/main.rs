//! Rangeload CLI - tool server over stdio.
//!
//! Reads one JSON request per line from stdin and writes one response
//! envelope per line to stdout:
//!
//! ```json
//! {"tool": "download_file", "args": {"url": "http://host/f.bin", "output_path": "."}}
//! ```
//!
//! All download logic lives in the `rangeload` library; this binary only
//! parses arguments, sets up logging, and pumps the request loop.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use rangeload::{DownloadOrchestrator, OrchestratorConfig, SessionManager, ToolFacade};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rangeload")]
#[command(about = "Segmented resumable download tool server", long_about = None)]
struct Args {
    /// Working directory for task state and resume records
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Maximum tasks downloading at once
    #[arg(long, default_value = "5")]
    max_concurrent_tasks: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Logs go to stderr so stdout stays a clean response stream.
            EnvFilter::new("rangeload=info")
        }))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let sessions = match SessionManager::new() {
        Ok(sessions) => sessions,
        Err(e) => {
            error!(error = %e, "failed to initialize session layer");
            process::exit(1);
        }
    };

    let config = OrchestratorConfig::new(&args.work_dir)
        .with_max_concurrent_tasks(args.max_concurrent_tasks);
    let orchestrator = match DownloadOrchestrator::new(config, Arc::clone(&sessions)).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %e, "failed to initialize download engine");
            process::exit(1);
        }
    };

    let facade = ToolFacade::new(Arc::clone(&orchestrator), sessions);
    info!(work_dir = %args.work_dir.display(), "tool server ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, pausing live downloads");
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Value>(line) {
                    Ok(request) => {
                        let tool = request["tool"].as_str().unwrap_or_default().to_string();
                        let args = request.get("args").cloned().unwrap_or(Value::Null);
                        facade.handle(&tool, args).await
                    }
                    Err(e) => rangeload::ToolResponse::from_error(
                        &rangeload::DownloadError::InvalidConfig {
                            detail: format!("request is not valid JSON: {e}"),
                        },
                    ),
                };
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        let _ = stdout.write_all(json.as_bytes()).await;
                        let _ = stdout.write_all(b"\n").await;
                        let _ = stdout.flush().await;
                    }
                    Err(e) => error!(error = %e, "failed to serialize response"),
                }
            }
        }
    }

    orchestrator.shutdown().await;
    info!("tool server stopped");
}
