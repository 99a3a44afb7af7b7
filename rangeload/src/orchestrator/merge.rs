//! Part-file merge.
//!
//! Concatenates completed part files into the final output, in ascending
//! segment start order. A failure part-way aborts the merge and deletes the
//! output file; part files are left untouched in every outcome so the
//! orchestrator can keep them for inspection (checksum mismatch) or remove
//! them once the merged file has verified.

use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::task::Segment;

/// Merge part files into `output`, returning the bytes written.
///
/// Every segment must be complete before calling. Parts are appended in
/// ascending `start` order regardless of the input ordering.
pub async fn merge_parts(output: &Path, segments: &[Segment]) -> DownloadResult<u64> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::from_io(parent, e))?;
    }

    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|s| s.start);

    let result = run_merge(output, &ordered).await;
    if result.is_err() {
        warn!(output = %output.display(), "merge failed, removing partial output");
        let _ = tokio::fs::remove_file(output).await;
    }
    result
}

async fn run_merge(output: &Path, ordered: &[&Segment]) -> DownloadResult<u64> {
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(output)
        .await
        .map_err(|e| DownloadError::from_io(output, e))?;

    let mut written: u64 = 0;
    for segment in ordered {
        let mut part = File::open(&segment.part_path)
            .await
            .map_err(|e| DownloadError::from_io(&segment.part_path, e))?;

        let copied = tokio::io::copy(&mut part, &mut out)
            .await
            .map_err(|e| DownloadError::MergeError {
                detail: format!("copying {}: {e}", segment.id),
            })?;
        if copied != segment.byte_len() {
            return Err(DownloadError::MergeError {
                detail: format!(
                    "{} holds {copied} bytes, expected {}",
                    segment.id,
                    segment.byte_len()
                ),
            });
        }
        written += copied;
        debug!(segment = %segment.id, bytes = copied, "part merged");
    }

    out.flush()
        .await
        .map_err(|e| DownloadError::from_io(output, e))?;
    out.sync_all()
        .await
        .map_err(|e| DownloadError::from_io(output, e))?;
    Ok(written)
}
