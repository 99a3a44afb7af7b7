//! Per-segment fetch worker.
//!
//! A worker owns exactly one [`Segment`] for the duration of a download
//! attempt. It issues a ranged GET starting at the segment's resume offset,
//! streams the body into the part file (append-only), feeds an incremental
//! hash, and reports progress over the orchestrator's event channel:
//!
//! - [`WorkerEvent::ProgressTick`] at most every 100ms while streaming
//! - [`WorkerEvent::SegmentCompleted`] after flush and fsync
//! - [`WorkerEvent::SegmentFailed`] once retries are exhausted
//!
//! Transient errors retry with exponential backoff; the hash state and the
//! `downloaded` counter survive across attempts so a retry continues from
//! where the failed attempt stopped, never rehashing. Cancellation is
//! observed between body chunks and leaves the part file in place for a
//! later resume.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use rand::Rng;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{DownloadError, DownloadResult};
use crate::hash::{HashAlgorithm, StreamingHasher};
use crate::task::{Segment, Status};

/// Minimum interval between progress events per segment.
pub const PROGRESS_TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Exponential backoff policy between retry attempts.
///
/// Delay for attempt `n` (1-based) is `min(base * factor^(n-1), max_delay)`,
/// optionally jittered by +/-50%.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum attempts including the initial one.
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl BackoffPolicy {
    /// Policy with the configured attempt ceiling and standard delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(1000),
            factor: 2.0,
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based), or
    /// `None` when no attempts remain.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let exponent = (attempt.saturating_sub(1)) as i32;
        let raw_ms = self.base.as_millis() as f64 * self.factor.powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        let delay_ms = if self.jitter {
            let scale: f64 = rand::thread_rng().gen_range(0.5..=1.5);
            capped_ms * scale
        } else {
            capped_ms
        };
        Some(Duration::from_millis(delay_ms as u64))
    }
}

/// Messages a worker sends back to its orchestrator.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Periodic progress while streaming. `downloaded` is the segment's
    /// cumulative counter; `speed_sample` is bytes/sec since the last tick.
    ProgressTick {
        segment_id: String,
        downloaded: u64,
        speed_sample: u64,
    },
    /// The segment finished and its part file is durable on disk.
    SegmentCompleted {
        segment_id: String,
        downloaded: u64,
        checksum: Option<String>,
    },
    /// Retries are exhausted or the error was fatal.
    SegmentFailed {
        segment_id: String,
        downloaded: u64,
        error: DownloadError,
    },
}

/// One worker run over one segment.
pub struct SegmentWorker {
    pub client: reqwest::Client,
    pub url: String,
    /// Fully merged request headers (session + config), lowercase keys.
    pub headers: BTreeMap<String, String>,
    pub segment: Segment,
    pub timeout_ms: u64,
    pub backoff: BackoffPolicy,
    /// Algorithm for the per-segment digest; `None` disables segment hashing.
    pub hash_algorithm: Option<HashAlgorithm>,
    pub events: mpsc::Sender<WorkerEvent>,
    pub cancel: CancellationToken,
}

impl SegmentWorker {
    /// Drive the segment to completion, failure, or cancellation.
    ///
    /// Returns the segment with its final counters and status. The part
    /// file is never deleted here, whatever the outcome.
    pub async fn run(mut self) -> Segment {
        let mut hasher = match self.prepare_hasher().await {
            Ok(hasher) => hasher,
            Err(err) => {
                return self.fail(err).await;
            }
        };

        // A resumed segment may already hold every byte (stopped between the
        // final write and completion); no request needed.
        if self.segment.remaining() == 0 {
            let checksum = hasher.take().map(StreamingHasher::finalize);
            self.segment.status = Status::Completed;
            self.segment.checksum = checksum.clone();
            let _ = self
                .events
                .send(WorkerEvent::SegmentCompleted {
                    segment_id: self.segment.id.clone(),
                    downloaded: self.segment.downloaded,
                    checksum,
                })
                .await;
            return self.segment;
        }

        let mut attempt: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return self.stopped().await;
            }
            attempt += 1;
            trace!(
                segment = %self.segment.id,
                attempt,
                offset = self.segment.resume_offset(),
                "starting fetch attempt"
            );

            match self.attempt(&mut hasher).await {
                Ok(()) => {
                    let checksum = hasher.take().map(StreamingHasher::finalize);
                    self.segment.status = Status::Completed;
                    self.segment.checksum = checksum.clone();
                    let _ = self
                        .events
                        .send(WorkerEvent::SegmentCompleted {
                            segment_id: self.segment.id.clone(),
                            downloaded: self.segment.downloaded,
                            checksum,
                        })
                        .await;
                    return self.segment;
                }
                Err(DownloadError::Cancelled) => {
                    return self.stopped().await;
                }
                Err(err) if err.is_retryable() => {
                    match self.backoff.delay_for_attempt(attempt) {
                        Some(delay) => {
                            self.segment.retry_count += 1;
                            debug!(
                                segment = %self.segment.id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying after transient error"
                            );
                            tokio::select! {
                                biased;
                                _ = self.cancel.cancelled() => return self.stopped().await,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => return self.fail(err).await,
                    }
                }
                Err(err) => return self.fail(err).await,
            }
        }
    }

    /// Seed the segment hasher with bytes already on disk, so a resumed
    /// segment's final digest covers the whole range.
    async fn prepare_hasher(&self) -> DownloadResult<Option<StreamingHasher>> {
        let Some(algorithm) = self.hash_algorithm else {
            return Ok(None);
        };
        let mut hasher = StreamingHasher::new(algorithm);
        if self.segment.downloaded > 0 {
            seed_hasher_from_part(&mut hasher, &self.segment.part_path, self.segment.downloaded)
                .await?;
        }
        Ok(Some(hasher))
    }

    /// One HTTP attempt: request, stream, write, hash.
    async fn attempt(&mut self, hasher: &mut Option<StreamingHasher>) -> DownloadResult<()> {
        let part_path = self.segment.part_path.clone();

        // Reopen per attempt; discard any bytes past the counter left by a
        // write that never reached it.
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&part_path)
            .await
            .map_err(|e| DownloadError::from_io(&part_path, e))?;
        file.set_len(self.segment.downloaded)
            .await
            .map_err(|e| DownloadError::from_io(&part_path, e))?;
        file.seek(SeekFrom::End(0))
            .await
            .map_err(|e| DownloadError::from_io(&part_path, e))?;

        let range = format!(
            "bytes={}-{}",
            self.segment.resume_offset(),
            self.segment.end
        );
        let mut request = self
            .client
            .get(&self.url)
            .timeout(Duration::from_millis(self.timeout_ms));
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request = request.header("range", range);

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = request.send() => result
                .map_err(|e| DownloadError::from_http(&self.url, self.timeout_ms, e))?,
        };

        let status = response.status().as_u16();
        match status {
            206 => {}
            200 => {
                // A full-body response only stands in for a range when we
                // asked from byte zero and the body is exactly the segment.
                let full_length = response
                    .headers()
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                let acceptable = self.segment.start == 0
                    && self.segment.downloaded == 0
                    && full_length == Some(self.segment.byte_len());
                if !acceptable {
                    return Err(DownloadError::RangeNotSatisfiable {
                        url: self.url.clone(),
                    });
                }
            }
            other => return Err(DownloadError::from_status(&self.url, other)),
        }

        let mut stream = response.bytes_stream();
        let mut last_tick = Instant::now();
        let mut bytes_since_tick: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    file.flush().await.ok();
                    return Err(DownloadError::Cancelled);
                }
                next = tokio::time::timeout(
                    Duration::from_millis(self.timeout_ms),
                    stream.next(),
                ) => match next {
                    Err(_) => {
                        return Err(DownloadError::Timeout {
                            url: self.url.clone(),
                            timeout_ms: self.timeout_ms,
                        });
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        return Err(DownloadError::from_http(&self.url, self.timeout_ms, e));
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                },
            };

            let remaining = self.segment.remaining();
            if remaining == 0 {
                break;
            }
            // A 200 response may carry more than the segment; never write
            // past the segment end.
            let take = (chunk.len() as u64).min(remaining) as usize;
            let data = &chunk[..take];

            file.write_all(data)
                .await
                .map_err(|e| DownloadError::from_io(&part_path, e))?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(data);
            }
            self.segment.downloaded += take as u64;
            bytes_since_tick += take as u64;

            let elapsed = last_tick.elapsed();
            if elapsed >= PROGRESS_TICK_INTERVAL {
                let speed = (bytes_since_tick as f64 / elapsed.as_secs_f64()) as u64;
                self.tick(speed).await;
                last_tick = Instant::now();
                bytes_since_tick = 0;
            }

            if self.segment.remaining() == 0 {
                break;
            }
        }

        if self.segment.remaining() > 0 {
            // Server closed the body early; retryable.
            return Err(DownloadError::Network {
                url: self.url.clone(),
                detail: format!(
                    "body ended {} bytes short of the requested range",
                    self.segment.remaining()
                ),
            });
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::from_io(&part_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::from_io(&part_path, e))?;
        Ok(())
    }

    async fn tick(&self, speed_sample: u64) {
        let _ = self
            .events
            .send(WorkerEvent::ProgressTick {
                segment_id: self.segment.id.clone(),
                downloaded: self.segment.downloaded,
                speed_sample,
            })
            .await;
    }

    /// Cancellation exit: report the exact counter so pause persists precise
    /// per-segment totals, leave status for the orchestrator to set.
    async fn stopped(self) -> Segment {
        self.tick(0).await;
        debug!(segment = %self.segment.id, downloaded = self.segment.downloaded, "worker stopped");
        self.segment
    }

    async fn fail(mut self, error: DownloadError) -> Segment {
        warn!(segment = %self.segment.id, error = %error, "segment failed");
        self.segment.status = Status::Failed;
        let _ = self
            .events
            .send(WorkerEvent::SegmentFailed {
                segment_id: self.segment.id.clone(),
                downloaded: self.segment.downloaded,
                error,
            })
            .await;
        self.segment
    }
}

/// Feed the first `len` bytes of a part file into `hasher`.
pub async fn seed_hasher_from_part(
    hasher: &mut StreamingHasher,
    path: &std::path::Path,
    len: u64,
) -> DownloadResult<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| DownloadError::from_io(path, e))?;
    let mut remaining = len;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = (buffer.len() as u64).min(remaining) as usize;
        let n = file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| DownloadError::from_io(path, e))?;
        if n == 0 {
            return Err(DownloadError::FsOther {
                path: path.to_path_buf(),
                detail: format!("part file shorter than recorded progress ({remaining} bytes missing)"),
            });
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(())
}
