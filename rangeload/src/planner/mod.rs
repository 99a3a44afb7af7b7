//! Segmentation planner.
//!
//! Decides how many byte-range segments a download gets and where their
//! boundaries fall. Planning is a pure function of its inputs: the same file
//! size, concurrency ceiling, and network quality always produce the same
//! partition, and segment ids are the stable sequence `segment_0 ..
//! segment_{N-1}`.
//!
//! The planner also provides [`split_segment`] for dynamic rebalancing: a
//! lagging or failed segment whose remaining range is still worth splitting
//! can be replaced by two child segments with fresh ids, preserving the
//! bytes the parent already wrote.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DownloadError, DownloadResult};
use crate::task::{Segment, Status};

/// Files below this size are never segmented (1MB).
pub const SINGLE_SEGMENT_THRESHOLD: u64 = 1024 * 1024;

/// Bounds that shape the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentationLimits {
    /// Floor for a segment worth keeping; splits never produce children
    /// smaller than this.
    pub min_chunk: u64,
    /// Preferred segment size.
    pub optimal_chunk: u64,
    /// Hard ceiling on a planned segment's size.
    pub max_chunk: u64,
}

impl SegmentationLimits {
    /// Derive limits from a task's configured chunk size.
    pub fn from_chunk_size(chunk_size: u64) -> Self {
        Self {
            min_chunk: (chunk_size / 16).max(64 * 1024),
            optimal_chunk: chunk_size,
            max_chunk: chunk_size.saturating_mul(16),
        }
    }
}

impl Default for SegmentationLimits {
    fn default() -> Self {
        Self::from_chunk_size(1024 * 1024)
    }
}

/// Observed network quality, scaling the segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    Poor,
    Fair,
    Good,
    Excellent,
}

impl NetworkQuality {
    /// Multiplier applied to the planned segment count.
    pub fn factor(&self) -> f64 {
        match self {
            Self::Poor => 0.5,
            Self::Fair => 0.75,
            Self::Good => 1.0,
            Self::Excellent => 1.5,
        }
    }
}

/// Plan the segment partition of `[0, total_size)`.
///
/// A file below [`SINGLE_SEGMENT_THRESHOLD`] or a server without range
/// support gets exactly one segment. Otherwise the count starts from
/// `max_concurrency`, is clamped between `ceil(total / max_chunk)` and
/// `ceil(total / optimal_chunk)`, scaled by network quality, and re-capped
/// at `max_concurrency`. Boundaries are near-equal; the last segment absorbs
/// the division remainder.
///
/// `part_path` maps a segment index to the scratch file its worker writes.
///
/// # Errors
///
/// `InvalidPlan` when `max_concurrency` is zero or the limits are
/// inconsistent.
pub fn plan(
    total_size: u64,
    accept_ranges: bool,
    max_concurrency: usize,
    network_quality: Option<NetworkQuality>,
    limits: &SegmentationLimits,
    part_path: impl Fn(usize) -> PathBuf,
) -> DownloadResult<Vec<Segment>> {
    if max_concurrency == 0 {
        return Err(DownloadError::InvalidPlan {
            detail: "max_concurrency is zero".to_string(),
        });
    }
    if limits.optimal_chunk == 0 || limits.max_chunk < limits.optimal_chunk {
        return Err(DownloadError::InvalidPlan {
            detail: format!(
                "inconsistent limits: optimal_chunk={}, max_chunk={}",
                limits.optimal_chunk, limits.max_chunk
            ),
        });
    }

    // Zero-byte resource: one placeholder segment, already complete.
    if total_size == 0 {
        let mut segment = Segment::new("segment_0", 0, 0, part_path(0));
        segment.status = Status::Completed;
        return Ok(vec![segment]);
    }

    if total_size < SINGLE_SEGMENT_THRESHOLD || !accept_ranges {
        return Ok(vec![Segment::new(
            "segment_0",
            0,
            total_size - 1,
            part_path(0),
        )]);
    }

    let count = segment_count(total_size, max_concurrency, network_quality, limits);
    Ok(partition(total_size, count, part_path))
}

/// Number of segments for a range-capable download.
fn segment_count(
    total_size: u64,
    max_concurrency: usize,
    network_quality: Option<NetworkQuality>,
    limits: &SegmentationLimits,
) -> usize {
    let lo = total_size.div_ceil(limits.max_chunk).max(1) as usize;
    let hi = total_size.div_ceil(limits.optimal_chunk).max(1) as usize;
    // max_chunk >= optimal_chunk guarantees lo <= hi.
    let mut count = (max_concurrency.clamp(lo, hi)).min(max_concurrency);

    if let Some(quality) = network_quality {
        let scaled = (count as f64 * quality.factor()).round() as usize;
        count = scaled.clamp(1, max_concurrency);
    }

    // Never more segments than bytes.
    count.min(total_size as usize).max(1)
}

/// Partition `[0, total_size)` into `count` near-equal inclusive ranges.
fn partition(total_size: u64, count: usize, part_path: impl Fn(usize) -> PathBuf) -> Vec<Segment> {
    let base = total_size / count as u64;
    let mut segments = Vec::with_capacity(count);
    for i in 0..count {
        let start = i as u64 * base;
        let end = if i == count - 1 {
            total_size - 1
        } else {
            (i as u64 + 1) * base - 1
        };
        segments.push(Segment::new(format!("segment_{i}"), start, end, part_path(i)));
    }
    segments
}

/// Split a segment's remaining range into two children.
///
/// The first child keeps the parent's part file and completed bytes; the
/// second starts empty at `right_part_path`. Returns `None` when the
/// remaining range is too small to be worth two workers (at or below
/// `2 * min_chunk`) or the parent already finished.
pub fn split_segment(
    parent: &Segment,
    left_id: impl Into<String>,
    right_id: impl Into<String>,
    right_part_path: PathBuf,
    min_chunk: u64,
) -> Option<(Segment, Segment)> {
    if parent.is_complete() {
        return None;
    }
    let remaining = parent.remaining();
    if remaining <= 2 * min_chunk {
        return None;
    }

    let midpoint = parent.resume_offset() + remaining / 2;

    let mut left = Segment::new(left_id, parent.start, midpoint, parent.part_path.clone());
    left.downloaded = parent.downloaded;
    left.status = Status::Pending;

    let right = Segment::new(right_id, midpoint + 1, parent.end, right_part_path);

    Some((left, right))
}
