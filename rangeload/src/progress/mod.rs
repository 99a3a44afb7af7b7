//! Rolling-window speed and ETA computation.
//!
//! The orchestrator feeds cumulative byte counts into a [`SpeedWindow`] as
//! progress events arrive; observers read a [`ProgressSnapshot`] derived from
//! the window. Speed is averaged over a short trailing window and smoothed
//! exponentially so the displayed value does not jump with every burst.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Length of the trailing window speed is averaged over.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Smoothing factor blending the new window average into the published speed.
const SMOOTHING_FACTOR: f64 = 0.3;

/// Rolling window over cumulative downloaded-byte samples.
#[derive(Debug)]
pub struct SpeedWindow {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    smoothed_bps: f64,
}

impl SpeedWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            smoothed_bps: 0.0,
        }
    }

    /// Record the current cumulative byte count.
    ///
    /// Samples older than the window are dropped. The cumulative counter is
    /// expected to be monotone; a smaller value than the previous sample
    /// (fresh task after a restart) resets the window.
    pub fn record(&mut self, cumulative_bytes: u64) {
        self.record_at(Instant::now(), cumulative_bytes);
    }

    fn record_at(&mut self, now: Instant, cumulative_bytes: u64) {
        if let Some(&(_, last)) = self.samples.back() {
            if cumulative_bytes < last {
                self.samples.clear();
                self.smoothed_bps = 0.0;
            }
        }
        self.samples.push_back((now, cumulative_bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > self.window && self.samples.len() > 1 {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let window_bps = self.window_average(now);
        self.smoothed_bps = if self.smoothed_bps == 0.0 {
            window_bps
        } else {
            self.smoothed_bps + SMOOTHING_FACTOR * (window_bps - self.smoothed_bps)
        };
    }

    fn window_average(&self, now: Instant) -> f64 {
        let (&(first_t, first_b), &(_, last_b)) =
            match (self.samples.front(), self.samples.back()) {
                (Some(f), Some(l)) => (f, l),
                _ => return 0.0,
            };
        let elapsed = now.duration_since(first_t).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (last_b.saturating_sub(first_b)) as f64 / elapsed
    }

    /// Current smoothed speed in bytes per second.
    pub fn speed_bps(&self) -> f64 {
        self.smoothed_bps
    }

    /// Seconds until `total` bytes at the current speed, if speed is nonzero.
    pub fn eta_seconds(&self, downloaded: u64, total: u64) -> Option<u64> {
        if self.smoothed_bps <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(downloaded);
        Some((remaining as f64 / self.smoothed_bps).ceil() as u64)
    }
}

impl Default for SpeedWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

/// Point-in-time progress view published to observers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    pub percentage: f64,
    pub downloaded: u64,
    pub total: u64,
    pub speed_bps: f64,
    pub eta_seconds: Option<u64>,
}

impl ProgressSnapshot {
    /// Build a snapshot from counters and the speed window.
    pub fn from_window(downloaded: u64, total: u64, window: &SpeedWindow) -> Self {
        let percentage = if total == 0 {
            if downloaded == 0 {
                100.0
            } else {
                0.0
            }
        } else {
            (downloaded as f64 / total as f64) * 100.0
        };
        Self {
            percentage,
            downloaded,
            total,
            speed_bps: window.speed_bps(),
            eta_seconds: window.eta_seconds(downloaded, total),
        }
    }
}
