//! Per-file transfer telemetry: smoothed speed, time left, elapsed time and
//! per-chunk state.

use crate::model::DownloadStatus;
use crate::transport::DownloadPackage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Number of samples kept in each smoothing window
pub const SPEED_WINDOW: usize = 101;

/// Ticks of the telemetry timer that make up one elapsed second
pub const TICKS_PER_SECOND: u8 = 4;

/// Period of the telemetry timer
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Two-stage speed smoother
///
/// Average-speed samples go into a rolling window whose median becomes one
/// smoothed sample; the time estimate uses the mean of the last smoothed
/// samples so single spikes do not make the ETA jump around.
#[derive(Debug, Clone)]
pub struct SpeedSmoother {
    samples: VecDeque<f64>,
    smoothed: VecDeque<f64>,
    window: usize,
}

impl Default for SpeedSmoother {
    fn default() -> Self {
        Self::new(SPEED_WINDOW)
    }
}

impl SpeedSmoother {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            smoothed: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Record one average-speed sample (bytes per second)
    pub fn record(&mut self, average_speed: f64) {
        if !average_speed.is_finite() {
            return;
        }
        self.samples.push_back(average_speed);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        if let Some(median) = median(&self.samples) {
            self.smoothed.push_back(median);
            while self.smoothed.len() > self.window {
                self.smoothed.pop_front();
            }
        }
    }

    /// Mean of the smoothed samples
    pub fn mean_speed(&self) -> Option<f64> {
        if self.smoothed.is_empty() {
            return None;
        }
        let mean = self.smoothed.iter().sum::<f64>() / self.smoothed.len() as f64;
        if mean.is_finite() {
            Some(mean)
        } else {
            None
        }
    }

    /// Estimated time for the remaining bytes; `None` while the speed is unusable
    pub fn time_left(&self, remaining_bytes: u64) -> Option<Duration> {
        let mean = self.mean_speed()?;
        if mean <= 0.0 {
            return None;
        }
        let seconds = remaining_bytes as f64 / mean;
        // Out of range for a Duration when the speed is vanishingly small
        Duration::try_from_secs_f64(seconds).ok()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn smoothed_count(&self) -> usize {
        self.smoothed.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.smoothed.clear();
    }
}

fn median(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Counts whole seconds from the 250 ms telemetry timer
#[derive(Debug, Clone, Default)]
pub struct ElapsedTicker {
    ticks: u8,
    elapsed: Duration,
    suspended: bool,
}

impl ElapsedTicker {
    pub fn starting_at(elapsed: Duration) -> Self {
        Self {
            ticks: 0,
            elapsed,
            suspended: false,
        }
    }

    /// Advance by one timer tick; returns true when a whole second was added
    pub fn tick(&mut self) -> bool {
        if self.suspended {
            return false;
        }
        self.ticks += 1;
        if self.ticks >= TICKS_PER_SECOND {
            self.ticks = 0;
            self.elapsed += Duration::from_secs(1);
            return true;
        }
        false
    }

    /// Merging does not count as transfer time
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

/// Progress sample of one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkProgress {
    pub chunk_id: String,
    pub received: u64,
    pub total: u64,
    pub is_completed: bool,
}

/// Display state of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkState {
    Receiving,
    Connecting,
    Paused,
    Completed,
}

impl ChunkState {
    pub fn label(&self) -> &'static str {
        match self {
            ChunkState::Receiving => "Receiving...",
            ChunkState::Connecting => "Connecting...",
            ChunkState::Paused => "Paused",
            ChunkState::Completed => "Completed",
        }
    }
}

#[derive(Debug, Clone)]
struct ChunkEntry {
    progress: ChunkProgress,
    received_at_last_tick: u64,
    state: ChunkState,
}

/// Chunk progress and state as surfaced to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkView {
    pub progress: ChunkProgress,
    pub state: ChunkState,
}

/// Tracks chunk progress by chunk id
#[derive(Debug, Clone, Default)]
pub struct ChunkTracker {
    chunks: BTreeMap<String, ChunkEntry>,
}

impl ChunkTracker {
    pub fn update(&mut self, progress: ChunkProgress) {
        match self.chunks.get_mut(&progress.chunk_id) {
            Some(entry) => {
                if progress.is_completed {
                    entry.state = ChunkState::Completed;
                }
                entry.progress = progress;
            }
            None => {
                let state = if progress.is_completed {
                    ChunkState::Completed
                } else {
                    ChunkState::Connecting
                };
                self.chunks.insert(
                    progress.chunk_id.clone(),
                    ChunkEntry {
                        received_at_last_tick: progress.received,
                        progress,
                        state,
                    },
                );
            }
        }
    }

    /// Refresh chunk states from the size change since the previous tick
    pub fn tick(&mut self) {
        for entry in self.chunks.values_mut() {
            entry.state = if entry.progress.is_completed {
                ChunkState::Completed
            } else if entry.progress.received > entry.received_at_last_tick {
                ChunkState::Receiving
            } else {
                ChunkState::Connecting
            };
            entry.received_at_last_tick = entry.progress.received;
        }
    }

    pub fn pause_all(&mut self) {
        for entry in self.chunks.values_mut() {
            if !entry.progress.is_completed {
                entry.state = ChunkState::Paused;
            }
        }
    }

    /// Rebuild the table of a paused download from its package
    pub fn restore(&mut self, package: &DownloadPackage) {
        self.chunks.clear();
        for chunk in &package.chunks {
            self.update(chunk.progress());
        }
        self.pause_all();
    }

    pub fn views(&self) -> Vec<ChunkView> {
        self.chunks
            .values()
            .map(|entry| ChunkView {
                progress: entry.progress.clone(),
                state: entry.state,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }
}

/// Telemetry state kept for a file while it is active
#[derive(Debug, Clone, Default)]
pub struct FileTelemetry {
    pub speed: SpeedSmoother,
    pub elapsed: ElapsedTicker,
    pub chunks: ChunkTracker,
    pub merge_percent: Option<f64>,
}

impl FileTelemetry {
    /// Fresh telemetry continuing from a previously recorded elapsed time
    pub fn resuming_from(elapsed: Duration) -> Self {
        Self {
            elapsed: ElapsedTicker::starting_at(elapsed),
            ..Self::default()
        }
    }
}

/// Read-only view of a file's transfer state
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub status: DownloadStatus,
    pub received: u64,
    pub total: Option<u64>,
    pub percent: f64,
    /// Bytes per second
    pub transfer_rate: f64,
    pub time_left: Option<Duration>,
    pub elapsed: Duration,
    pub merge_percent: Option<f64>,
    pub chunks: Vec<ChunkView>,
}

/// Percentage of `received` in `total`, 0 when the total is unknown or zero
pub fn percent_of(received: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => (received as f64 / total as f64 * 100.0).min(100.0),
        _ => 0.0,
    }
}
