use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::planner::ChunkRange;

/// Default sliding window for speed calculation.
const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Default cap on retained samples.
const DEFAULT_MAX_SAMPLES: usize = 100;

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    total_bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed from cumulative byte samples in a sliding window.
///
/// Speed is the byte delta between the oldest and newest retained sample
/// divided by the time between them.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
                window_size: window_size.unwrap_or(DEFAULT_WINDOW),
            }),
        }
    }

    /// Records the cumulative byte total observed now.
    pub fn add_sample(&self, total_bytes: u64) {
        self.add_sample_at(total_bytes, Instant::now());
    }

    /// Records the cumulative byte total observed at `timestamp`.
    pub fn add_sample_at(&self, total_bytes: u64, timestamp: Instant) {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        s.samples.push(SpeedSample {
            total_bytes,
            timestamp,
        });

        // Prune samples outside the window, keeping the newest.
        if let Some(cutoff) = timestamp.checked_sub(s.window_size) {
            let len = s.samples.len();
            let stale = s.samples[..len - 1]
                .iter()
                .take_while(|sample| sample.timestamp < cutoff)
                .count();
            s.samples.drain(..stale);
        }

        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Returns the speed in bytes/second within the window.
    ///
    /// Returns 0.0 with fewer than 2 samples or when the total went down.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.saturating_duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        last.total_bytes.saturating_sub(first.total_bytes) as f64 / elapsed.as_secs_f64()
    }

    /// Estimates time remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if speed is zero.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }

    /// Clears all recorded samples.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        s.samples.clear();
    }
}

// ---------------------------------------------------------------------------
// FileProgress
// ---------------------------------------------------------------------------

/// Point-in-time progress of one file.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Bytes per second.
    pub speed: f64,
    /// Seconds remaining; absent while speed is zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
}

/// Per-chunk byte counters of one file.
pub struct FileProgress {
    total_bytes: u64,
    chunk_lens: Vec<u64>,
    transferred: Vec<u64>,
    speed: SpeedCalculator,
}

impl FileProgress {
    pub fn new(ranges: &[ChunkRange]) -> Self {
        Self {
            total_bytes: ranges.iter().map(ChunkRange::len).sum(),
            chunk_lens: ranges.iter().map(ChunkRange::len).collect(),
            transferred: vec![0; ranges.len()],
            speed: SpeedCalculator::default(),
        }
    }

    /// Records `bytes` sent so far by the current attempt of chunk `index`.
    ///
    /// The counter never decreases within an attempt and never exceeds the
    /// chunk's length.
    pub fn record(&mut self, index: usize, bytes: u64) {
        self.record_at(index, bytes, Instant::now());
    }

    pub fn record_at(&mut self, index: usize, bytes: u64, now: Instant) {
        let (Some(slot), Some(&len)) = (self.transferred.get_mut(index), self.chunk_lens.get(index))
        else {
            return;
        };
        let bytes = bytes.min(len);
        if bytes > *slot {
            *slot = bytes;
        }
        self.speed.add_sample_at(self.uploaded(), now);
    }

    /// Zeroes chunk `index` ahead of a fresh attempt.
    pub fn reset_chunk(&mut self, index: usize) {
        if let Some(slot) = self.transferred.get_mut(index) {
            *slot = 0;
        }
    }

    /// Marks chunk `index` as fully transferred.
    pub fn complete_chunk(&mut self, index: usize) {
        if let Some(&len) = self.chunk_lens.get(index) {
            self.record(index, len);
        }
    }

    /// Bytes transferred by chunk `index`.
    pub fn chunk_transferred(&self, index: usize) -> u64 {
        self.transferred.get(index).copied().unwrap_or(0)
    }

    /// Sum of all chunk counters.
    pub fn uploaded(&self) -> u64 {
        self.transferred.iter().sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// True iff every chunk transferred exactly its own length.
    pub fn is_byte_complete(&self) -> bool {
        self.transferred
            .iter()
            .zip(&self.chunk_lens)
            .all(|(done, len)| done == len)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let uploaded = self.uploaded();
        let percent = if self.total_bytes == 0 {
            0.0
        } else {
            uploaded as f64 * 100.0 / self.total_bytes as f64
        };
        let speed = self.speed.bytes_per_second();
        let eta_secs = self
            .speed
            .eta(self.total_bytes.saturating_sub(uploaded))
            .map(|d| d.as_secs_f64());
        ProgressSnapshot {
            uploaded_bytes: uploaded,
            total_bytes: self.total_bytes,
            percent,
            speed,
            eta_secs,
        }
    }
}
