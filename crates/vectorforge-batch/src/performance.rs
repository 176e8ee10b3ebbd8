//! Batch performance tracking and adaptive size optimization.
//!
//! A bounded window of per-batch samples feeds the sizing rule: high
//! median error rates shrink the batch, sustained throughput with low
//! errors grows it, anything else holds.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error-rate threshold above which batches shrink
const HIGH_ERROR_RATE: f64 = 0.10;
/// Error-rate threshold below which batches may grow
const LOW_ERROR_RATE: f64 = 0.05;
/// Throughput threshold (objects/sec) above which batches may grow
const HIGH_THROUGHPUT: f64 = 100.0;

/// Performance sample for one dispatched batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSample {
    /// Number of objects in the batch
    pub batch_size: usize,
    /// Wall-clock duration in seconds
    pub duration_secs: f64,
    /// Objects per second
    pub objects_per_sec: f64,
    /// Failed fraction in `[0, 1]`
    pub error_rate: f64,
    /// Resident memory at completion, when sampled
    pub memory_mb: Option<f64>,
    /// Completion timestamp
    pub recorded_at: DateTime<Utc>,
}

impl BatchSample {
    /// Build a sample from batch counts and timing
    #[must_use]
    pub fn from_counts(
        batch_size: usize,
        duration_secs: f64,
        successful: usize,
        failed: usize,
        memory_mb: Option<f64>,
    ) -> Self {
        let total = successful + failed;
        let objects_per_sec = if duration_secs > 0.0 {
            total as f64 / duration_secs
        } else {
            0.0
        };
        let error_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };
        Self {
            batch_size,
            duration_secs,
            objects_per_sec,
            error_rate,
            memory_mb,
            recorded_at: Utc::now(),
        }
    }
}

/// Summary of the tracker's current window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackerSummary {
    /// Size the next dispatch should use
    pub optimal_batch_size: usize,
    /// Mean objects per second over the window
    pub mean_throughput: f64,
    /// Median error rate over the window
    pub median_error_rate: f64,
    /// Distinct batch sizes observed, ascending
    pub batch_sizes_used: Vec<usize>,
    /// Samples currently retained
    pub samples: usize,
}

/// Tracks batch samples and adapts the optimal batch size
#[derive(Debug)]
pub struct BatchPerformanceTracker {
    min_batch_size: usize,
    max_batch_size: usize,
    window_size: usize,
    history: VecDeque<BatchSample>,
    optimal_batch_size: usize,
}

impl BatchPerformanceTracker {
    /// Create a tracker; the optimal size starts at the minimum
    #[must_use]
    pub fn new(min_batch_size: usize, max_batch_size: usize, window_size: usize) -> Self {
        Self {
            min_batch_size,
            max_batch_size,
            window_size: window_size.max(1),
            history: VecDeque::new(),
            optimal_batch_size: min_batch_size,
        }
    }

    /// Size the next dispatch should use
    #[must_use]
    pub const fn optimal_batch_size(&self) -> usize {
        self.optimal_batch_size
    }

    /// Record a completed batch and re-optimize
    ///
    /// Samples apply in completion order; the window keeps the most
    /// recent `window_size` entries.
    pub fn record_sample(&mut self, sample: BatchSample) {
        self.history.push_back(sample);
        while self.history.len() > self.window_size {
            self.history.pop_front();
        }
        self.optimize();
    }

    fn optimize(&mut self) {
        if self.history.len() < 2 {
            return;
        }
        let throughput = mean(self.history.iter().map(|s| s.objects_per_sec));
        let error_rate = median(self.history.iter().map(|s| s.error_rate));
        let current = self
            .history
            .back()
            .map_or(self.optimal_batch_size, |s| s.batch_size);

        self.optimal_batch_size = if error_rate > HIGH_ERROR_RATE {
            self.min_batch_size
                .max((current as f64 * 0.8).floor() as usize)
        } else if throughput > HIGH_THROUGHPUT && error_rate < LOW_ERROR_RATE {
            self.max_batch_size
                .min((current as f64 * 1.2).floor() as usize)
        } else {
            current
        };

        debug!(
            optimal = self.optimal_batch_size,
            throughput, error_rate, "batch size optimized"
        );
    }

    /// Window summary, `None` before any sample
    #[must_use]
    pub fn summary(&self) -> Option<TrackerSummary> {
        if self.history.is_empty() {
            return None;
        }
        let mut sizes: Vec<usize> = self.history.iter().map(|s| s.batch_size).collect();
        sizes.sort_unstable();
        sizes.dedup();
        Some(TrackerSummary {
            optimal_batch_size: self.optimal_batch_size,
            mean_throughput: mean(self.history.iter().map(|s| s.objects_per_sec)),
            median_error_rate: median(self.history.iter().map(|s| s.error_rate)),
            batch_sizes_used: sizes,
            samples: self.history.len(),
        })
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.iter().sum::<f64>() / collected.len() as f64
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut collected: Vec<f64> = values.collect();
    if collected.is_empty() {
        return 0.0;
    }
    collected.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = collected.len() / 2;
    if collected.len() % 2 == 0 {
        (collected[mid - 1] + collected[mid]) / 2.0
    } else {
        collected[mid]
    }
}
