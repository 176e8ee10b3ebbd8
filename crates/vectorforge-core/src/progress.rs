//! Progress tracking for long-running batch operations.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// Kind of batch operation being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Writing new objects
    Index,
    /// Rewriting existing objects
    Update,
    /// Removing objects
    Delete,
    /// Embedding or annotating chunks
    Process,
}

#[derive(Debug, Default)]
struct Counters {
    completed: usize,
    failed: usize,
}

/// Tracks completion counts and throughput for one operation
#[derive(Debug)]
pub struct ProgressTracker {
    operation: OperationKind,
    total_items: usize,
    counters: Mutex<Counters>,
    started: Instant,
}

/// Point-in-time view of a tracker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Operation being tracked
    pub operation: OperationKind,
    /// Expected number of items
    pub total_items: usize,
    /// Items finished successfully
    pub completed: usize,
    /// Items finished with an error
    pub failed: usize,
    /// Items per second since the tracker started
    pub rate_per_sec: f64,
    /// Estimated time remaining, when the rate is usable
    pub eta_secs: Option<f64>,
}

impl ProgressTracker {
    /// Start tracking `total_items` items of `operation`
    #[must_use]
    pub fn new(operation: OperationKind, total_items: usize) -> Self {
        Self {
            operation,
            total_items,
            counters: Mutex::new(Counters::default()),
            started: Instant::now(),
        }
    }

    /// Record a finished sub-batch
    pub fn complete_batch(&self, succeeded: usize, failed: usize) {
        let mut counters = self.counters.lock();
        counters.completed += succeeded;
        counters.failed += failed;
    }

    /// Items finished so far, success or failure
    #[must_use]
    pub fn finished(&self) -> usize {
        let counters = self.counters.lock();
        counters.completed + counters.failed
    }

    /// True once every expected item has finished
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.finished() >= self.total_items
    }

    /// Elapsed time since tracking began
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Current snapshot with rate and ETA estimates
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let counters = self.counters.lock();
        let finished = counters.completed + counters.failed;
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            finished as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total_items.saturating_sub(finished);
        let eta = if rate > 0.0 && remaining > 0 {
            Some(remaining as f64 / rate)
        } else {
            None
        };
        ProgressSnapshot {
            operation: self.operation,
            total_items: self.total_items,
            completed: counters.completed,
            failed: counters.failed,
            rate_per_sec: rate,
            eta_secs: eta,
        }
    }
}
