//! In-process operation metrics with bounded per-operation history.
//!
//! Every measured scope appends an [`OperationMetric`] to a ring buffer
//! keyed by operation name; older entries are dropped at capacity.
//! Recording never fails: missing metadata or counters degrade to
//! `None`, and observer callbacks run after the sample is stored.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;

/// Default number of samples retained per operation name
pub const DEFAULT_WINDOW_CAPACITY: usize = 1024;

/// A single recorded operation sample
#[derive(Debug, Clone)]
pub struct OperationMetric {
    /// Operation name
    pub name: String,
    /// Wall-clock duration in milliseconds
    pub duration_ms: f64,
    /// Resident memory at record time, when sampled
    pub memory_mb: Option<f64>,
    /// Batch size for batched operations
    pub batch_size: Option<usize>,
    /// Whether the operation succeeded
    pub success: bool,
    /// Error kind for failed operations
    pub error_kind: Option<String>,
    /// Free-form metadata
    pub metadata: HashMap<String, Value>,
    /// Wall-clock timestamp of the record
    pub recorded_at: DateTime<Utc>,
}

/// Window statistics over retained durations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// Number of samples in the window
    pub count: usize,
    /// Mean duration in milliseconds
    pub mean: f64,
    /// Median duration in milliseconds
    pub median: f64,
    /// Minimum duration in milliseconds
    pub min: f64,
    /// Maximum duration in milliseconds
    pub max: f64,
}

/// Observer callback invoked after each recorded sample
pub type UpdateObserver = Box<dyn Fn(&str, f64) + Send + Sync>;

/// Bounded, concurrent collector of operation samples
pub struct MetricsCollector {
    capacity: usize,
    rings: DashMap<String, VecDeque<OperationMetric>>,
    observers: RwLock<Vec<UpdateObserver>>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("capacity", &self.capacity)
            .field("operations", &self.rings.len())
            .finish_non_exhaustive()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    /// Create a collector with the default window capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW_CAPACITY)
    }

    /// Create a collector retaining at most `capacity` samples per name
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rings: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Append a sample, dropping the oldest entry at capacity
    pub fn record(&self, metric: OperationMetric) {
        let name = metric.name.clone();
        let duration = metric.duration_ms;
        {
            let mut ring = self.rings.entry(name.clone()).or_default();
            if ring.len() >= self.capacity {
                ring.pop_front();
            }
            ring.push_back(metric);
        }
        self.notify(&name, duration);
    }

    /// Record a bare success/failure sample without a scope
    pub fn record_sample(
        &self,
        name: impl Into<String>,
        duration_ms: f64,
        memory_mb: Option<f64>,
        metadata: HashMap<String, Value>,
    ) {
        self.record(OperationMetric {
            name: name.into(),
            duration_ms,
            memory_mb,
            batch_size: None,
            success: true,
            error_kind: None,
            metadata,
            recorded_at: Utc::now(),
        });
    }

    /// Start a scoped timer for `name`
    ///
    /// Dropping the scope records a success sample; calling
    /// [`OperationScope::fail`] first records a failure with the error
    /// kind. Duration is measured either way.
    #[must_use]
    pub fn track_operation(
        &self,
        name: impl Into<String>,
        batch_size: Option<usize>,
        metadata: Option<HashMap<String, Value>>,
    ) -> OperationScope<'_> {
        OperationScope {
            collector: self,
            name: name.into(),
            batch_size,
            metadata: metadata.unwrap_or_default(),
            memory_mb: None,
            started: Instant::now(),
            error_kind: None,
        }
    }

    /// Window statistics for `name`, `None` when nothing was recorded
    #[must_use]
    pub fn stats(&self, name: &str) -> Option<WindowStats> {
        let ring = self.rings.get(name)?;
        if ring.is_empty() {
            return None;
        }
        let mut durations: Vec<f64> = ring.iter().map(|m| m.duration_ms).collect();
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = durations.len();
        let mean = durations.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 0 {
            (durations[count / 2 - 1] + durations[count / 2]) / 2.0
        } else {
            durations[count / 2]
        };
        Some(WindowStats {
            count,
            mean,
            median,
            min: durations[0],
            max: durations[count - 1],
        })
    }

    /// Newest-first copies of the most recent `n` samples for `name`
    #[must_use]
    pub fn recent(&self, name: &str, n: usize) -> Vec<OperationMetric> {
        self.rings
            .get(name)
            .map(|ring| ring.iter().rev().take(n).cloned().collect())
            .unwrap_or_default()
    }

    /// Fraction of retained samples for `name` that succeeded
    #[must_use]
    pub fn success_rate(&self, name: &str) -> Option<f64> {
        let ring = self.rings.get(name)?;
        if ring.is_empty() {
            return None;
        }
        let ok = ring.iter().filter(|m| m.success).count();
        Some(ok as f64 / ring.len() as f64)
    }

    /// Register an `on_update(name, duration_ms)` observer
    ///
    /// Observers must not own the collector; they are plain callbacks
    /// and never extend the subject's lifetime.
    pub fn on_update(&self, observer: UpdateObserver) {
        self.observers.write().push(observer);
    }

    fn notify(&self, name: &str, duration_ms: f64) {
        for observer in self.observers.read().iter() {
            observer(name, duration_ms);
        }
    }
}

/// RAII scope produced by [`MetricsCollector::track_operation`]
pub struct OperationScope<'a> {
    collector: &'a MetricsCollector,
    name: String,
    batch_size: Option<usize>,
    metadata: HashMap<String, Value>,
    memory_mb: Option<f64>,
    started: Instant,
    error_kind: Option<String>,
}

impl std::fmt::Debug for OperationScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationScope")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl OperationScope<'_> {
    /// Mark the scope failed with an error kind; recording happens on drop
    pub fn fail(&mut self, kind: impl Into<String>) {
        self.error_kind = Some(kind.into());
    }

    /// Attach a resident-memory reading to the sample
    pub fn set_memory_mb(&mut self, memory_mb: f64) {
        self.memory_mb = Some(memory_mb);
    }

    /// Attach extra metadata to the sample
    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut metadata = std::mem::take(&mut self.metadata);
        if let Some(kind) = &self.error_kind {
            metadata.insert("error_kind".into(), Value::String(kind.clone()));
        }
        self.collector.record(OperationMetric {
            name: std::mem::take(&mut self.name),
            duration_ms,
            memory_mb: self.memory_mb,
            batch_size: self.batch_size,
            success: self.error_kind.is_none(),
            error_kind: self.error_kind.take(),
            metadata,
            recorded_at: Utc::now(),
        });
    }
}
