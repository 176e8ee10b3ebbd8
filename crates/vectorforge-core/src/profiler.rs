//! Detailed operation profiling: CPU, memory, I/O, and scheduling.
//!
//! The profiler samples process counters around a scope and emits one
//! combined sample into the metrics collector. Counters that the
//! platform does not expose degrade to `None`; profiler failures never
//! abort the profiled operation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use sysinfo::{Pid, System};
use tracing::trace;

use crate::metrics::{MetricsCollector, OperationMetric};
use crate::resources::DeviceProbe;

/// Combined resource counters captured around one operation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileSample {
    /// Wall-clock duration in milliseconds
    pub duration_ms: f64,
    /// Process CPU usage percent at scope exit
    pub cpu_percent: Option<f64>,
    /// Resident memory in MB at scope exit
    pub memory_mb: Option<f64>,
    /// Process thread count
    pub thread_count: Option<u64>,
    /// Bytes read from disk during the scope
    pub read_bytes: Option<u64>,
    /// Bytes written to disk during the scope
    pub written_bytes: Option<u64>,
    /// Voluntary plus involuntary context switches during the scope
    pub context_switches: Option<u64>,
    /// GPU memory in MB, when a probe exposes it
    pub gpu_memory_mb: Option<f64>,
}

/// Profiles operations and reports combined samples to the collector
pub struct OperationProfiler {
    metrics: Arc<MetricsCollector>,
    gpu_probe: Option<Arc<dyn DeviceProbe>>,
    system: Mutex<System>,
    pid: Pid,
}

impl std::fmt::Debug for OperationProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationProfiler").finish_non_exhaustive()
    }
}

impl OperationProfiler {
    /// Create a profiler reporting into `metrics`
    #[must_use]
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self {
            metrics,
            gpu_probe: None,
            system: Mutex::new(System::new()),
            pid: Pid::from_u32(std::process::id()),
        }
    }

    /// Also sample GPU memory through the given probe
    #[must_use]
    pub fn with_gpu_probe(mut self, probe: Arc<dyn DeviceProbe>) -> Self {
        self.gpu_probe = Some(probe);
        self
    }

    /// Start profiling `operation`; the sample records when the scope drops
    #[must_use]
    pub fn profile(&self, operation: impl Into<String>) -> ProfileScope<'_> {
        let start_counters = self.read_counters();
        ProfileScope {
            profiler: self,
            operation: operation.into(),
            started: Instant::now(),
            start_counters,
            error_kind: None,
        }
    }

    fn read_counters(&self) -> RawCounters {
        let mut system = self.system.lock();
        system.refresh_process(self.pid);
        let process = system.process(self.pid);
        let (cpu, memory_mb, read, written) = process.map_or((None, None, None, None), |p| {
            let disk = p.disk_usage();
            (
                Some(f64::from(p.cpu_usage())),
                Some(p.memory() as f64 / 1024.0 / 1024.0),
                Some(disk.total_read_bytes),
                Some(disk.total_written_bytes),
            )
        });
        RawCounters {
            cpu_percent: cpu,
            memory_mb,
            total_read_bytes: read,
            total_written_bytes: written,
            context_switches: read_context_switches(),
            thread_count: read_thread_count(),
        }
    }

    fn finish(&self, scope: &mut ProfileScope<'_>) {
        let duration_ms = scope.started.elapsed().as_secs_f64() * 1000.0;
        let end = self.read_counters();
        let start = &scope.start_counters;

        let sample = ProfileSample {
            duration_ms,
            cpu_percent: average(start.cpu_percent, end.cpu_percent),
            memory_mb: end.memory_mb,
            thread_count: end.thread_count,
            read_bytes: delta(start.total_read_bytes, end.total_read_bytes),
            written_bytes: delta(start.total_written_bytes, end.total_written_bytes),
            context_switches: delta(start.context_switches, end.context_switches),
            gpu_memory_mb: self.gpu_probe.as_ref().and_then(|p| p.gpu_memory_used_mb()),
        };
        trace!(
            operation = %scope.operation,
            duration_ms,
            memory_mb = sample.memory_mb,
            "profile sample collected"
        );

        let mut metadata = HashMap::new();
        metadata.insert("cpu_percent".to_string(), json!(sample.cpu_percent));
        metadata.insert("thread_count".to_string(), json!(sample.thread_count));
        metadata.insert("read_bytes".to_string(), json!(sample.read_bytes));
        metadata.insert("written_bytes".to_string(), json!(sample.written_bytes));
        metadata.insert(
            "context_switches".to_string(),
            json!(sample.context_switches),
        );
        metadata.insert("gpu_memory_mb".to_string(), json!(sample.gpu_memory_mb));
        if let Some(kind) = &scope.error_kind {
            metadata.insert("error_kind".to_string(), json!(kind));
        }

        self.metrics.record(OperationMetric {
            name: std::mem::take(&mut scope.operation),
            duration_ms,
            memory_mb: sample.memory_mb,
            batch_size: None,
            success: scope.error_kind.is_none(),
            error_kind: scope.error_kind.take(),
            metadata,
            recorded_at: chrono::Utc::now(),
        });
    }
}

#[derive(Debug, Default)]
struct RawCounters {
    cpu_percent: Option<f64>,
    memory_mb: Option<f64>,
    total_read_bytes: Option<u64>,
    total_written_bytes: Option<u64>,
    context_switches: Option<u64>,
    thread_count: Option<u64>,
}

fn delta(start: Option<u64>, end: Option<u64>) -> Option<u64> {
    match (start, end) {
        (Some(s), Some(e)) => Some(e.saturating_sub(s)),
        _ => None,
    }
}

fn average(start: Option<f64>, end: Option<f64>) -> Option<f64> {
    match (start, end) {
        (Some(s), Some(e)) => Some((s + e) / 2.0),
        (None, Some(e)) => Some(e),
        _ => None,
    }
}

#[cfg(target_os = "linux")]
fn read_context_switches() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let mut total: u64 = 0;
    let mut seen = false;
    for line in status.lines() {
        if let Some(rest) = line
            .strip_prefix("voluntary_ctxt_switches:")
            .or_else(|| line.strip_prefix("nonvoluntary_ctxt_switches:"))
        {
            total += rest.trim().parse::<u64>().ok()?;
            seen = true;
        }
    }
    seen.then_some(total)
}

#[cfg(not(target_os = "linux"))]
fn read_context_switches() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn read_thread_count() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|rest| rest.trim().parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn read_thread_count() -> Option<u64> {
    None
}

/// RAII scope produced by [`OperationProfiler::profile`]
pub struct ProfileScope<'a> {
    profiler: &'a OperationProfiler,
    operation: String,
    started: Instant,
    start_counters: RawCounters,
    error_kind: Option<String>,
}

impl std::fmt::Debug for ProfileScope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileScope")
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl ProfileScope<'_> {
    /// Mark the profiled operation as failed; the sample still records
    pub fn fail(&mut self, kind: impl Into<String>) {
        self.error_kind = Some(kind.into());
    }
}

impl Drop for ProfileScope<'_> {
    fn drop(&mut self) {
        self.profiler.finish(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_records_combined_sample() {
        let metrics = Arc::new(MetricsCollector::new());
        let profiler = OperationProfiler::new(Arc::clone(&metrics));
        {
            let _scope = profiler.profile("embed_batch");
            std::hint::black_box(vec![0u8; 1024]);
        }
        let recent = metrics.recent("embed_batch", 1);
        assert_eq!(recent.len(), 1);
        assert!(recent[0].success);
        assert!(recent[0].metadata.contains_key("cpu_percent"));
        assert!(recent[0].metadata.contains_key("context_switches"));
    }

    #[test]
    fn failed_operation_still_records() {
        let metrics = Arc::new(MetricsCollector::new());
        let profiler = OperationProfiler::new(Arc::clone(&metrics));
        {
            let mut scope = profiler.profile("embed_batch");
            scope.fail("processing");
        }
        let recent = metrics.recent("embed_batch", 1);
        assert!(!recent[0].success);
        assert_eq!(recent[0].error_kind.as_deref(), Some("processing"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn linux_counters_are_available() {
        assert!(read_context_switches().is_some());
        assert!(read_thread_count().is_some());
    }
}
