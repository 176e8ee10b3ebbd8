//! Capability seams for external metrics and tracing backends.
//!
//! The core records through these traits; exporters live outside. Both
//! traits must tolerate concurrent recording. Naming is the caller's
//! responsibility.

use parking_lot::Mutex;
use serde_json::Value;

/// Destination for counters, histograms, and gauges
pub trait MetricsSink: Send + Sync {
    /// Add `value` to the named counter
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);

    /// Record one observation into the named histogram
    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Set the named gauge
    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn counter(&self, _name: &str, _value: u64, _labels: &[(&str, &str)]) {}
    fn histogram(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
    fn gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// One captured sink event, for assertions in tests
#[derive(Debug, Clone, PartialEq)]
pub struct SinkEvent {
    /// Instrument kind: `counter`, `histogram`, or `gauge`
    pub instrument: &'static str,
    /// Metric name
    pub name: String,
    /// Recorded value
    pub value: f64,
    /// Label pairs
    pub labels: Vec<(String, String)>,
}

/// Sink that captures every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    /// Create an empty recording sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies of all captured events
    #[must_use]
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Captured events with the given metric name
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<SinkEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }

    fn push(&self, instrument: &'static str, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.events.lock().push(SinkEvent {
            instrument,
            name: name.to_string(),
            value,
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
    }
}

impl MetricsSink for RecordingSink {
    fn counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        self.push("counter", name, value as f64, labels);
    }

    fn histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.push("histogram", name, value, labels);
    }

    fn gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.push("gauge", name, value, labels);
    }
}

/// A span handle created by a [`Tracer`]
pub trait Span: Send {
    /// Attach an attribute to the span
    fn set_attribute(&mut self, key: &str, value: Value);

    /// Record an error against the span
    fn record_error(&mut self, error: &(dyn std::error::Error + 'static));

    /// Set the span's final status
    fn set_status(&mut self, ok: bool);
}

/// Creates spans with attributes
pub trait Tracer: Send + Sync {
    /// Start a span with the given name
    fn start_span(&self, name: &str) -> Box<dyn Span>;
}

/// Tracer that produces inert spans
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

/// Span that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSpan;

impl Span for NoopSpan {
    fn set_attribute(&mut self, _key: &str, _value: Value) {}
    fn record_error(&mut self, _error: &(dyn std::error::Error + 'static)) {}
    fn set_status(&mut self, _ok: bool) {}
}

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_captures_in_order() {
        let sink = RecordingSink::new();
        sink.counter("batch_errors", 1, &[("op", "index")]);
        sink.gauge("optimal_batch_size", 60.0, &[]);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].instrument, "counter");
        assert_eq!(events[0].labels, vec![("op".to_string(), "index".to_string())]);
        assert_eq!(sink.named("optimal_batch_size").len(), 1);
    }

    #[test]
    fn noop_span_is_inert() {
        let tracer = NoopTracer;
        let mut span = tracer.start_span("flush");
        span.set_attribute("batch_size", serde_json::json!(32));
        span.set_status(true);
    }
}
