//! Dynamic batch engine: assembly, adaptive sizing, and dispatch.
//!
//! The engine receives documents or ids, assembles sub-batches from
//! the tracker's current optimal size, splits them further when the
//! memory estimate exceeds the budget, and dispatches against the
//! vector store. Whole-batch rejections are re-driven item by item
//! through the retry orchestrator. Results preserve input order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use vectorforge_core::chunk::{Chunk, ChunkOutput};
use vectorforge_core::config::BatchConfig;
use vectorforge_core::error::{Error, Result};
use vectorforge_core::metrics::MetricsCollector;
use vectorforge_core::observe::{MetricsSink, NoopSink};
use vectorforge_core::progress::ProgressTracker;
use vectorforge_core::retry::{RetryOrchestrator, RetryPolicy};
use vectorforge_ml::processor::EmbeddingProcessor;

use crate::performance::{BatchPerformanceTracker, BatchSample, TrackerSummary};
use crate::search::{SearchOutcome, SearchQuery};
use crate::store::{ItemOutcome, StoreStats, StoredItem, VectorStore};

/// A document offered to an index or update dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Caller-supplied natural key (e.g. a file path) for deterministic ids
    pub natural_key: Option<String>,
    /// Explicit id; must parse as a UUID or the item is rejected
    pub supplied_id: Option<String>,
    /// Text content, embedded when no vector is attached
    pub content: String,
    /// Additional properties stored alongside the content
    pub properties: Map<String, Value>,
    /// Pre-computed vector, when the caller already has one
    pub vector: Option<Vec<f32>>,
}

impl Document {
    /// A document with content only
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            natural_key: None,
            supplied_id: None,
            content: content.into(),
            properties: Map::new(),
            vector: None,
        }
    }

    /// Derive the id deterministically from a natural key
    #[must_use]
    pub fn with_natural_key(mut self, key: impl Into<String>) -> Self {
        self.natural_key = Some(key.into());
        self
    }

    /// Use an explicit id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.supplied_id = Some(id.into());
        self
    }

    /// Attach a stored property
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// One failed item in a batch result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    /// Item id as supplied or resolved
    pub id: String,
    /// Failure message
    pub error: String,
}

/// Structured result of a batch dispatch; never raised on partial failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// True when no item failed
    pub success: bool,
    /// Items that ran to completion
    pub processed: usize,
    /// Items that failed
    pub errors: usize,
    /// Ids of successful items, in input order
    pub successful_items: Vec<Uuid>,
    /// Failed items, in input order
    pub failed_items: Vec<FailedItem>,
}

impl BatchResult {
    /// Result of an empty dispatch
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            success: true,
            processed: 0,
            errors: 0,
            successful_items: Vec::new(),
            failed_items: Vec::new(),
        }
    }
}

enum Slot {
    Pending,
    Success(Uuid),
    Failed(String, String),
}

/// Namespace for deterministic ids derived from natural keys
const ID_NAMESPACE: Uuid = Uuid::NAMESPACE_URL;

/// Resolve the id for a document
///
/// A supplied id must be a valid UUID; a natural key yields the same
/// UUID v5 across runs and processes; otherwise a fresh v4 is used.
fn resolve_id(doc: &Document) -> std::result::Result<Uuid, String> {
    if let Some(supplied) = &doc.supplied_id {
        return Uuid::parse_str(supplied).map_err(|e| format!("invalid id {supplied:?}: {e}"));
    }
    if let Some(key) = &doc.natural_key {
        return Ok(Uuid::new_v5(&ID_NAMESPACE, key.as_bytes()));
    }
    Ok(Uuid::new_v4())
}

/// Estimated memory in MB for a batch of `count` items totalling
/// `total_text_len` characters
fn estimate_memory_mb(total_text_len: usize, count: usize) -> f64 {
    (2 * total_text_len) as f64 / 1_048_576.0 + 0.5 * count as f64
}

/// Drives batched writes, deletes, and searches against a vector store
pub struct BatchEngine {
    store: Arc<dyn VectorStore>,
    collection: String,
    config: BatchConfig,
    embedder: Option<EmbeddingProcessor>,
    retry_policy: RetryPolicy,
    tracker: Mutex<BatchPerformanceTracker>,
    metrics: Arc<MetricsCollector>,
    sink: Arc<dyn MetricsSink>,
    progress: Option<Arc<ProgressTracker>>,
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("collection", &self.collection)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchEngine {
    /// Create an engine bound to one collection
    #[must_use]
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>, config: BatchConfig) -> Self {
        let tracker = BatchPerformanceTracker::new(
            config.min_batch_size,
            config.max_batch_size,
            config.window_size,
        );
        Self {
            store,
            collection: collection.into(),
            config,
            embedder: None,
            retry_policy: RetryPolicy::default(),
            tracker: Mutex::new(tracker),
            metrics: Arc::new(MetricsCollector::new()),
            sink: Arc::new(NoopSink),
            progress: None,
        }
    }

    /// Attach an embedding processor for INDEX/UPDATE vector generation
    #[must_use]
    pub fn with_embedder(mut self, embedder: EmbeddingProcessor) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Override the retry policy used for rejected batches
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Report operation samples into a shared collector
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Emit structured per-batch metrics into a sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Report per-item completions to a progress tracker
    ///
    /// Every dispatched item is reported exactly once: directly when
    /// its sub-batch resolves, or by the retry orchestrator when a
    /// rejected batch is re-driven.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    fn report_progress(&self, succeeded: usize, failed: usize) {
        if let Some(progress) = &self.progress {
            progress.complete_batch(succeeded, failed);
        }
    }

    /// Size the next sub-batch should use
    #[must_use]
    pub fn optimal_batch_size(&self) -> usize {
        self.tracker
            .lock()
            .optimal_batch_size()
            .clamp(self.config.min_batch_size, self.config.max_batch_size)
    }

    /// Performance summary of the adaptive window
    #[must_use]
    pub fn performance_summary(&self) -> Option<TrackerSummary> {
        self.tracker.lock().summary()
    }

    /// Index documents, generating ids and vectors as needed
    pub async fn index_documents(&self, docs: Vec<Document>) -> BatchResult {
        self.write_documents(docs, "index").await
    }

    /// Update documents; writes go through the same upsert path as index
    pub async fn update_documents(&self, docs: Vec<Document>) -> BatchResult {
        self.write_documents(docs, "update").await
    }

    async fn write_documents(&self, docs: Vec<Document>, op: &'static str) -> BatchResult {
        if docs.is_empty() {
            return BatchResult::empty();
        }
        let mut scope = self
            .metrics
            .track_operation(format!("batch_{op}"), Some(docs.len()), None);

        let mut slots: Vec<Slot> = Vec::with_capacity(docs.len());
        let mut pending: Vec<(usize, Uuid, Document)> = Vec::new();
        for (index, doc) in docs.into_iter().enumerate() {
            match resolve_id(&doc) {
                Ok(id) => {
                    slots.push(Slot::Pending);
                    pending.push((index, id, doc));
                }
                Err(message) => {
                    let shown = doc.supplied_id.clone().unwrap_or_default();
                    slots.push(Slot::Failed(shown, message));
                }
            }
        }

        let mut rejected: Vec<(usize, StoredItem)> = Vec::new();
        let mut cursor = 0;
        while cursor < pending.len() {
            let take = self.optimal_batch_size().min(pending.len() - cursor);
            let group = &pending[cursor..cursor + take];
            for (start, end) in self.split_by_memory(group) {
                let piece = &group[start..end];
                self.dispatch_write_piece(piece, op, &mut slots, &mut rejected)
                    .await;
            }
            cursor += take;
        }

        if !rejected.is_empty() {
            self.retry_rejected_writes(rejected, &mut slots).await;
        }

        let result = Self::collect(slots);
        if !result.success {
            scope.fail("batch");
        }
        result
    }

    /// Memory-aware split of a group into contiguous ranges
    ///
    /// Halves recursively until the estimate fits the budget, never
    /// splitting below the configured minimum batch size.
    fn split_by_memory(&self, group: &[(usize, Uuid, Document)]) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut stack = vec![(0usize, group.len())];
        while let Some((start, end)) = stack.pop() {
            let count = end - start;
            if count == 0 {
                continue;
            }
            let total_len: usize = group[start..end].iter().map(|(_, _, d)| d.content.len()).sum();
            let estimate = estimate_memory_mb(total_len, count);
            if estimate <= self.config.max_memory_mb
                || count <= self.config.min_batch_size
                || count < 2
            {
                ranges.push((start, end));
            } else {
                let mid = start + count / 2;
                // Push in reverse so ranges come out in input order
                stack.push((mid, end));
                stack.push((start, mid));
            }
        }
        ranges.sort_unstable();
        ranges
    }

    async fn dispatch_write_piece(
        &self,
        piece: &[(usize, Uuid, Document)],
        op: &'static str,
        slots: &mut [Slot],
        rejected: &mut Vec<(usize, StoredItem)>,
    ) {
        let started = Instant::now();
        let batch_size = piece.len();

        let items = match self.build_items(piece).await {
            Ok(items) => items,
            Err(e) => {
                // Embedding failed for the whole piece
                warn!(op, batch_size, error = %e, "vector generation failed for batch");
                self.sink
                    .counter("batch_errors", 1, &[("op", op), ("kind", e.kind())]);
                for (index, id, _) in piece {
                    slots[*index] = Slot::Failed(id.to_string(), e.to_string());
                }
                self.report_progress(0, batch_size);
                self.record_batch(op, batch_size, started, 0, batch_size);
                return;
            }
        };

        match self.store_write_with_retries(items.clone(), batch_size).await {
            Ok(outcomes) => {
                let mut successful = 0;
                let mut failed = 0;
                for ((index, id, _), outcome) in piece.iter().zip(outcomes) {
                    match outcome.status {
                        crate::store::ItemStatus::Success => {
                            successful += 1;
                            slots[*index] = Slot::Success(*id);
                        }
                        crate::store::ItemStatus::Error(message) => {
                            failed += 1;
                            slots[*index] = Slot::Failed(id.to_string(), message);
                        }
                    }
                }
                self.report_progress(successful, failed);
                self.record_batch(op, batch_size, started, successful, failed);
            }
            Err(e) => {
                // Whole batch rejected: fail everything now and hand the
                // items to the retry orchestrator, which reports their
                // progress once they resolve.
                warn!(op, batch_size, error = %e, "store rejected batch");
                self.sink
                    .counter("batch_errors", 1, &[("op", op), ("kind", e.kind())]);
                for ((index, id, _), item) in piece.iter().zip(items) {
                    slots[*index] = Slot::Failed(id.to_string(), e.to_string());
                    rejected.push((*index, item));
                }
                self.record_batch(op, batch_size, started, 0, batch_size);
            }
        }
    }

    /// Build store items, generating vectors with one embedder call
    async fn build_items(&self, piece: &[(usize, Uuid, Document)]) -> Result<Vec<StoredItem>> {
        let mut vectors: Vec<Option<Vec<f32>>> =
            piece.iter().map(|(_, _, d)| d.vector.clone()).collect();

        if let Some(embedder) = &self.embedder {
            let missing: Vec<usize> = vectors
                .iter()
                .enumerate()
                .filter_map(|(i, v)| v.is_none().then_some(i))
                .collect();
            if !missing.is_empty() {
                let chunks: Vec<Chunk> = missing
                    .iter()
                    .map(|&i| Chunk::new(piece[i].1.to_string(), piece[i].2.content.clone()))
                    .collect();
                let outputs = embedder.process_batch(&chunks).await?;
                for (&i, output) in missing.iter().zip(outputs) {
                    if let ChunkOutput::Embedding { vector, .. } = output {
                        vectors[i] = Some(vector);
                    }
                }
            }
        }

        Ok(piece
            .iter()
            .zip(vectors)
            .map(|((_, id, doc), vector)| {
                let mut properties = doc.properties.clone();
                properties.insert("content".to_string(), Value::String(doc.content.clone()));
                if let Some(key) = &doc.natural_key {
                    properties.insert("file_path".to_string(), Value::String(key.clone()));
                }
                StoredItem {
                    id: *id,
                    properties,
                    vector,
                }
            })
            .collect())
    }

    /// Store write bounded by the creation budget, with retries for
    /// transient timeouts
    async fn store_write_with_retries(
        &self,
        items: Vec<StoredItem>,
        batch_size: usize,
    ) -> Result<Vec<ItemOutcome>> {
        let budget = std::time::Duration::from_millis(self.config.creation_time_ms);
        let mut attempt = 0;
        loop {
            let call = self
                .store
                .batch_insert(&self.collection, items.clone(), batch_size, true);
            let result = match tokio::time::timeout(budget, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    elapsed_ms: self.config.creation_time_ms,
                    deadline_exceeded: false,
                }),
            };
            match result {
                Ok(outcomes) => return Ok(outcomes),
                Err(Error::Timeout {
                    deadline_exceeded: false,
                    elapsed_ms,
                }) if attempt < self.config.timeout_retries => {
                    attempt += 1;
                    debug!(attempt, elapsed_ms, "store timeout, retrying batch");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Re-drive whole-batch rejections item by item
    async fn retry_rejected_writes(
        &self,
        rejected: Vec<(usize, StoredItem)>,
        slots: &mut [Slot],
    ) {
        let mut orchestrator = RetryOrchestrator::new(self.retry_policy.clone())
            .with_retry_predicate(Box::new(Error::is_retryable));
        if let Some(progress) = &self.progress {
            orchestrator = orchestrator.with_progress(Arc::clone(progress));
        }
        let store = Arc::clone(&self.store);
        let collection = self.collection.clone();
        let outcome = orchestrator
            .process(rejected, move |(index, item)| {
                let store = Arc::clone(&store);
                let collection = collection.clone();
                async move {
                    let id = store.create(&collection, item).await?;
                    Ok((index, id))
                }
            })
            .await;

        for (index, id) in outcome.results {
            slots[index] = Slot::Success(id);
        }
        for failure in outcome.failures {
            let (index, item) = failure.payload;
            slots[index] = Slot::Failed(item.id.to_string(), failure.error.to_string());
        }
    }

    /// Delete documents by id
    ///
    /// Ids that do not parse as UUIDs are rejected as failed items
    /// without touching the store.
    pub async fn delete_documents(&self, ids: Vec<String>) -> BatchResult {
        if ids.is_empty() {
            return BatchResult::empty();
        }
        let mut scope = self
            .metrics
            .track_operation("batch_delete", Some(ids.len()), None);

        let mut slots: Vec<Slot> = Vec::with_capacity(ids.len());
        let mut pending: Vec<(usize, Uuid)> = Vec::new();
        for (index, raw) in ids.into_iter().enumerate() {
            match Uuid::parse_str(&raw) {
                Ok(id) => {
                    slots.push(Slot::Pending);
                    pending.push((index, id));
                }
                Err(e) => {
                    slots.push(Slot::Failed(raw.clone(), format!("invalid id {raw:?}: {e}")));
                }
            }
        }

        let mut rejected: Vec<(usize, Uuid)> = Vec::new();
        let mut cursor = 0;
        while cursor < pending.len() {
            let take = self.optimal_batch_size().min(pending.len() - cursor);
            let piece = &pending[cursor..cursor + take];
            self.dispatch_delete_piece(piece, &mut slots, &mut rejected).await;
            cursor += take;
        }

        if !rejected.is_empty() {
            let mut orchestrator = RetryOrchestrator::new(self.retry_policy.clone())
                .with_retry_predicate(Box::new(Error::is_retryable));
            if let Some(progress) = &self.progress {
                orchestrator = orchestrator.with_progress(Arc::clone(progress));
            }
            let store = Arc::clone(&self.store);
            let collection = self.collection.clone();
            let outcome = orchestrator
                .process(rejected, move |(index, id)| {
                    let store = Arc::clone(&store);
                    let collection = collection.clone();
                    async move {
                        if store.delete(&collection, id).await? {
                            Ok((index, id))
                        } else {
                            Err(Error::Batch(format!("object {id} not found")))
                        }
                    }
                })
                .await;
            for (index, id) in outcome.results {
                slots[index] = Slot::Success(id);
            }
            for failure in outcome.failures {
                let (index, id) = failure.payload;
                slots[index] = Slot::Failed(id.to_string(), failure.error.to_string());
            }
        }

        let result = Self::collect(slots);
        if !result.success {
            scope.fail("batch");
        }
        result
    }

    async fn dispatch_delete_piece(
        &self,
        piece: &[(usize, Uuid)],
        slots: &mut [Slot],
        rejected: &mut Vec<(usize, Uuid)>,
    ) {
        let started = Instant::now();
        let batch_size = piece.len();
        let ids: Vec<Uuid> = piece.iter().map(|(_, id)| *id).collect();

        let budget = std::time::Duration::from_millis(self.config.creation_time_ms);
        let mut attempt = 0;
        let outcome = loop {
            let call = self
                .store
                .batch_delete(&self.collection, ids.clone(), batch_size);
            let result = match tokio::time::timeout(budget, call).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    elapsed_ms: self.config.creation_time_ms,
                    deadline_exceeded: false,
                }),
            };
            match result {
                Ok(outcomes) => break Ok(outcomes),
                Err(Error::Timeout {
                    deadline_exceeded: false,
                    ..
                }) if attempt < self.config.timeout_retries => attempt += 1,
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(outcomes) => {
                let mut successful = 0;
                let mut failed = 0;
                for ((index, id), outcome) in piece.iter().zip(outcomes) {
                    match outcome.status {
                        crate::store::ItemStatus::Success => {
                            successful += 1;
                            slots[*index] = Slot::Success(*id);
                        }
                        crate::store::ItemStatus::Error(message) => {
                            failed += 1;
                            slots[*index] = Slot::Failed(id.to_string(), message);
                        }
                    }
                }
                self.report_progress(successful, failed);
                self.record_batch("delete", batch_size, started, successful, failed);
            }
            Err(e) => {
                warn!(batch_size, error = %e, "store rejected delete batch");
                self.sink
                    .counter("batch_errors", 1, &[("op", "delete"), ("kind", e.kind())]);
                for (index, id) in piece {
                    slots[*index] = Slot::Failed(id.to_string(), e.to_string());
                    rejected.push((*index, *id));
                }
                self.record_batch("delete", batch_size, started, 0, batch_size);
            }
        }
    }

    /// Cursor-paginated search against the bound collection
    pub async fn search(&self, query: SearchQuery) -> Result<SearchOutcome> {
        let started = Instant::now();
        let mut scope = self.metrics.track_operation("search", None, None);
        match self.store.search(&self.collection, &query).await {
            Ok(page) => {
                let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.sink.histogram("search_duration_ms", duration_ms, &[]);
                Ok(SearchOutcome {
                    items: page.items,
                    total_matched: page.total_matched,
                    duration_ms,
                    next_cursor: page.next_cursor,
                })
            }
            Err(e) => {
                scope.fail(e.kind());
                Err(e)
            }
        }
    }

    /// Collection statistics from the store
    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats(&self.collection).await
    }

    /// Record a completed sub-batch: tracker sample plus sink metrics
    fn record_batch(
        &self,
        op: &'static str,
        batch_size: usize,
        started: Instant,
        successful: usize,
        failed: usize,
    ) {
        let duration_secs = started.elapsed().as_secs_f64();
        let sample = BatchSample::from_counts(batch_size, duration_secs, successful, failed, None);
        let throughput = sample.objects_per_sec;
        let optimal = {
            let mut tracker = self.tracker.lock();
            tracker.record_sample(sample);
            tracker.optimal_batch_size()
        };

        let total = successful + failed;
        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            1.0
        };
        self.sink
            .counter("batch_objects_total", total as u64, &[("op", op)]);
        self.sink
            .counter("batch_objects_success", successful as u64, &[("op", op)]);
        self.sink
            .counter("batch_objects_error", failed as u64, &[("op", op)]);
        self.sink
            .gauge("batch_success_rate", success_rate, &[("op", op)]);
        self.sink
            .gauge("batch_throughput", throughput, &[("op", op)]);
        self.sink
            .gauge("optimal_batch_size", optimal as f64, &[("op", op)]);
    }

    fn collect(slots: Vec<Slot>) -> BatchResult {
        let mut successful_items = Vec::new();
        let mut failed_items = Vec::new();
        let mut never_attempted = 0;
        for slot in slots {
            match slot {
                Slot::Success(id) => successful_items.push(id),
                Slot::Failed(id, error) => failed_items.push(FailedItem { id, error }),
                // Items the dispatch never reached count as errors but
                // not as processed.
                Slot::Pending => never_attempted += 1,
            }
        }
        let processed = successful_items.len() + failed_items.len();
        let errors = failed_items.len() + never_attempted;
        BatchResult {
            success: errors == 0,
            processed,
            errors,
            successful_items,
            failed_items,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_id_from_natural_key() {
        let a = Document::new("text").with_natural_key("/docs/report.pdf");
        let b = Document::new("other text").with_natural_key("/docs/report.pdf");
        assert_eq!(resolve_id(&a).unwrap(), resolve_id(&b).unwrap());
        // Stable across processes: pin the derived value
        assert_eq!(
            resolve_id(&a).unwrap(),
            Uuid::new_v5(&Uuid::NAMESPACE_URL, b"/docs/report.pdf")
        );
    }

    #[test]
    fn missing_natural_key_yields_random_id() {
        let doc = Document::new("text");
        assert_ne!(resolve_id(&doc).unwrap(), resolve_id(&doc).unwrap());
    }

    #[test]
    fn invalid_supplied_id_is_rejected() {
        let doc = Document::new("text").with_id("not-a-uuid");
        assert!(resolve_id(&doc).is_err());

        let ok = Document::new("text").with_id("6ba7b810-9dad-11d1-80b4-00c04fd430c8");
        assert!(resolve_id(&ok).is_ok());
    }

    #[test]
    fn memory_estimate_formula() {
        // 2 * L * N / 2^20 + 0.5 * N with N=2, total length 1 MiB
        let mb = estimate_memory_mb(1_048_576 / 2 * 2, 2);
        assert!((mb - 3.0).abs() < 1e-9);
    }
}
