//! Batch engine scenarios against a mock vector store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use uuid::Uuid;

use vectorforge_batch::engine::{BatchEngine, Document};
use vectorforge_batch::search::{SearchHit, SearchPage, SearchQuery};
use vectorforge_batch::store::{ItemOutcome, StoreStats, StoredItem, VectorStore};
use vectorforge_core::config::BatchConfig;
use vectorforge_core::error::{Error, Result};
use vectorforge_core::observe::RecordingSink;
use vectorforge_core::progress::{OperationKind, ProgressTracker};
use vectorforge_core::retry::{RetryPolicy, RetryStrategy};

/// Mock store with switchable failure behavior
#[derive(Default)]
struct MockStore {
    /// Sizes of batch_insert calls, in order
    insert_sizes: Mutex<Vec<usize>>,
    /// Items that arrived with a vector attached
    items_with_vectors: AtomicU32,
    /// Items failing when their content property contains this marker
    fail_marker: Option<String>,
    /// Reject this many whole batches before behaving
    reject_batches: AtomicU32,
    /// Time out this many batch calls before behaving
    timeouts: AtomicU32,
    /// Single-item creates observed
    creates: AtomicU32,
    /// Objects accepted through any path
    objects: Mutex<HashMap<Uuid, Value>>,
}

impl MockStore {
    fn item_outcome(&self, item: &StoredItem) -> ItemOutcome {
        if let Some(marker) = &self.fail_marker {
            let content = item
                .properties
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if content.contains(marker.as_str()) {
                return ItemOutcome::error(item.id, "item rejected by store");
            }
        }
        self.objects
            .lock()
            .insert(item.id, Value::Object(item.properties.clone()));
        ItemOutcome::success(item.id)
    }
}

#[async_trait]
impl VectorStore for MockStore {
    async fn create(&self, _collection: &str, item: StoredItem) -> Result<Uuid> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .insert(item.id, Value::Object(item.properties.clone()));
        Ok(item.id)
    }

    async fn get(&self, _collection: &str, id: Uuid) -> Result<Option<Value>> {
        Ok(self.objects.lock().get(&id).cloned())
    }

    async fn update(&self, _collection: &str, id: Uuid, item: StoredItem) -> Result<bool> {
        Ok(self
            .objects
            .lock()
            .insert(id, Value::Object(item.properties.clone()))
            .is_some())
    }

    async fn delete(&self, _collection: &str, id: Uuid) -> Result<bool> {
        Ok(self.objects.lock().remove(&id).is_some())
    }

    async fn batch_insert(
        &self,
        _collection: &str,
        items: Vec<StoredItem>,
        _batch_size: usize,
        _dynamic: bool,
    ) -> Result<Vec<ItemOutcome>> {
        self.insert_sizes.lock().push(items.len());
        for item in &items {
            if item.vector.is_some() {
                self.items_with_vectors.fetch_add(1, Ordering::SeqCst);
            }
        }
        if self.timeouts.load(Ordering::SeqCst) > 0 {
            self.timeouts.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Timeout {
                elapsed_ms: 30_000,
                deadline_exceeded: false,
            });
        }
        if self.reject_batches.load(Ordering::SeqCst) > 0 {
            self.reject_batches.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Batch("store unavailable".into()));
        }
        Ok(items.iter().map(|item| self.item_outcome(item)).collect())
    }

    async fn batch_delete(
        &self,
        _collection: &str,
        ids: Vec<Uuid>,
        _batch_size: usize,
    ) -> Result<Vec<ItemOutcome>> {
        Ok(ids
            .into_iter()
            .map(|id| {
                if self.objects.lock().remove(&id).is_some() {
                    ItemOutcome::success(id)
                } else {
                    ItemOutcome::error(id, "object not found")
                }
            })
            .collect())
    }

    async fn search(&self, _collection: &str, query: &SearchQuery) -> Result<SearchPage> {
        let items: Vec<SearchHit> = self
            .objects
            .lock()
            .iter()
            .take(query.limit)
            .map(|(id, properties)| SearchHit {
                id: id.to_string(),
                properties: properties.clone(),
                score: Some(0.9),
            })
            .collect();
        let total = self.objects.lock().len() as u64;
        let next_cursor = (items.len() as u64) < total;
        Ok(SearchPage {
            total_matched: total,
            next_cursor: next_cursor.then(|| "cursor-1".to_string()),
            items,
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn stats(&self, _collection: &str) -> Result<StoreStats> {
        Ok(StoreStats {
            count: self.objects.lock().len() as u64,
            per_type: HashMap::new(),
            status: "green".into(),
        })
    }
}

fn config(min: usize, max: usize) -> BatchConfig {
    BatchConfig {
        min_batch_size: min,
        max_batch_size: max,
        window_size: 5,
        timeout_retries: 3,
        creation_time_ms: 30_000,
        max_memory_mb: 1024.0,
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_delay: std::time::Duration::from_millis(1),
        max_delay: std::time::Duration::from_millis(10),
        strategy: RetryStrategy::Linear,
        jitter: 0.0,
        global_timeout: None,
    }
}

fn docs(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::new(format!("document body number {i}")).with_natural_key(format!("/docs/{i}.pdf")))
        .collect()
}

#[tokio::test]
async fn empty_batch_short_circuits() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));
    let result = engine.index_documents(Vec::new()).await;
    assert!(result.success);
    assert_eq!(result.processed, 0);
    assert!(store.insert_sizes.lock().is_empty());
}

#[tokio::test]
async fn successful_index_preserves_input_order() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));
    let input = docs(7);
    let expected: Vec<Uuid> = input
        .iter()
        .map(|d| {
            Uuid::new_v5(
                &Uuid::NAMESPACE_URL,
                d.natural_key.as_ref().unwrap().as_bytes(),
            )
        })
        .collect();

    let result = engine.index_documents(input).await;
    assert!(result.success);
    assert_eq!(result.processed, 7);
    assert_eq!(result.successful_items, expected);
}

#[tokio::test]
async fn deterministic_ids_across_runs() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let first = engine
        .index_documents(vec![Document::new("v1").with_natural_key("/docs/report.pdf")])
        .await;
    let second = engine
        .index_documents(vec![Document::new("v2").with_natural_key("/docs/report.pdf")])
        .await;
    assert_eq!(first.successful_items, second.successful_items);
}

#[tokio::test]
async fn partial_failures_are_structured_not_raised() {
    let store = Arc::new(MockStore {
        fail_marker: Some("broken".into()),
        ..MockStore::default()
    });
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let input = vec![
        Document::new("fine document one").with_natural_key("/a"),
        Document::new("this one is broken").with_natural_key("/b"),
        Document::new("fine document two").with_natural_key("/c"),
    ];
    let result = engine.index_documents(input).await;
    assert!(!result.success);
    assert_eq!(result.processed, 3);
    assert_eq!(result.errors, 1);
    assert_eq!(result.successful_items.len(), 2);
    assert_eq!(result.failed_items.len(), 1);
    assert!(result.failed_items[0].error.contains("rejected"));
}

#[tokio::test]
async fn invalid_supplied_id_is_rejected_without_store_call() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let result = engine
        .index_documents(vec![Document::new("text").with_id("not-a-uuid")])
        .await;
    assert!(!result.success);
    assert_eq!(result.failed_items.len(), 1);
    assert_eq!(result.failed_items[0].id, "not-a-uuid");
    assert!(store.insert_sizes.lock().is_empty());
}

#[tokio::test]
async fn whole_batch_rejection_recovers_through_retry() {
    let store = Arc::new(MockStore::default());
    store.reject_batches.store(1, Ordering::SeqCst);
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_retry_policy(fast_retry());

    let result = engine.index_documents(docs(3)).await;
    // The rejected batch is re-driven item by item
    assert!(result.success, "failures: {:?}", result.failed_items);
    assert_eq!(result.successful_items.len(), 3);
    assert_eq!(store.creates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn store_timeouts_are_retried_within_dispatch() {
    let store = Arc::new(MockStore::default());
    store.timeouts.store(2, Ordering::SeqCst);
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let result = engine.index_documents(docs(4)).await;
    assert!(result.success);
    // Two timed-out attempts plus the successful one
    assert_eq!(store.insert_sizes.lock().len(), 3);
    assert_eq!(store.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sub_batches_respect_max_size() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(5, 5));

    let result = engine.index_documents(docs(17)).await;
    assert!(result.success);
    let sizes = store.insert_sizes.lock().clone();
    assert!(sizes.iter().all(|&s| s <= 5), "sizes: {sizes:?}");
    assert_eq!(sizes.iter().sum::<usize>(), 17);
}

/// Grow the adaptive size by dispatching clean, fast batches of
/// exactly the current optimal size.
async fn warm_up(engine: &BatchEngine, rounds: usize) {
    for _ in 0..rounds {
        let size = engine.optimal_batch_size();
        let result = engine.index_documents(docs(size)).await;
        assert!(result.success);
    }
}

#[tokio::test]
async fn clean_fast_batches_grow_optimal_size() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));
    assert_eq!(engine.optimal_batch_size(), 10);

    // The mock store is instant, so throughput clears the growth
    // threshold; sizes follow 10 → 12 → 14 → 16 → ...
    warm_up(&engine, 4).await;
    assert!(engine.optimal_batch_size() >= 14);
}

#[tokio::test]
async fn oversized_batches_split_on_memory_estimate() {
    let store = Arc::new(MockStore::default());
    let mut cfg = config(10, 500);
    // 0.5 MB per item base cost against a 10 MB budget splits any
    // group of 20 or more items; growth reaches 22 in six rounds
    // (10, 10 → 12 → 14 → 16 → 19 → 22) without triggering a split
    cfg.max_memory_mb = 10.0;
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", cfg);

    warm_up(&engine, 6).await;
    let optimal = engine.optimal_batch_size();
    assert!(optimal >= 20, "optimal {optimal} never outgrew the budget");

    store.insert_sizes.lock().clear();
    let result = engine.index_documents(docs(optimal)).await;
    assert!(result.success);
    let sizes = store.insert_sizes.lock().clone();
    assert!(sizes.len() > 1, "expected memory splits, got {sizes:?}");
    assert!(sizes.iter().all(|&s| s < optimal), "sizes: {sizes:?}");
    assert_eq!(sizes.iter().sum::<usize>(), optimal);
}

#[tokio::test]
async fn repeated_failures_shrink_optimal_size() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));
    warm_up(&engine, 4).await;
    let grown = engine.optimal_batch_size();
    assert!(grown > 10);

    // Now every item fails; the error-rate rule shrinks back down
    let failing = Arc::new(MockStore {
        fail_marker: Some("document".into()),
        ..MockStore::default()
    });
    let engine = BatchEngine::new(Arc::clone(&failing) as Arc<dyn VectorStore>, "docs", config(10, 500));
    warm_up_failures(&engine, 4).await;
    assert_eq!(engine.optimal_batch_size(), 10);
    let summary = engine.performance_summary().unwrap();
    assert!(summary.median_error_rate > 0.99);
}

async fn warm_up_failures(engine: &BatchEngine, rounds: usize) {
    for _ in 0..rounds {
        let size = engine.optimal_batch_size();
        let result = engine.index_documents(docs(size)).await;
        assert!(!result.success);
    }
}

#[tokio::test]
async fn delete_mixes_valid_and_invalid_ids() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let indexed = engine.index_documents(docs(2)).await;
    let mut ids: Vec<String> = indexed
        .successful_items
        .iter()
        .map(Uuid::to_string)
        .collect();
    ids.push("garbage-id".to_string());

    let result = engine.delete_documents(ids).await;
    assert_eq!(result.processed, 3);
    assert_eq!(result.errors, 1);
    assert_eq!(result.successful_items.len(), 2);
    assert_eq!(result.failed_items[0].id, "garbage-id");
}

#[tokio::test]
async fn delete_of_missing_object_is_an_error_outcome() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let result = engine.delete_documents(vec![Uuid::new_v4().to_string()]).await;
    assert!(!result.success);
    assert!(result.failed_items[0].error.contains("not found"));
}

#[tokio::test]
async fn search_returns_cursor_and_duration() {
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));
    engine.index_documents(docs(5)).await;

    let outcome = engine.search(SearchQuery::text("document", 2)).await.unwrap();
    assert_eq!(outcome.items.len(), 2);
    assert_eq!(outcome.total_matched, 5);
    assert_eq!(outcome.next_cursor.as_deref(), Some("cursor-1"));
    assert!(outcome.duration_ms >= 0.0);
}

#[tokio::test]
async fn progress_tracker_observes_mixed_dispatch_outcomes() {
    let progress = Arc::new(ProgressTracker::new(OperationKind::Index, 3));
    let store = Arc::new(MockStore {
        fail_marker: Some("broken".into()),
        ..MockStore::default()
    });
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_progress(Arc::clone(&progress));

    let input = vec![
        Document::new("fine document one").with_natural_key("/a"),
        Document::new("this one is broken").with_natural_key("/b"),
        Document::new("fine document two").with_natural_key("/c"),
    ];
    let result = engine.index_documents(input).await;
    assert_eq!(result.errors, 1);

    let snapshot = progress.snapshot();
    assert_eq!(snapshot.completed, 2);
    assert_eq!(snapshot.failed, 1);
    assert!(progress.is_done());
}

#[tokio::test]
async fn progress_counts_each_rejected_item_once_after_retry() {
    let progress = Arc::new(ProgressTracker::new(OperationKind::Index, 3));
    let store = Arc::new(MockStore::default());
    store.reject_batches.store(1, Ordering::SeqCst);
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_retry_policy(fast_retry())
        .with_progress(Arc::clone(&progress));

    let result = engine.index_documents(docs(3)).await;
    assert!(result.success, "failures: {:?}", result.failed_items);

    // Rejected items report through the retry pass, not the rejection
    let snapshot = progress.snapshot();
    assert_eq!(snapshot.completed, 3);
    assert_eq!(snapshot.failed, 0);
    assert!(progress.is_done());
}

#[tokio::test]
async fn progress_tracker_observes_deletes() {
    let progress = Arc::new(ProgressTracker::new(OperationKind::Delete, 2));
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500));

    let indexed = engine.index_documents(docs(2)).await;
    let ids: Vec<String> = indexed
        .successful_items
        .iter()
        .map(Uuid::to_string)
        .collect();

    let deleter = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_progress(Arc::clone(&progress));
    let result = deleter.delete_documents(ids).await;
    assert!(result.success);
    assert_eq!(progress.snapshot().completed, 2);
    assert!(progress.is_done());
}

struct StubEmbedding {
    invocations: AtomicU32,
}

#[async_trait]
impl vectorforge_ml::models::EmbeddingModel for StubEmbedding {
    async fn encode(&self, _text: &str) -> Result<Vec<f32>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.1, 0.2, 0.3])
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
    }

    fn dimension(&self) -> usize {
        3
    }
}

#[tokio::test]
async fn index_attaches_vectors_with_one_embedder_call_per_batch() {
    use std::collections::HashSet;
    use vectorforge_ml::parameters::EmbeddingParameters;
    use vectorforge_ml::processor::EmbeddingProcessor;

    let model = Arc::new(StubEmbedding {
        invocations: AtomicU32::new(0),
    });
    let embedder = EmbeddingProcessor::new(
        Arc::clone(&model) as Arc<dyn vectorforge_ml::models::EmbeddingModel>,
        EmbeddingParameters {
            model_name: "stub".into(),
            batch_size: 32,
            device: vectorforge_core::resources::Device::Cpu,
            min_text_length: 1,
            max_text_length: 100_000,
            min_words: 1,
            required_metadata_fields: HashSet::new(),
            optional_metadata_fields: HashSet::new(),
            max_memory_mb: 1024.0,
            normalize: true,
        },
    );

    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_embedder(embedder);

    let result = engine.index_documents(docs(6)).await;
    assert!(result.success);
    // Six items in one sub-batch: one model invocation, all vectors attached
    assert_eq!(model.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(store.items_with_vectors.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn structured_metrics_flow_to_sink() {
    let sink = Arc::new(RecordingSink::new());
    let store = Arc::new(MockStore::default());
    let engine = BatchEngine::new(Arc::clone(&store) as Arc<dyn VectorStore>, "docs", config(10, 500))
        .with_sink(Arc::clone(&sink) as Arc<dyn vectorforge_core::observe::MetricsSink>);

    engine.index_documents(docs(3)).await;
    assert_eq!(sink.named("batch_objects_total").len(), 1);
    assert_eq!(sink.named("batch_objects_success")[0].value, 3.0);
    assert_eq!(sink.named("batch_success_rate")[0].value, 1.0);
}
