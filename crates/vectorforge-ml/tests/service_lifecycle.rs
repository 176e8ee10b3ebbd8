//! Service lifecycle and batch processing behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use vectorforge_core::chunk::{Annotations, Chunk, ChunkOutput};
use vectorforge_core::config::MlConfig;
use vectorforge_core::error::{Error, Result};
use vectorforge_core::metrics::MetricsCollector;
use vectorforge_core::service_state::ServiceState;
use vectorforge_ml::models::{EmbeddingModel, ModelLoader, TextModel};
use vectorforge_ml::parameters::{EmbeddingParameters, ServiceFlavor, TextParameters};
use vectorforge_ml::service::MlService;

struct StubText;

#[async_trait]
impl TextModel for StubText {
    async fn annotate(&self, text: &str) -> Result<Annotations> {
        if text.contains("poison") {
            return Err(Error::Batch("model choked".into()));
        }
        let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
        Ok(Annotations {
            lemmas: tokens.clone(),
            pos_tags: tokens.iter().map(|_| "NOUN".to_string()).collect(),
            entities: Vec::new(),
            tokens,
        })
    }
}

struct StubEmbedding;

#[async_trait]
impl EmbeddingModel for StubEmbedding {
    async fn encode(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }

    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
    }

    fn dimension(&self) -> usize {
        3
    }
}

struct StubLoader {
    fail_next: AtomicBool,
    loads: AtomicU32,
}

impl StubLoader {
    fn new() -> Self {
        Self {
            fail_next: AtomicBool::new(false),
            loads: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ModelLoader for StubLoader {
    async fn load_text(&self, _params: &TextParameters) -> Result<Arc<dyn TextModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Configuration("model file missing".into()));
        }
        Ok(Arc::new(StubText))
    }

    async fn load_embedding(
        &self,
        _params: &EmbeddingParameters,
    ) -> Result<Arc<dyn EmbeddingModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Configuration("model file missing".into()));
        }
        Ok(Arc::new(StubEmbedding))
    }
}

fn config() -> MlConfig {
    MlConfig {
        min_text_length: 1,
        min_words: 1,
        ..MlConfig::default()
    }
}

fn service(flavor: ServiceFlavor) -> (MlService, Arc<StubLoader>) {
    let loader = Arc::new(StubLoader::new());
    let service = MlService::new(
        config(),
        flavor,
        Arc::clone(&loader) as Arc<dyn ModelLoader>,
        Arc::new(MetricsCollector::new()),
    );
    (service, loader)
}

#[tokio::test]
async fn lifecycle_round_trip_restores_running_with_equal_parameters() {
    let (service, _) = service(ServiceFlavor::Embedding);
    assert_eq!(service.state().await, ServiceState::Uninitialized);

    service.initialize().await.unwrap();
    assert_eq!(service.state().await, ServiceState::Running);
    let first = service.parameters().await.unwrap();

    service.cleanup().await;
    assert_eq!(service.state().await, ServiceState::Stopped);
    assert!(!service.health_check().await);

    service.initialize().await.unwrap();
    assert_eq!(service.state().await, ServiceState::Running);
    assert_eq!(service.parameters().await.unwrap(), first);
    assert!(service.health_check().await);
}

#[tokio::test]
async fn double_initialize_is_a_noop_from_running() {
    let (service, loader) = service(ServiceFlavor::Text);
    service.initialize().await.unwrap();
    service.initialize().await.unwrap();
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(service.state().await, ServiceState::Running);
}

#[tokio::test]
async fn failed_initialize_moves_to_error_and_rejects_reinit() {
    let (service, loader) = service(ServiceFlavor::Text);
    loader.fail_next.store(true, Ordering::SeqCst);

    let err = service.initialize().await.unwrap_err();
    assert!(matches!(err, Error::ServiceInitialization { .. }));
    assert!(matches!(service.state().await, ServiceState::Error(_)));

    // Initialize from Error is rejected until cleanup
    let err = service.initialize().await.unwrap_err();
    assert!(matches!(err, Error::ServiceState { .. }));

    service.cleanup().await;
    service.initialize().await.unwrap();
    assert_eq!(service.state().await, ServiceState::Running);
}

#[tokio::test]
async fn cleanup_from_uninitialized_is_a_noop() {
    let (service, _) = service(ServiceFlavor::Text);
    service.cleanup().await;
    assert_eq!(service.state().await, ServiceState::Uninitialized);
}

#[tokio::test]
async fn process_requires_running() {
    let (service, _) = service(ServiceFlavor::Text);
    let chunk = Chunk::new("c1", "hello world");
    let err = service.process_chunk(&chunk, None).await.unwrap_err();
    assert!(matches!(err, Error::ServiceState { .. }));
}

#[tokio::test]
async fn process_chunk_validates_then_processes() {
    let (service, _) = service(ServiceFlavor::Text);
    service.initialize().await.unwrap();

    let out = service
        .process_chunk(&Chunk::new("c1", "hello world"), None)
        .await
        .unwrap();
    match out {
        ChunkOutput::Annotations { annotations, .. } => {
            assert_eq!(annotations.tokens, vec!["hello", "world"]);
        }
        ChunkOutput::Embedding { .. } => panic!("expected annotations"),
    }

    let err = service
        .process_chunk(&Chunk::new("c2", ""), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn processing_failure_wraps_chunk_id() {
    let (service, _) = service(ServiceFlavor::Text);
    service.initialize().await.unwrap();

    let err = service
        .process_chunk(&Chunk::new("c9", "poison pill"), None)
        .await
        .unwrap_err();
    match err {
        Error::Processing { chunk_id, .. } => assert_eq!(chunk_id, "c9"),
        other => panic!("expected Processing, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_validation_short_circuits_with_offender() {
    let (service, _) = service(ServiceFlavor::Embedding);
    service.initialize().await.unwrap();

    let chunks = vec![Chunk::new("good", "fine text"), Chunk::new("bad", "")];
    let err = service.process_chunks(&chunks, None).await.unwrap_err();
    match err {
        Error::Validation(report) => {
            assert!(report.messages().iter().any(|m| m.contains("chunk bad")));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_processing_failure_carries_index() {
    let (service, _) = service(ServiceFlavor::Text);
    service.initialize().await.unwrap();

    let chunks = vec![
        Chunk::new("c1", "fine text"),
        Chunk::new("c2", "poison pill"),
    ];
    let err = service.process_chunks(&chunks, None).await.unwrap_err();
    match err {
        Error::Processing {
            chunk_id,
            batch_index,
            ..
        } => {
            assert_eq!(chunk_id, "c2");
            assert_eq!(batch_index, Some(1));
        }
        other => panic!("expected Processing, got {other:?}"),
    }
}

#[tokio::test]
async fn embedding_batch_returns_input_order() {
    let (service, _) = service(ServiceFlavor::Embedding);
    service.initialize().await.unwrap();

    let chunks = vec![
        Chunk::new("c1", "first text"),
        Chunk::new("c2", "second text"),
    ];
    let outputs = service.process_chunks(&chunks, None).await.unwrap();
    let ids: Vec<&str> = outputs.iter().map(ChunkOutput::chunk_id).collect();
    assert_eq!(ids, vec!["c1", "c2"]);
}

#[tokio::test]
async fn empty_batch_is_ok() {
    let (service, _) = service(ServiceFlavor::Embedding);
    service.initialize().await.unwrap();
    assert!(service.process_chunks(&[], None).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_initialize_observes_one_winner() {
    let (service, loader) = service(ServiceFlavor::Text);
    let service = Arc::new(service);
    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move { service.initialize().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    assert_eq!(service.state().await, ServiceState::Running);
}
