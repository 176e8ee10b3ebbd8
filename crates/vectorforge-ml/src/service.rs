//! ML service lifecycle and chunk processing.
//!
//! The service owns the loaded model, the processor strategy, and the
//! validator composed from parameter bounds. State transitions are
//! single-writer: concurrent initialize/cleanup callers observe one
//! winner and a no-op in the appropriate state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use vectorforge_core::chunk::{Chunk, ChunkOutput};
use vectorforge_core::config::MlConfig;
use vectorforge_core::error::{Error, Result};
use vectorforge_core::metrics::MetricsCollector;
use vectorforge_core::service_state::ServiceState;
use vectorforge_core::validation::{BatchParams, BatchValidator, ChunkValidator, ensure_valid};

use crate::models::ModelLoader;
use crate::parameters::{ModelParameters, ServiceFlavor};
use crate::processor::{EmbeddingProcessor, Processor, TextProcessor};

struct ServiceInner {
    parameters: ModelParameters,
    processor: Processor,
    validator: ChunkValidator,
    batch_validator: BatchValidator,
}

/// Stateful wrapper around a text-processing or embedding model
pub struct MlService {
    config: MlConfig,
    flavor: ServiceFlavor,
    loader: Arc<dyn ModelLoader>,
    metrics: Arc<MetricsCollector>,
    state: RwLock<ServiceState>,
    inner: RwLock<Option<ServiceInner>>,
    // Serializes initialize/cleanup so transitions have one writer
    transition: Mutex<()>,
}

impl std::fmt::Debug for MlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MlService")
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

impl MlService {
    /// Create an uninitialized service
    #[must_use]
    pub fn new(
        config: MlConfig,
        flavor: ServiceFlavor,
        loader: Arc<dyn ModelLoader>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            config,
            flavor,
            loader,
            metrics,
            state: RwLock::new(ServiceState::Uninitialized),
            inner: RwLock::new(None),
            transition: Mutex::new(()),
        }
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ServiceState {
        self.state.read().await.clone()
    }

    /// Snapshot of the loaded parameters, when initialized
    pub async fn parameters(&self) -> Option<ModelParameters> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|inner| inner.parameters.clone())
    }

    /// Initialize the service: load parameters, model, validator, processor
    ///
    /// Valid from `Uninitialized` and `Stopped`. A second call while
    /// `Running` warns and no-ops; calling from `Error` is rejected.
    /// Any load failure moves the service to `Error` and surfaces as a
    /// `ServiceInitialization` error.
    pub async fn initialize(&self) -> Result<()> {
        let _guard = self.transition.lock().await;

        match &*self.state.read().await {
            ServiceState::Running => {
                warn!("service already running, ignoring initialize");
                return Ok(());
            }
            ServiceState::Uninitialized | ServiceState::Stopped => {}
            state @ (ServiceState::Initializing | ServiceState::Error(_)) => {
                return Err(Error::ServiceState {
                    state: state.clone(),
                    operation: "initialize",
                });
            }
        }

        *self.state.write().await = ServiceState::Initializing;
        let mut scope = self.metrics.track_operation("service_initialize", None, None);

        match self.build_inner().await {
            Ok(inner) => {
                *self.inner.write().await = Some(inner);
                *self.state.write().await = ServiceState::Running;
                info!(flavor = ?self.flavor, model = %self.config.model_name, "service initialized");
                Ok(())
            }
            Err(e) => {
                scope.fail(e.kind());
                let reason = e.to_string();
                *self.state.write().await = ServiceState::Error(reason.clone());
                Err(Error::ServiceInitialization {
                    message: reason,
                    source: Some(Box::new(e)),
                })
            }
        }
    }

    async fn build_inner(&self) -> Result<ServiceInner> {
        let parameters = ModelParameters::from_config(&self.config, self.flavor);
        let validator = ChunkValidator::new(parameters.validation_params());
        let batch_validator = BatchValidator::new(BatchParams {
            max_batch_size: parameters.batch_size().max(1) * 16,
        });

        let processor = match &parameters {
            ModelParameters::Text(p) => {
                let model = self.loader.load_text(p).await?;
                Processor::Text(TextProcessor::new(model, p.clone()))
            }
            ModelParameters::Embedding(p) => {
                let model = self.loader.load_embedding(p).await?;
                Processor::Embedding(EmbeddingProcessor::new(model, p.clone()))
            }
        };

        Ok(ServiceInner {
            parameters,
            processor,
            validator,
            batch_validator,
        })
    }

    /// Release the model and validator and move to `Stopped`
    ///
    /// Valid from any state; from `Uninitialized` it is a no-op.
    /// Idempotent: Stopped → cleanup → Stopped.
    pub async fn cleanup(&self) {
        let _guard = self.transition.lock().await;
        if matches!(&*self.state.read().await, ServiceState::Uninitialized) {
            return;
        }
        *self.inner.write().await = None;
        *self.state.write().await = ServiceState::Stopped;
        info!(flavor = ?self.flavor, "service stopped");
    }

    /// True iff the service is running and a model is loaded
    pub async fn health_check(&self) -> bool {
        self.state.read().await.is_running() && self.inner.read().await.is_some()
    }

    /// Process one chunk
    ///
    /// Requires `Running`; validation failures surface as-is, and any
    /// processor failure is wrapped with the chunk id. The optional
    /// metadata is attached to the recorded operation sample.
    pub async fn process_chunk(
        &self,
        chunk: &Chunk,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<ChunkOutput> {
        self.require_running("process_chunk").await?;
        let inner = self.inner.read().await;
        let inner = inner.as_ref().ok_or(Error::ServiceState {
            state: ServiceState::Stopped,
            operation: "process_chunk",
        })?;

        inner.validator.validate(chunk)?;

        let mut scope = self
            .metrics
            .track_operation("process_chunk", None, metadata);
        match inner.processor.process(chunk).await {
            Ok(output) => Ok(output),
            Err(e) => {
                scope.fail(e.kind());
                Err(Error::processing(chunk.id.clone(), e))
            }
        }
    }

    /// Process a batch of chunks
    ///
    /// Validates the batch shape, then each chunk (short-circuiting
    /// with the offending chunk id), then processes. The embedding
    /// flavor uses one model invocation for the whole batch; per-item
    /// failures carry the batch index.
    pub async fn process_chunks(
        &self,
        chunks: &[Chunk],
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<Vec<ChunkOutput>> {
        self.require_running("process_chunks").await?;
        let inner = self.inner.read().await;
        let inner = inner.as_ref().ok_or(Error::ServiceState {
            state: ServiceState::Stopped,
            operation: "process_chunks",
        })?;

        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        ensure_valid(inner.batch_validator.check_len(chunks.len()))?;
        for chunk in chunks {
            let errors = inner.validator.check(chunk);
            if !errors.is_empty() {
                return Err(Error::validation(
                    errors
                        .into_iter()
                        .map(|e| format!("chunk {}: {e}", chunk.id))
                        .collect(),
                ));
            }
        }

        let mut scope = self
            .metrics
            .track_operation("process_chunks", Some(chunks.len()), metadata);

        match &inner.processor {
            Processor::Embedding(processor) => match processor.process_batch(chunks).await {
                Ok(outputs) => Ok(outputs),
                Err(e) => {
                    scope.fail(e.kind());
                    Err(Error::processing(chunks[0].id.clone(), e).with_batch_index(0))
                }
            },
            Processor::Text(processor) => {
                let mut outputs = Vec::with_capacity(chunks.len());
                for (index, chunk) in chunks.iter().enumerate() {
                    match processor.process(chunk).await {
                        Ok(output) => outputs.push(output),
                        Err(e) => {
                            scope.fail(e.kind());
                            return Err(
                                Error::processing(chunk.id.clone(), e).with_batch_index(index)
                            );
                        }
                    }
                }
                Ok(outputs)
            }
        }
    }

    async fn require_running(&self, operation: &'static str) -> Result<()> {
        let state = self.state.read().await;
        if state.is_running() {
            Ok(())
        } else {
            Err(Error::ServiceState {
                state: state.clone(),
                operation,
            })
        }
    }
}
