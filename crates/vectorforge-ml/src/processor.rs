//! Processor strategies: annotation and embedding.
//!
//! A processor is a tagged variant rather than a trait object; the
//! service selects one at initialization from the loaded parameter
//! flavor.

use std::sync::Arc;

use tracing::trace;

use vectorforge_core::chunk::{Chunk, ChunkOutput};
use vectorforge_core::error::Result;

use crate::models::{EmbeddingModel, TextModel};
use crate::parameters::{EmbeddingParameters, TextParameters};

/// Processing strategy selected at service initialization
#[derive(Clone)]
pub enum Processor {
    /// Linguistic annotation pipeline
    Text(TextProcessor),
    /// Embedding pipeline
    Embedding(EmbeddingProcessor),
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(_) => f.write_str("Processor::Text"),
            Self::Embedding(_) => f.write_str("Processor::Embedding"),
        }
    }
}

impl Processor {
    /// Process a single chunk
    pub async fn process(&self, chunk: &Chunk) -> Result<ChunkOutput> {
        match self {
            Self::Text(p) => p.process(chunk).await,
            Self::Embedding(p) => p.process(chunk).await,
        }
    }
}

/// Runs the annotation pipeline over chunks
#[derive(Clone)]
pub struct TextProcessor {
    model: Arc<dyn TextModel>,
    #[allow(dead_code)]
    params: TextParameters,
}

impl TextProcessor {
    /// Create a processor over a loaded model
    #[must_use]
    pub fn new(model: Arc<dyn TextModel>, params: TextParameters) -> Self {
        Self { model, params }
    }

    /// Annotate one chunk
    pub async fn process(&self, chunk: &Chunk) -> Result<ChunkOutput> {
        let annotations = self.model.annotate(&chunk.content).await?;
        trace!(chunk_id = %chunk.id, tokens = annotations.tokens.len(), "chunk annotated");
        Ok(ChunkOutput::Annotations {
            chunk_id: chunk.id.clone(),
            annotations,
        })
    }
}

/// Produces fixed-dimension vectors for chunks
#[derive(Clone)]
pub struct EmbeddingProcessor {
    model: Arc<dyn EmbeddingModel>,
    params: EmbeddingParameters,
}

impl EmbeddingProcessor {
    /// Create a processor over a loaded model
    #[must_use]
    pub fn new(model: Arc<dyn EmbeddingModel>, params: EmbeddingParameters) -> Self {
        Self { model, params }
    }

    /// Output vector dimension
    #[must_use]
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    /// Embed one chunk
    pub async fn process(&self, chunk: &Chunk) -> Result<ChunkOutput> {
        let mut vector = self.model.encode(&chunk.content).await?;
        if self.params.normalize {
            normalize_l2(&mut vector);
        }
        Ok(ChunkOutput::Embedding {
            chunk_id: chunk.id.clone(),
            vector,
        })
    }

    /// Embed a batch of chunks with one model invocation
    ///
    /// Normalization applies exactly as in the single-chunk form.
    pub async fn process_batch(&self, chunks: &[Chunk]) -> Result<Vec<ChunkOutput>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let mut vectors = self.model.encode_batch(&texts).await?;
        if self.params.normalize {
            for vector in &mut vectors {
                normalize_l2(vector);
            }
        }
        trace!(count = vectors.len(), "batch embedded");
        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| ChunkOutput::Embedding {
                chunk_id: chunk.id.clone(),
                vector,
            })
            .collect())
    }
}

/// Scale a vector to unit L2 norm; zero vectors are left untouched
fn normalize_l2(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubEmbedding {
        invocations: AtomicU32,
    }

    #[async_trait]
    impl EmbeddingModel for StubEmbedding {
        async fn encode(&self, _text: &str) -> Result<Vec<f32>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(vec![3.0, 4.0])
        }

        async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|_| vec![3.0, 4.0]).collect())
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn embedding_params(normalize: bool) -> EmbeddingParameters {
        EmbeddingParameters {
            model_name: "stub".into(),
            batch_size: 8,
            device: vectorforge_core::resources::Device::Cpu,
            min_text_length: 1,
            max_text_length: 1000,
            min_words: 1,
            required_metadata_fields: HashSet::new(),
            optional_metadata_fields: HashSet::new(),
            max_memory_mb: 1024.0,
            normalize,
        }
    }

    #[tokio::test]
    async fn single_embedding_normalizes() {
        let model = Arc::new(StubEmbedding {
            invocations: AtomicU32::new(0),
        });
        let processor = EmbeddingProcessor::new(model, embedding_params(true));
        let out = processor.process(&Chunk::new("c1", "text")).await.unwrap();
        match out {
            ChunkOutput::Embedding { vector, .. } => {
                assert!((vector[0] - 0.6).abs() < 1e-6);
                assert!((vector[1] - 0.8).abs() < 1e-6);
            }
            ChunkOutput::Annotations { .. } => panic!("expected embedding"),
        }
    }

    #[tokio::test]
    async fn batch_uses_one_invocation_and_normalizes_uniformly() {
        let model = Arc::new(StubEmbedding {
            invocations: AtomicU32::new(0),
        });
        let processor = EmbeddingProcessor::new(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            embedding_params(true),
        );
        let chunks = vec![
            Chunk::new("c1", "one"),
            Chunk::new("c2", "two"),
            Chunk::new("c3", "three"),
        ];
        let outputs = processor.process_batch(&chunks).await.unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(model.invocations.load(Ordering::SeqCst), 1);
        for out in outputs {
            let ChunkOutput::Embedding { vector, .. } = out else {
                panic!("expected embedding");
            };
            let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn unnormalized_vectors_pass_through() {
        let model = Arc::new(StubEmbedding {
            invocations: AtomicU32::new(0),
        });
        let processor = EmbeddingProcessor::new(model, embedding_params(false));
        let out = processor.process(&Chunk::new("c1", "text")).await.unwrap();
        let ChunkOutput::Embedding { vector, .. } = out else {
            panic!("expected embedding");
        };
        assert_eq!(vector, vec![3.0, 4.0]);
    }

    #[test]
    fn zero_vector_survives_normalization() {
        let mut v = vec![0.0_f32; 4];
        normalize_l2(&mut v);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let model = Arc::new(StubEmbedding {
            invocations: AtomicU32::new(0),
        });
        let processor = EmbeddingProcessor::new(
            Arc::clone(&model) as Arc<dyn EmbeddingModel>,
            embedding_params(true),
        );
        let outputs = processor.process_batch(&[]).await.unwrap();
        assert!(outputs.is_empty());
        assert_eq!(model.invocations.load(Ordering::SeqCst), 0);
    }
}
