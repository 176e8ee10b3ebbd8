//! Model capability traits supplied by adapters.
//!
//! The core never names a concrete model runtime; adapters implement
//! these traits over whatever inference stack the deployment uses.

use async_trait::async_trait;
use std::sync::Arc;

use vectorforge_core::chunk::Annotations;
use vectorforge_core::error::Result;

use crate::parameters::{EmbeddingParameters, TextParameters};

/// A text-processing model producing linguistic annotations
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Annotate one text with tokens, lemmas, POS tags, and entities
    async fn annotate(&self, text: &str) -> Result<Annotations>;
}

/// An embedding model producing fixed-dimension vectors
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Encode one text
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;

    /// Encode a batch of texts in one model invocation
    async fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output vector dimension
    fn dimension(&self) -> usize;
}

/// Factory capability constructing models from parameters
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Load a text-processing model
    async fn load_text(&self, params: &TextParameters) -> Result<Arc<dyn TextModel>>;

    /// Load an embedding model
    async fn load_embedding(&self, params: &EmbeddingParameters) -> Result<Arc<dyn EmbeddingModel>>;
}
