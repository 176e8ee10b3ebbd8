//! Chunk data model: the unit of text flowing through the pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of text plus metadata passed through processing and embedding
///
/// Produced by upstream parsers, consumed by the ML service and the
/// batch engine, discarded after a successful commit. Metadata values
/// are JSON primitives; the metadata validator rejects nested values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Unique, non-empty identifier
    pub id: String,
    /// Text content
    pub content: String,
    /// Flat metadata mapping
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Chunk {
    /// Create a chunk with empty metadata
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata value
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whitespace-separated word count of the content
    #[must_use]
    pub fn word_count(&self) -> usize {
        self.content.split_whitespace().count()
    }
}

/// Linguistic annotations produced by the text processor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotations {
    /// Surface tokens
    pub tokens: Vec<String>,
    /// Lemmatized tokens
    pub lemmas: Vec<String>,
    /// Part-of-speech tags, parallel to `tokens`
    pub pos_tags: Vec<String>,
    /// Named entities as `(text, label)` pairs
    pub entities: Vec<(String, String)>,
}

/// Result of processing one chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkOutput {
    /// Text pipeline output
    Annotations {
        /// Id of the source chunk
        chunk_id: String,
        /// The annotations
        annotations: Annotations,
    },
    /// Embedding pipeline output
    Embedding {
        /// Id of the source chunk
        chunk_id: String,
        /// Fixed-dimension vector
        vector: Vec<f32>,
    },
}

impl ChunkOutput {
    /// Id of the chunk this output belongs to
    #[must_use]
    pub fn chunk_id(&self) -> &str {
        match self {
            Self::Annotations { chunk_id, .. } | Self::Embedding { chunk_id, .. } => chunk_id,
        }
    }
}
