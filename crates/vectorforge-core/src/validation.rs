//! Composable validators for chunks, batches, and metadata.
//!
//! Validators return aggregated message lists rather than erroring;
//! callers escalate to [`Error::Validation`] when a list is non-empty.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::resources::ResourceManager;

/// Bounds applied to chunk content and metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationParams {
    /// Minimum content length in characters
    pub min_text_length: usize,
    /// Maximum content length in characters
    pub max_text_length: usize,
    /// Minimum whitespace-separated word count
    pub min_words: usize,
    /// Metadata keys that must be present
    pub required_metadata_fields: HashSet<String>,
    /// Metadata keys allowed beyond the required set
    pub optional_metadata_fields: HashSet<String>,
}

impl Default for ValidationParams {
    fn default() -> Self {
        Self {
            min_text_length: 10,
            max_text_length: 100_000,
            min_words: 3,
            required_metadata_fields: HashSet::new(),
            optional_metadata_fields: HashSet::new(),
        }
    }
}

/// Bounds applied to whole batches
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchParams {
    /// Maximum number of items per batch
    pub max_batch_size: usize,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
        }
    }
}

/// Escalate a message list into a validation error
pub fn ensure_valid(messages: Vec<String>) -> Result<()> {
    if messages.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(messages))
    }
}

/// Validates text content against length and word-count bounds
#[derive(Debug, Clone)]
pub struct ContentValidator {
    params: ValidationParams,
}

impl ContentValidator {
    /// Create a validator with the given bounds
    #[must_use]
    pub fn new(params: ValidationParams) -> Self {
        Self { params }
    }

    /// Check `content`, returning every violation found
    #[must_use]
    pub fn check(&self, content: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if content.is_empty() {
            errors.push("content cannot be empty".to_string());
            return errors;
        }
        let len = content.chars().count();
        if len < self.params.min_text_length {
            errors.push(format!(
                "content length {len} is below minimum {}",
                self.params.min_text_length
            ));
        }
        if len > self.params.max_text_length {
            errors.push(format!(
                "content length {len} exceeds maximum {}",
                self.params.max_text_length
            ));
        }
        let words = content.split_whitespace().count();
        if words < self.params.min_words {
            errors.push(format!(
                "word count {words} is below minimum {}",
                self.params.min_words
            ));
        }
        errors
    }
}

/// Validates batch shape
#[derive(Debug, Clone)]
pub struct BatchValidator {
    params: BatchParams,
}

impl BatchValidator {
    /// Create a validator with the given batch bounds
    #[must_use]
    pub fn new(params: BatchParams) -> Self {
        Self { params }
    }

    /// Check a batch of `len` items
    #[must_use]
    pub fn check_len(&self, len: usize) -> Vec<String> {
        let mut errors = Vec::new();
        if len == 0 {
            errors.push("batch cannot be empty".to_string());
            return errors;
        }
        if len > self.params.max_batch_size {
            errors.push(format!(
                "batch size {len} exceeds maximum {}",
                self.params.max_batch_size
            ));
        }
        errors
    }
}

/// Validates metadata keys and value shapes
#[derive(Debug, Clone)]
pub struct MetadataValidator {
    params: ValidationParams,
}

impl MetadataValidator {
    /// Create a validator with the given field sets
    #[must_use]
    pub fn new(params: ValidationParams) -> Self {
        Self { params }
    }

    /// Check a metadata map
    #[must_use]
    pub fn check(&self, metadata: &std::collections::HashMap<String, Value>) -> Vec<String> {
        let mut errors = Vec::new();

        let keys: HashSet<&str> = metadata.keys().map(String::as_str).collect();
        let missing: Vec<&str> = self
            .params
            .required_metadata_fields
            .iter()
            .map(String::as_str)
            .filter(|k| !keys.contains(*k))
            .collect();
        if !missing.is_empty() {
            let mut missing = missing;
            missing.sort_unstable();
            errors.push(format!(
                "missing required metadata fields: {}",
                missing.join(", ")
            ));
        }

        if !self.params.required_metadata_fields.is_empty()
            || !self.params.optional_metadata_fields.is_empty()
        {
            let mut invalid: Vec<&str> = keys
                .iter()
                .copied()
                .filter(|k| {
                    !self.params.required_metadata_fields.contains(*k)
                        && !self.params.optional_metadata_fields.contains(*k)
                })
                .collect();
            if !invalid.is_empty() {
                invalid.sort_unstable();
                errors.push(format!("invalid metadata fields: {}", invalid.join(", ")));
            }
        }

        for (key, value) in metadata {
            if value.is_array() || value.is_object() {
                errors.push(format!("metadata field {key} must be a primitive value"));
            }
        }

        errors
    }
}

/// Composite validator covering content and metadata of a chunk
#[derive(Debug, Clone)]
pub struct ChunkValidator {
    content: ContentValidator,
    metadata: MetadataValidator,
}

impl ChunkValidator {
    /// Compose content and metadata validation from one parameter set
    #[must_use]
    pub fn new(params: ValidationParams) -> Self {
        Self {
            content: ContentValidator::new(params.clone()),
            metadata: MetadataValidator::new(params),
        }
    }

    /// Check a chunk, aggregating all violations
    #[must_use]
    pub fn check(&self, chunk: &Chunk) -> Vec<String> {
        let mut errors = Vec::new();
        if chunk.id.is_empty() {
            errors.push("chunk id cannot be empty".to_string());
        }
        errors.extend(self.content.check(&chunk.content));
        if !chunk.metadata.is_empty() {
            errors.extend(self.metadata.check(&chunk.metadata));
        }
        errors
    }

    /// Check a chunk and escalate violations
    pub fn validate(&self, chunk: &Chunk) -> Result<()> {
        ensure_valid(self.check(chunk))
    }
}

/// Thresholds for resource-aware validation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Resident memory ceiling in MB
    pub max_memory_mb: f64,
    /// Rolling mean duration ceiling in milliseconds
    pub max_duration_ms: f64,
    /// Minimum rolling success rate in `[0, 1]`
    pub min_success_rate: f64,
    /// Consecutive failed passes before the validator trips
    pub max_consecutive_failures: u32,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            max_memory_mb: 1000.0,
            max_duration_ms: 5000.0,
            min_success_rate: 0.8,
            max_consecutive_failures: 3,
        }
    }
}

/// Validates operations against live resource and performance state
///
/// Tracks a consecutive-failure counter that surfaces an extra error
/// once the threshold is reached; any clean pass resets it.
pub struct ResourceAwareValidator {
    metrics: Arc<MetricsCollector>,
    resources: Arc<ResourceManager>,
    thresholds: ResourceThresholds,
    tracked_operation: String,
    consecutive_failures: AtomicU32,
}

impl std::fmt::Debug for ResourceAwareValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceAwareValidator")
            .field("thresholds", &self.thresholds)
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl ResourceAwareValidator {
    /// Create a validator watching `tracked_operation` samples
    #[must_use]
    pub fn new(
        metrics: Arc<MetricsCollector>,
        resources: Arc<ResourceManager>,
        thresholds: ResourceThresholds,
        tracked_operation: impl Into<String>,
    ) -> Self {
        Self {
            metrics,
            resources,
            thresholds,
            tracked_operation: tracked_operation.into(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Check current resource state plus the estimated cost of `chunks`
    #[must_use]
    pub fn check(&self, chunks: &[Chunk]) -> Vec<String> {
        let mut errors = Vec::new();

        let current_memory = self.resources.current_memory_mb();
        if current_memory > self.thresholds.max_memory_mb {
            errors.push(format!(
                "current memory usage ({current_memory:.1}MB) exceeds limit ({:.1}MB)",
                self.thresholds.max_memory_mb
            ));
        }

        if let Some(stats) = self.metrics.stats(&self.tracked_operation) {
            if stats.mean > self.thresholds.max_duration_ms {
                errors.push(format!(
                    "average operation duration ({:.1}ms) exceeds limit ({:.1}ms)",
                    stats.mean, self.thresholds.max_duration_ms
                ));
            }
        }
        if let Some(rate) = self.metrics.success_rate(&self.tracked_operation) {
            if rate < self.thresholds.min_success_rate {
                errors.push(format!(
                    "operation success rate ({:.1}%) below threshold ({:.1}%)",
                    rate * 100.0,
                    self.thresholds.min_success_rate * 100.0
                ));
            }
        }

        if !chunks.is_empty() {
            let total_text: usize = chunks.iter().map(|c| c.content.len()).sum();
            let estimated_mb = (total_text * 2) as f64 / 1024.0 / 1024.0;
            if estimated_mb > self.thresholds.max_memory_mb {
                errors.push(format!(
                    "estimated memory requirement ({estimated_mb:.1}MB) exceeds limit ({:.1}MB)",
                    self.thresholds.max_memory_mb
                ));
            }
        }

        if errors.is_empty() {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.thresholds.max_consecutive_failures {
                errors.push(format!("operation failed {failures} times consecutively"));
            }
        }

        errors
    }
}
