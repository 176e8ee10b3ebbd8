//! Shared error taxonomy for the ingestion core.
//!
//! Batch APIs return structured results and never raise on partial
//! failure; single-item APIs return the classified error from this
//! module. Health checks return booleans and never error.

use std::fmt;

use thiserror::Error;

use crate::service_state::ServiceState;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the ingestion core
#[derive(Error, Debug)]
pub enum Error {
    /// Input failed validation; carries the aggregated messages
    #[error("validation failed: {0}")]
    Validation(ValidationReport),

    /// Memory or device budget exceeded before an operation ran
    #[error("resource budget exceeded: required {required_mb:.1}MB, available {available_mb:.1}MB")]
    ResourceExhausted {
        /// Memory the operation asked for
        required_mb: f64,
        /// Memory left under the configured ceiling
        available_mb: f64,
    },

    /// A resource-gated operation failed while running
    #[error("resource operation failed: {message}")]
    Resource {
        /// What was being attempted
        message: String,
        /// Underlying failure
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Operation invalid in the service's current state
    #[error("operation {operation} invalid in state {state}")]
    ServiceState {
        /// State the service was in
        state: ServiceState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Service initialization failed; fatal for the instance until cleanup
    #[error("service initialization failed: {message}")]
    ServiceInitialization {
        /// What went wrong
        message: String,
        /// Underlying failure
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Per-item processing failure, retryable at the orchestrator level
    #[error("processing failed for chunk {chunk_id} (batch index {batch_index:?})")]
    Processing {
        /// Id of the chunk that failed
        chunk_id: String,
        /// Position within the batch, when processed as part of one
        batch_index: Option<usize>,
        /// Underlying failure
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Whole-batch failure; every item in the batch inherits it
    #[error("batch operation failed: {0}")]
    Batch(String),

    /// A bounded operation exceeded its budget
    #[error("operation timed out after {elapsed_ms}ms (deadline: {deadline_exceeded})")]
    Timeout {
        /// Elapsed time in milliseconds
        elapsed_ms: u64,
        /// Whether a global deadline (rather than a per-op budget) fired
        deadline_exceeded: bool,
    },

    /// Credential failure; never retried
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Profiler or metrics failure; never aborts the wrapped operation
    #[error("instrumentation failure: {0}")]
    Instrumentation(String),

    /// Startup configuration was invalid
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Build a validation error from raw messages
    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(ValidationReport::new(messages))
    }

    /// Build a resource error wrapping a cause
    pub fn resource(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Resource {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Build a processing error for a single chunk
    pub fn processing(
        chunk_id: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Processing {
            chunk_id: chunk_id.into(),
            batch_index: None,
            source: Box::new(source),
        }
    }

    /// Attach a batch index to a processing error; other kinds pass through
    #[must_use]
    pub fn with_batch_index(self, index: usize) -> Self {
        match self {
            Self::Processing {
                chunk_id, source, ..
            } => Self::Processing {
                chunk_id,
                batch_index: Some(index),
                source,
            },
            other => other,
        }
    }

    /// Short stable name for the error kind, used in metrics labels
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::Resource { .. } => "resource",
            Self::ServiceState { .. } => "service_state",
            Self::ServiceInitialization { .. } => "service_initialization",
            Self::Processing { .. } => "processing",
            Self::Batch(_) => "batch",
            Self::Timeout { .. } => "timeout",
            Self::Authentication(_) => "authentication",
            Self::Instrumentation(_) => "instrumentation",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Whether the retry orchestrator may re-attempt after this error
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Processing { .. } | Self::Batch(_) | Self::ResourceExhausted { .. } => true,
            Self::Timeout {
                deadline_exceeded, ..
            } => !*deadline_exceeded,
            _ => false,
        }
    }

    /// Whether this error ends the containing operation outright
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::Authentication(_)
                | Self::ServiceState { .. }
                | Self::ServiceInitialization { .. }
                | Self::Configuration(_)
        )
    }
}

/// Aggregated validation messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    messages: Vec<String>,
}

impl ValidationReport {
    /// Create a report from collected messages
    #[must_use]
    pub fn new(messages: Vec<String>) -> Self {
        Self { messages }
    }

    /// The collected messages, in discovery order
    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// True when no validator flagged anything
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.messages.join("; "))
    }
}
