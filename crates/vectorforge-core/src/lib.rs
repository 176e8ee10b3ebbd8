//! # Vectorforge Core
//!
//! Foundation crate for the vectorforge ingestion pipeline: the chunk
//! data model, the shared error taxonomy, process configuration,
//! operation metrics and profiling, resource accounting, the retry
//! orchestrator, and the validation framework.
//!
//! ## Architecture
//!
//! ```text
//! vectorforge-core/
//! ├── chunk/          # Chunk, annotations, processor output
//! ├── error/          # Error taxonomy and classification
//! ├── config/         # Env-sourced process configuration
//! ├── metrics/        # Bounded per-operation sample rings
//! ├── profiler/       # Combined CPU/memory/IO samples
//! ├── resources/      # Memory ceilings and device selection
//! ├── retry/          # Per-item retry with backoff strategies
//! ├── validation/     # Composable chunk/batch/metadata validators
//! ├── progress/       # Batch progress counters
//! ├── observe/        # MetricsSink and Tracer capability seams
//! └── service_state/  # Shared lifecycle state machine
//! ```
//!
//! Higher-level crates (`vectorforge-ml`, `vectorforge-batch`,
//! `vectorforge-broker`) build on these types; this crate has no
//! knowledge of any concrete model, vector store, or broker.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod chunk;
pub mod config;
pub mod error;
pub mod metrics;
pub mod observe;
pub mod profiler;
pub mod progress;
pub mod resources;
pub mod retry;
pub mod service_state;
pub mod validation;

pub use chunk::{Annotations, Chunk, ChunkOutput};
pub use config::{BatchConfig, CacheConfig, EnvSource, MlConfig};
pub use error::{Error, Result, ValidationReport};
pub use metrics::{MetricsCollector, OperationMetric, OperationScope, WindowStats};
pub use observe::{MetricsSink, NoopSink, NoopTracer, Span, Tracer};
pub use profiler::{OperationProfiler, ProfileSample};
pub use progress::{OperationKind, ProgressSnapshot, ProgressTracker};
pub use resources::{Device, DeviceProbe, NoGpu, ResourceLimits, ResourceManager};
pub use retry::{RetryOrchestrator, RetryOutcome, RetryPolicy, RetryStrategy, RetrySummary};
pub use service_state::ServiceState;
pub use validation::{
    BatchParams, BatchValidator, ChunkValidator, ContentValidator, MetadataValidator,
    ResourceAwareValidator, ResourceThresholds, ValidationParams,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
