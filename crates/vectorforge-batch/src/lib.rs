//! # Vectorforge Batch
//!
//! The dynamic batch engine: receives documents or ids, assembles
//! sub-batches sized from a sliding performance window, gates them
//! against a memory estimate, dispatches against an opaque
//! [`store::VectorStore`] capability, and re-drives rejected batches
//! through the retry orchestrator. Search is cursor-paginated and
//! filter predicates stay opaque to the engine.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod engine;
pub mod performance;
pub mod search;
pub mod store;

pub use engine::{BatchEngine, BatchResult, Document, FailedItem};
pub use performance::{BatchPerformanceTracker, BatchSample, TrackerSummary};
pub use search::{Filter, SearchHit, SearchOutcome, SearchPage, SearchQuery};
pub use store::{ItemOutcome, ItemStatus, StoreStats, StoredItem, VectorStore};
