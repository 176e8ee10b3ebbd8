//! # Vectorforge ML
//!
//! ML processing core: a stateful service wrapper around a
//! text-processing or embedding model, with lifecycle management,
//! validation composed from parameter bounds, processor strategies,
//! and a hit-counted, memory-aware model cache.
//!
//! Model runtimes are capabilities: adapters implement
//! [`models::TextModel`], [`models::EmbeddingModel`], and
//! [`models::ModelLoader`]; this crate never links an inference stack.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod cache;
pub mod models;
pub mod parameters;
pub mod processor;
pub mod service;

pub use cache::ModelCache;
pub use models::{EmbeddingModel, ModelLoader, TextModel};
pub use parameters::{EmbeddingParameters, ModelParameters, ServiceFlavor, TextParameters};
pub use processor::{EmbeddingProcessor, Processor, TextProcessor};
pub use service::MlService;
