//! Vector store capability consumed by the batch engine.
//!
//! Implementations live outside the core and translate native store
//! errors into the shared taxonomy at this boundary with explicit
//! wrapper functions.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use vectorforge_core::error::Result;

use crate::search::{SearchPage, SearchQuery};

/// An object handed to a batch write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Object id
    pub id: Uuid,
    /// Object properties
    pub properties: Map<String, Value>,
    /// Attached vector, when already computed
    pub vector: Option<Vec<f32>>,
}

/// Per-item result of a batch write or delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Object id
    pub id: Uuid,
    /// Success or the failure message
    pub status: ItemStatus,
}

impl ItemOutcome {
    /// A successful outcome
    #[must_use]
    pub const fn success(id: Uuid) -> Self {
        Self {
            id,
            status: ItemStatus::Success,
        }
    }

    /// A failed outcome with a message
    pub fn error(id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id,
            status: ItemStatus::Error(message.into()),
        }
    }

    /// True when the item landed
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, ItemStatus::Success)
    }
}

/// Status of one item in a batch operation
///
/// An object that cannot be found after a write is an error outcome,
/// not a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum ItemStatus {
    /// The operation landed
    Success,
    /// The operation failed with this message
    Error(String),
}

/// Collection statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Total object count
    pub count: u64,
    /// Object counts per type
    pub per_type: HashMap<String, u64>,
    /// Store-reported status string
    pub status: String,
}

/// CRUD, batch CRUD, and similarity search over one vector store
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create one object, returning its id
    async fn create(&self, collection: &str, item: StoredItem) -> Result<Uuid>;

    /// Fetch one object by id
    async fn get(&self, collection: &str, id: Uuid) -> Result<Option<Value>>;

    /// Replace one object; false when it does not exist
    async fn update(&self, collection: &str, id: Uuid, item: StoredItem) -> Result<bool>;

    /// Delete one object; false when it does not exist
    async fn delete(&self, collection: &str, id: Uuid) -> Result<bool>;

    /// Insert a batch, returning one outcome per item in input order
    async fn batch_insert(
        &self,
        collection: &str,
        items: Vec<StoredItem>,
        batch_size: usize,
        dynamic: bool,
    ) -> Result<Vec<ItemOutcome>>;

    /// Delete a batch of ids, returning one outcome per id in input order
    async fn batch_delete(
        &self,
        collection: &str,
        ids: Vec<Uuid>,
        batch_size: usize,
    ) -> Result<Vec<ItemOutcome>>;

    /// Similarity search with cursor pagination
    async fn search(&self, collection: &str, query: &SearchQuery) -> Result<SearchPage>;

    /// Whether the store is reachable; never errors
    async fn health_check(&self) -> bool;

    /// Collection statistics
    async fn stats(&self, collection: &str) -> Result<StoreStats>;
}
