//! Search query descriptors and outcomes.
//!
//! The engine never depends on a store's native query DSL: filters are
//! opaque predicates produced by store adapters, and pagination is
//! cursor-based exclusively.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque filter predicate produced by a store adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter(Value);

impl Filter {
    /// Wrap an adapter-produced predicate payload
    #[must_use]
    pub fn new(payload: Value) -> Self {
        Self(payload)
    }

    /// The raw predicate payload
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.0
    }
}

/// A search request against one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Opaque filter predicate
    pub filter: Option<Filter>,
    /// Text query for hybrid search
    pub text: Option<String>,
    /// Vector for pure similarity search
    pub vector: Option<Vec<f32>>,
    /// Maximum hits per page
    pub limit: usize,
    /// Cursor from a previous page
    pub cursor: Option<String>,
}

impl SearchQuery {
    /// A text query with the given page size
    pub fn text(query: impl Into<String>, limit: usize) -> Self {
        Self {
            filter: None,
            text: Some(query.into()),
            vector: None,
            limit,
            cursor: None,
        }
    }

    /// A pure vector query with the given page size
    #[must_use]
    pub fn vector(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            filter: None,
            text: None,
            vector: Some(vector),
            limit,
            cursor: None,
        }
    }

    /// Restrict results with an opaque filter
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Continue from a cursor
    #[must_use]
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// One search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Object id
    pub id: String,
    /// Stored properties
    pub properties: Value,
    /// Relevance score, when the store provides one
    pub score: Option<f64>,
}

/// A page of hits returned by the store adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    /// Hits in relevance order
    pub items: Vec<SearchHit>,
    /// Total matching objects across pages
    pub total_matched: u64,
    /// Cursor for the next page, absent on the last page
    pub next_cursor: Option<String>,
}

/// Search result surfaced by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Hits in relevance order
    pub items: Vec<SearchHit>,
    /// Total matching objects across pages
    pub total_matched: u64,
    /// Wall-clock duration of the query in milliseconds
    pub duration_ms: f64,
    /// Cursor for the next page, absent on the last page
    pub next_cursor: Option<String>,
}
