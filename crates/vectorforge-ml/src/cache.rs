//! Resource-aware model cache with hit-counted admission.
//!
//! Models are admitted only once their access count reaches the
//! configured threshold; eviction removes the entry with the smallest
//! `(hit_count, last_accessed)` pair until both the entry budget and
//! the memory budget hold. All mutations are serialized on one lock,
//! so readers observe either the old entry or none.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use vectorforge_core::config::CacheConfig;
use vectorforge_core::error::{Error, Result};
use vectorforge_core::metrics::MetricsCollector;
use vectorforge_core::resources::ResourceManager;

/// A cached model with its bookkeeping
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    model: Arc<T>,
    last_accessed: Instant,
    memory_mb: f64,
    hit_count: u64,
}

#[derive(Debug)]
struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    access_counts: HashMap<String, u32>,
    admitted_memory_mb: f64,
}

/// Caches frequently used model instances under a memory budget
pub struct ModelCache<T> {
    metrics: Arc<MetricsCollector>,
    resources: Arc<ResourceManager>,
    config: CacheConfig,
    inner: Mutex<CacheInner<T>>,
}

impl<T> std::fmt::Debug for ModelCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ModelCache")
            .field("config", &self.config)
            .field("entries", &inner.entries.len())
            .field("admitted_memory_mb", &inner.admitted_memory_mb)
            .finish_non_exhaustive()
    }
}

impl<T> ModelCache<T> {
    /// Create a cache with the given budgets
    #[must_use]
    pub fn new(
        metrics: Arc<MetricsCollector>,
        resources: Arc<ResourceManager>,
        config: CacheConfig,
    ) -> Self {
        Self {
            metrics,
            resources,
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                access_counts: HashMap::new(),
                admitted_memory_mb: 0.0,
            }),
        }
    }

    /// Fetch a model; a hit bumps its recency and hit count
    #[must_use]
    pub fn get_model(&self, model_id: &str) -> Option<Arc<T>> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.get_mut(model_id)?;
        entry.last_accessed = Instant::now();
        entry.hit_count += 1;
        let model = Arc::clone(&entry.model);
        drop(inner);
        let mut scope = self.metrics.track_operation("cache_hit", None, None);
        scope.annotate("model_id", model_id);
        Some(model)
    }

    /// Offer a model to the cache
    ///
    /// The access counter for `model_id` is incremented first; until it
    /// reaches the admission threshold the model is not cached. An
    /// admitting call evicts least-used entries as needed and fails
    /// with a resource error when eviction cannot free enough budget.
    pub fn cache_model(&self, model_id: &str, model: Arc<T>, memory_mb: f64) -> Result<()> {
        let mut inner = self.inner.lock();
        let count = inner
            .access_counts
            .entry(model_id.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        if *count < self.config.min_hit_count {
            debug!(
                model_id,
                accesses = *count,
                threshold = self.config.min_hit_count,
                "model below admission threshold"
            );
            return Ok(());
        }

        if let Some(existing) = inner.entries.get_mut(model_id) {
            // Already admitted: refresh the instance and recency
            existing.model = model;
            existing.last_accessed = Instant::now();
            return Ok(());
        }

        while inner.entries.len() >= self.config.max_entries
            || inner.admitted_memory_mb + memory_mb > self.config.max_memory_mb
            || !self.resources.check_memory(memory_mb)
        {
            if !Self::evict_least_used(&mut inner, &self.metrics) {
                return Err(Error::Resource {
                    message: format!(
                        "cannot cache model {model_id}: insufficient memory after eviction"
                    ),
                    source: None,
                });
            }
        }

        inner.admitted_memory_mb += memory_mb;
        inner.entries.insert(
            model_id.to_string(),
            CacheEntry {
                model,
                last_accessed: Instant::now(),
                memory_mb,
                hit_count: 1,
            },
        );
        drop(inner);
        info!(model_id, memory_mb, "model cached");
        let mut scope = self.metrics.track_operation("cache_store", None, None);
        scope.annotate("model_id", model_id);
        scope.set_memory_mb(memory_mb);
        Ok(())
    }

    /// Number of admitted entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True when nothing is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total memory attributed to admitted entries, in MB
    #[must_use]
    pub fn admitted_memory_mb(&self) -> f64 {
        self.inner.lock().admitted_memory_mb
    }

    /// Hit count of an admitted entry, for diagnostics
    #[must_use]
    pub fn hit_count(&self, model_id: &str) -> Option<u64> {
        self.inner.lock().entries.get(model_id).map(|e| e.hit_count)
    }

    /// Evict the entry with the smallest `(hit_count, last_accessed)`
    fn evict_least_used(inner: &mut CacheInner<T>, metrics: &MetricsCollector) -> bool {
        let victim = inner
            .entries
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.hit_count
                    .cmp(&b.hit_count)
                    .then(a.last_accessed.cmp(&b.last_accessed))
            })
            .map(|(id, _)| id.clone());

        let Some(victim) = victim else {
            return false;
        };
        if let Some(evicted) = inner.entries.remove(&victim) {
            inner.admitted_memory_mb -= evicted.memory_mb;
            info!(
                model_id = %victim,
                hits = evicted.hit_count,
                memory_mb = evicted.memory_mb,
                "model evicted"
            );
            let mut scope = metrics.track_operation("cache_evict", None, None);
            scope.annotate("model_id", victim);
            scope.annotate("hits", evicted.hit_count);
            scope.set_memory_mb(evicted.memory_mb);
        }
        true
    }
}
