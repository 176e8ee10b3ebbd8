//! Process configuration: plain structs with explicit env loading.
//!
//! Configuration is read once at startup from the environment, with an
//! optional `.env`-style file layered underneath. Names are
//! case-sensitive and prefixed by subsystem (`ML_`, `BATCH_`,
//! `CACHE_`, `RETRY_`). Unknown keys are ignored; invalid values fail
//! at startup with [`Error::Configuration`].

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::resources::Device;
use crate::retry::{RetryPolicy, RetryStrategy};

/// Key/value source for configuration loading
///
/// Tests inject plain maps; production code layers a `.env` file under
/// the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    vars: HashMap<String, String>,
}

impl EnvSource {
    /// Snapshot the process environment
    #[must_use]
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a source from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Layer a `.env`-style file underneath the current values
    ///
    /// Existing values win over file values; a missing file is an
    /// error, a malformed line fails startup.
    pub fn with_env_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        for item in dotenvy::from_path_iter(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {e}", path.display())))?
        {
            let (key, value) = item
                .map_err(|e| Error::Configuration(format!("malformed {}: {e}", path.display())))?;
            self.vars.entry(key).or_insert(value);
        }
        debug!(path = %path.display(), "layered env file");
        Ok(self)
    }

    /// Raw value for `key`, when present
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Parse `key` as `T`; missing keys yield `None`, invalid values fail
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                Error::Configuration(format!("invalid value {raw:?} for {key}: {e}"))
            }),
        }
    }

    /// Parse `key` as a comma-separated set
    pub fn parse_set(&self, key: &str) -> Option<HashSet<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect()
        })
    }

    fn parse_device(&self, key: &str) -> Result<Option<Device>> {
        match self.get(key) {
            None => Ok(None),
            Some("cpu") => Ok(Some(Device::Cpu)),
            Some("gpu" | "cuda") => Ok(Some(Device::Gpu)),
            Some(other) => Err(Error::Configuration(format!(
                "invalid value {other:?} for {key}: expected cpu, gpu, or cuda"
            ))),
        }
    }
}

/// ML service configuration (`ML_` prefix)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlConfig {
    /// Model identifier understood by the model loader
    pub model_name: String,
    /// Preferred processing batch size
    pub batch_size: usize,
    /// Target compute device
    pub device: Device,
    /// Minimum chunk content length
    pub min_text_length: usize,
    /// Maximum chunk content length
    pub max_text_length: usize,
    /// Minimum chunk word count
    pub min_words: usize,
    /// Metadata keys that must be present on chunks
    pub required_metadata_fields: HashSet<String>,
    /// Metadata keys allowed beyond the required set
    pub optional_metadata_fields: HashSet<String>,
    /// Memory ceiling for processing, in MB
    pub max_memory_mb: f64,
    /// Whether embedding vectors are L2-normalized
    pub normalize_embeddings: bool,
}

impl Default for MlConfig {
    fn default() -> Self {
        Self {
            model_name: "all-MiniLM-L6-v2".to_string(),
            batch_size: 32,
            device: Device::Cpu,
            min_text_length: 10,
            max_text_length: 100_000,
            min_words: 3,
            required_metadata_fields: HashSet::new(),
            optional_metadata_fields: HashSet::new(),
            max_memory_mb: 4096.0,
            normalize_embeddings: true,
        }
    }
}

impl MlConfig {
    /// Load from an env source, starting from defaults
    pub fn from_env(source: &EnvSource) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = source.get("ML_MODEL_NAME") {
            config.model_name = name.to_string();
        }
        if let Some(v) = source.parse("ML_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = source.parse_device("ML_DEVICE")? {
            config.device = v;
        }
        if let Some(v) = source.parse("ML_MIN_TEXT_LENGTH")? {
            config.min_text_length = v;
        }
        if let Some(v) = source.parse("ML_MAX_TEXT_LENGTH")? {
            config.max_text_length = v;
        }
        if let Some(v) = source.parse("ML_MIN_WORDS")? {
            config.min_words = v;
        }
        if let Some(v) = source.parse_set("ML_REQUIRED_METADATA_FIELDS") {
            config.required_metadata_fields = v;
        }
        if let Some(v) = source.parse_set("ML_OPTIONAL_METADATA_FIELDS") {
            config.optional_metadata_fields = v;
        }
        if let Some(v) = source.parse("ML_MAX_MEMORY_MB")? {
            config.max_memory_mb = v;
        }
        if let Some(v) = source.parse("ML_NORMALIZE_EMBEDDINGS")? {
            config.normalize_embeddings = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.model_name.is_empty() {
            return Err(Error::Configuration("ML_MODEL_NAME cannot be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::Configuration("ML_BATCH_SIZE cannot be zero".into()));
        }
        if self.min_text_length > self.max_text_length {
            return Err(Error::Configuration(
                "ML_MIN_TEXT_LENGTH exceeds ML_MAX_TEXT_LENGTH".into(),
            ));
        }
        if self.max_memory_mb <= 0.0 {
            return Err(Error::Configuration(
                "ML_MAX_MEMORY_MB must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Batch engine configuration (`BATCH_` prefix)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Smallest dispatched sub-batch
    pub min_batch_size: usize,
    /// Largest dispatched sub-batch
    pub max_batch_size: usize,
    /// Performance samples retained for adaptive sizing
    pub window_size: usize,
    /// Bounded retries for store timeouts within one dispatch
    pub timeout_retries: u32,
    /// Store-side batch creation budget in milliseconds
    pub creation_time_ms: u64,
    /// Memory ceiling for one dispatched batch, in MB
    pub max_memory_mb: f64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 50,
            max_batch_size: 500,
            window_size: 10,
            timeout_retries: 3,
            creation_time_ms: 30_000,
            max_memory_mb: 1024.0,
        }
    }
}

impl BatchConfig {
    /// Load from an env source, starting from defaults
    pub fn from_env(source: &EnvSource) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = source.parse("BATCH_MIN_BATCH_SIZE")? {
            config.min_batch_size = v;
        }
        if let Some(v) = source.parse("BATCH_MAX_BATCH_SIZE")? {
            config.max_batch_size = v;
        }
        if let Some(v) = source.parse("BATCH_WINDOW_SIZE")? {
            config.window_size = v;
        }
        if let Some(v) = source.parse("BATCH_TIMEOUT_RETRIES")? {
            config.timeout_retries = v;
        }
        if let Some(v) = source.parse("BATCH_CREATION_TIME_MS")? {
            config.creation_time_ms = v;
        }
        if let Some(v) = source.parse("BATCH_MAX_MEMORY_MB")? {
            config.max_memory_mb = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<()> {
        if self.min_batch_size == 0 {
            return Err(Error::Configuration(
                "BATCH_MIN_BATCH_SIZE cannot be zero".into(),
            ));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(Error::Configuration(
                "BATCH_MIN_BATCH_SIZE exceeds BATCH_MAX_BATCH_SIZE".into(),
            ));
        }
        if self.window_size == 0 {
            return Err(Error::Configuration(
                "BATCH_WINDOW_SIZE cannot be zero".into(),
            ));
        }
        Ok(())
    }
}

/// Model cache configuration (`CACHE_` prefix)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached models
    pub max_entries: usize,
    /// Accesses required before a model is admitted
    pub min_hit_count: u32,
    /// Total admitted memory ceiling in MB
    pub max_memory_mb: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 5,
            min_hit_count: 10,
            max_memory_mb: 8192.0,
        }
    }
}

impl CacheConfig {
    /// Load from an env source, starting from defaults
    pub fn from_env(source: &EnvSource) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = source.parse("CACHE_MAX_ENTRIES")? {
            config.max_entries = v;
        }
        if let Some(v) = source.parse("CACHE_MIN_HIT_COUNT")? {
            config.min_hit_count = v;
        }
        if let Some(v) = source.parse("CACHE_MAX_MEMORY_MB")? {
            config.max_memory_mb = v;
        }
        if config.max_entries == 0 {
            return Err(Error::Configuration(
                "CACHE_MAX_ENTRIES cannot be zero".into(),
            ));
        }
        Ok(config)
    }
}

/// Load a [`RetryPolicy`] from an env source (`RETRY_` prefix)
pub fn retry_policy_from_env(source: &EnvSource) -> Result<RetryPolicy> {
    let mut policy = RetryPolicy::default();
    if let Some(v) = source.parse("RETRY_MAX_RETRIES")? {
        policy.max_retries = v;
    }
    if let Some(v) = source.parse::<u64>("RETRY_INITIAL_DELAY_MS")? {
        policy.initial_delay = Duration::from_millis(v);
    }
    if let Some(v) = source.parse::<u64>("RETRY_MAX_DELAY_MS")? {
        policy.max_delay = Duration::from_millis(v);
    }
    match source.get("RETRY_STRATEGY") {
        None => {}
        Some("linear") => policy.strategy = RetryStrategy::Linear,
        Some("exponential") => policy.strategy = RetryStrategy::Exponential,
        Some("fibonacci") => policy.strategy = RetryStrategy::Fibonacci,
        Some(other) => {
            return Err(Error::Configuration(format!(
                "invalid value {other:?} for RETRY_STRATEGY"
            )));
        }
    }
    if let Some(v) = source.parse::<f64>("RETRY_JITTER")? {
        if !(0.0..=1.0).contains(&v) {
            return Err(Error::Configuration(
                "RETRY_JITTER must be within [0, 1]".into(),
            ));
        }
        policy.jitter = v;
    }
    if let Some(v) = source.parse::<u64>("RETRY_GLOBAL_TIMEOUT_MS")? {
        policy.global_timeout = Some(Duration::from_millis(v));
    }
    Ok(policy)
}
