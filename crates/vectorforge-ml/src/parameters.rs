//! Model parameter sets loaded from configuration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use vectorforge_core::config::MlConfig;
use vectorforge_core::resources::Device;
use vectorforge_core::validation::ValidationParams;

/// Parameters for the text-processing model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextParameters {
    /// Model identifier understood by the loader
    pub model_name: String,
    /// Preferred processing batch size
    pub batch_size: usize,
    /// Minimum content length
    pub min_text_length: usize,
    /// Maximum content length
    pub max_text_length: usize,
    /// Minimum word count
    pub min_words: usize,
    /// Required metadata keys
    pub required_metadata_fields: HashSet<String>,
    /// Allowed optional metadata keys
    pub optional_metadata_fields: HashSet<String>,
    /// Memory ceiling in MB
    pub max_memory_mb: f64,
}

/// Parameters for the embedding model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingParameters {
    /// Model identifier understood by the loader
    pub model_name: String,
    /// Preferred encoding batch size
    pub batch_size: usize,
    /// Target compute device
    pub device: Device,
    /// Minimum content length
    pub min_text_length: usize,
    /// Maximum content length
    pub max_text_length: usize,
    /// Minimum word count
    pub min_words: usize,
    /// Required metadata keys
    pub required_metadata_fields: HashSet<String>,
    /// Allowed optional metadata keys
    pub optional_metadata_fields: HashSet<String>,
    /// Memory ceiling in MB
    pub max_memory_mb: f64,
    /// Whether vectors are L2-normalized, in single and batch form alike
    pub normalize: bool,
}

/// Loaded parameter set, tagged by service flavor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flavor", rename_all = "snake_case")]
pub enum ModelParameters {
    /// Text-processing service
    Text(TextParameters),
    /// Embedding service
    Embedding(EmbeddingParameters),
}

impl ModelParameters {
    /// Build parameters of the given flavor from process configuration
    #[must_use]
    pub fn from_config(config: &MlConfig, flavor: ServiceFlavor) -> Self {
        match flavor {
            ServiceFlavor::Text => Self::Text(TextParameters {
                model_name: config.model_name.clone(),
                batch_size: config.batch_size,
                min_text_length: config.min_text_length,
                max_text_length: config.max_text_length,
                min_words: config.min_words,
                required_metadata_fields: config.required_metadata_fields.clone(),
                optional_metadata_fields: config.optional_metadata_fields.clone(),
                max_memory_mb: config.max_memory_mb,
            }),
            ServiceFlavor::Embedding => Self::Embedding(EmbeddingParameters {
                model_name: config.model_name.clone(),
                batch_size: config.batch_size,
                device: config.device,
                min_text_length: config.min_text_length,
                max_text_length: config.max_text_length,
                min_words: config.min_words,
                required_metadata_fields: config.required_metadata_fields.clone(),
                optional_metadata_fields: config.optional_metadata_fields.clone(),
                max_memory_mb: config.max_memory_mb,
                normalize: config.normalize_embeddings,
            }),
        }
    }

    /// Validation bounds derived from the parameter set
    #[must_use]
    pub fn validation_params(&self) -> ValidationParams {
        match self {
            Self::Text(p) => ValidationParams {
                min_text_length: p.min_text_length,
                max_text_length: p.max_text_length,
                min_words: p.min_words,
                required_metadata_fields: p.required_metadata_fields.clone(),
                optional_metadata_fields: p.optional_metadata_fields.clone(),
            },
            Self::Embedding(p) => ValidationParams {
                min_text_length: p.min_text_length,
                max_text_length: p.max_text_length,
                min_words: p.min_words,
                required_metadata_fields: p.required_metadata_fields.clone(),
                optional_metadata_fields: p.optional_metadata_fields.clone(),
            },
        }
    }

    /// The configured model name
    #[must_use]
    pub fn model_name(&self) -> &str {
        match self {
            Self::Text(p) => &p.model_name,
            Self::Embedding(p) => &p.model_name,
        }
    }

    /// The configured batch size
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        match self {
            Self::Text(p) => p.batch_size,
            Self::Embedding(p) => p.batch_size,
        }
    }
}

/// Which kind of service a parameter set drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceFlavor {
    /// Annotation pipeline
    Text,
    /// Embedding pipeline
    Embedding,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_snapshot_config() {
        let mut config = MlConfig::default();
        config.model_name = "mpnet".into();
        config.normalize_embeddings = false;

        let params = ModelParameters::from_config(&config, ServiceFlavor::Embedding);
        assert_eq!(params.model_name(), "mpnet");
        match &params {
            ModelParameters::Embedding(p) => assert!(!p.normalize),
            ModelParameters::Text(_) => panic!("expected embedding parameters"),
        }

        // Identical config yields an equal snapshot
        let again = ModelParameters::from_config(&config, ServiceFlavor::Embedding);
        assert_eq!(params, again);
    }

    #[test]
    fn validation_params_carry_bounds() {
        let mut config = MlConfig::default();
        config.min_text_length = 7;
        config.required_metadata_fields.insert("source".into());
        let params = ModelParameters::from_config(&config, ServiceFlavor::Text);
        let vp = params.validation_params();
        assert_eq!(vp.min_text_length, 7);
        assert!(vp.required_metadata_fields.contains("source"));
    }
}
