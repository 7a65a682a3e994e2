//! Configuration models for tekmerion.
//!
//! Every hand-tuned constant of the pipeline (similarity threshold, repair
//! bounds, pool size) is configuration, not a fixed invariant. The user
//! resolves these at runtime via a TOML file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenAI-compatible endpoint (chat completions + embeddings)
    pub endpoint: EndpointConfig,

    /// Which model serves which capability
    #[serde(default)]
    pub models: ModelRoster,

    /// Generation/verification pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Vector index and adaptive retrieval tuning
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// OpenAI-compatible endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// API key (can also be set via the env var named by `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum transport-level retries on failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Specification for a model serving one capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model ID as the endpoint knows it (e.g., "gpt-4o-mini")
    pub id: String,

    /// Maximum tokens per completion
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl ModelSpec {
    fn new(id: &str, temperature: f64) -> Self {
        Self {
            id: id.to_string(),
            max_tokens: default_max_tokens(),
            temperature,
        }
    }
}

fn default_max_tokens() -> u32 {
    3200
}

fn default_temperature() -> f64 {
    0.2
}

/// Which model serves which capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoster {
    /// Passage and choice drafting
    #[serde(default = "default_generator")]
    pub generator: ModelSpec,

    /// Query rewriting, evaluation and refinement
    #[serde(default = "default_rewriter")]
    pub rewriter: ModelSpec,

    /// Evidence verification and choice repair
    #[serde(default = "default_verifier")]
    pub verifier: ModelSpec,

    /// Passage quality scoring
    #[serde(default = "default_quality")]
    pub quality: ModelSpec,

    /// Embedding model id
    #[serde(default = "default_embedding_model")]
    pub embedding: String,
}

fn default_generator() -> ModelSpec {
    ModelSpec::new("gpt-4o", 0.4)
}

fn default_rewriter() -> ModelSpec {
    ModelSpec::new("gpt-4o-mini", 0.1)
}

fn default_verifier() -> ModelSpec {
    ModelSpec::new("gpt-4o-mini", 0.2)
}

fn default_quality() -> ModelSpec {
    ModelSpec::new("gpt-4o-mini", 0.2)
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

impl Default for ModelRoster {
    fn default() -> Self {
        Self {
            generator: default_generator(),
            rewriter: default_rewriter(),
            verifier: default_verifier(),
            quality: default_quality(),
            embedding: default_embedding_model(),
        }
    }
}

/// Generation/verification pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Cosine similarity floor for keeping an evidence sentence
    #[serde(default = "default_sim_threshold")]
    pub sim_threshold: f64,

    /// Maximum evidence sentences kept per choice
    #[serde(default = "default_max_keep")]
    pub max_keep: usize,

    /// Bounded repair rounds per batch
    #[serde(default = "default_max_repair_rounds")]
    pub max_repair_rounds: u32,

    /// Full passage+choice regenerations after rounds are exhausted
    #[serde(default)]
    pub max_regenerate: u32,

    /// Bounded pool for concurrent capability calls within one request
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Default target passage length in characters
    #[serde(default = "default_target_chars")]
    pub target_chars: u32,
}

fn default_sim_threshold() -> f64 {
    0.22
}

fn default_max_keep() -> usize {
    2
}

fn default_max_repair_rounds() -> u32 {
    2
}

fn default_worker_pool_size() -> usize {
    6
}

fn default_target_chars() -> u32 {
    900
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sim_threshold: default_sim_threshold(),
            max_keep: default_max_keep(),
            max_repair_rounds: default_max_repair_rounds(),
            max_regenerate: 0,
            worker_pool_size: default_worker_pool_size(),
            target_chars: default_target_chars(),
        }
    }
}

/// Vector index and adaptive retrieval tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Flat vector file (little-endian f32, row-major, `embed_dim` per row)
    #[serde(default = "default_index_path")]
    pub index_path: PathBuf,

    /// JSONL metadata, one record per vector row
    #[serde(default = "default_metadata_path")]
    pub metadata_path: PathBuf,

    /// Embedding dimension of the index
    #[serde(default = "default_embed_dim")]
    pub embed_dim: usize,

    /// Overall score below which the improved query is preferred
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,

    /// Total queries in the fan-out set (main + variants)
    #[serde(default = "default_multi_query_n")]
    pub multi_query_n: usize,

    /// Add a hypothetical-document expansion query
    #[serde(default = "default_true")]
    pub enable_hyde: bool,

    /// Below threshold: keep the original query only if the improved one is
    /// worse by more than this margin
    #[serde(default = "default_degraded_margin")]
    pub degraded_margin: f64,

    /// Above threshold: switch only if the improved query gains more than this
    #[serde(default = "default_improve_delta")]
    pub improve_delta: f64,

    /// Retrieval candidate cap (after aggregation)
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Candidates passed to the study-pack generator as context
    #[serde(default = "default_context_top_k")]
    pub context_top_k: usize,

    /// Cosine similarity floor for retrieval candidates
    #[serde(default = "default_min_score")]
    pub min_score: f64,
}

fn default_index_path() -> PathBuf {
    PathBuf::from("data/vectors.f32")
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("data/metadata.jsonl")
}

fn default_embed_dim() -> usize {
    1536
}

fn default_pass_threshold() -> f64 {
    0.75
}

fn default_multi_query_n() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_degraded_margin() -> f64 {
    0.05
}

fn default_improve_delta() -> f64 {
    0.02
}

fn default_top_k() -> usize {
    8
}

fn default_context_top_k() -> usize {
    5
}

fn default_min_score() -> f64 {
    0.22
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            metadata_path: default_metadata_path(),
            embed_dim: default_embed_dim(),
            pass_threshold: default_pass_threshold(),
            multi_query_n: default_multi_query_n(),
            enable_hyde: true,
            degraded_margin: default_degraded_margin(),
            improve_delta: default_improve_delta(),
            top_k: default_top_k(),
            context_top_k: default_context_top_k(),
            min_score: default_min_score(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Resolve the API key from config or environment.
    ///
    /// Missing credentials are the only fatal startup-scope failure.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = &self.endpoint.api_key {
            if !key.is_empty() {
                return Ok(key.clone());
            }
        }

        std::env::var(&self.endpoint.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            env_var: self.endpoint.api_key_env.clone(),
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Missing API key: set {env_var} env var or endpoint.api_key in config")]
    MissingApiKey { env_var: String },

    #[error("Vector index dimension {index_dim} does not match configured embed_dim {embed_dim}")]
    DimensionMismatch { index_dim: usize, embed_dim: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_config_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[endpoint]
base_url = "http://localhost:11434/v1"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.endpoint.timeout_secs, 180);
        assert_eq!(config.pipeline.sim_threshold, 0.22);
        assert_eq!(config.pipeline.max_repair_rounds, 2);
        assert_eq!(config.pipeline.max_regenerate, 0);
        assert_eq!(config.pipeline.worker_pool_size, 6);
        assert_eq!(config.retrieval.multi_query_n, 3);
        assert!(config.retrieval.enable_hyde);
        assert_eq!(config.models.embedding, "text-embedding-3-small");
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[endpoint]
base_url = "http://localhost:11434/v1"

[pipeline]
sim_threshold = 0.3
max_regenerate = 1
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.pipeline.sim_threshold, 0.3);
        assert_eq!(config.pipeline.max_regenerate, 1);
        assert_eq!(config.pipeline.max_keep, 2);
    }

    #[test]
    fn test_api_key_from_config_wins() {
        let config = Config {
            endpoint: EndpointConfig {
                api_key: Some("sk-test".to_string()),
                ..Default::default()
            },
            models: ModelRoster::default(),
            pipeline: PipelineConfig::default(),
            retrieval: RetrievalConfig::default(),
        };
        assert_eq!(config.resolve_api_key().unwrap(), "sk-test");
    }
}
