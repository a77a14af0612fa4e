//! TOML configuration. Every section and field is optional; missing values
//! take the defaults of the owning component.

use crate::assembler::AssemblerConfig;
use crate::chunking::ChunkingConfig;
use crate::embeddings::EmbeddingConfig;
use crate::error::ConfigError;
use crate::ingest::IngestionConfig;
use crate::orchestrator::RetrievalConfig;
use crate::retry::RetryPolicy;
use crate::search_cache::SearchCacheConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub retry: RetryPolicy,
}

/// One remote model endpoint. The API key is read from the named
/// environment variable, never from the file itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub endpoint: String,
    pub model: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
}

impl ServiceEndpoint {
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.is_empty())
    }
}

/// Absent endpoints fall back to the offline implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServicesConfig {
    pub embedding: Option<ServiceEndpoint>,
    pub rerank: Option<ServiceEndpoint>,
    pub generation: Option<ServiceEndpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub assembler: AssemblerConfig,
    pub ingestion: IngestionConfig,
    pub sync: SyncConfig,
    pub search_cache: SearchCacheConfig,
    pub services: ServicesConfig,
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.target_tokens == 0 {
            return Err(invalid("chunking.target_tokens must be positive"));
        }
        if !(0.0..1.0).contains(&self.chunking.overlap_ratio) {
            return Err(invalid("chunking.overlap_ratio must be in [0, 1)"));
        }
        if self.embedding.batch_size == 0 || self.embedding.max_concurrency == 0 {
            return Err(invalid("embedding.batch_size and embedding.max_concurrency must be positive"));
        }

        let retrieval = &self.retrieval;
        if retrieval.top_k == 0 {
            return Err(invalid("retrieval.top_k must be positive"));
        }
        if retrieval.top_m < retrieval.top_k {
            return Err(invalid("retrieval.top_m must be at least retrieval.top_k"));
        }
        if retrieval.broaden_factor == 0 {
            return Err(invalid("retrieval.broaden_factor must be positive"));
        }
        if retrieval.rerank_concurrency == 0 {
            return Err(invalid("retrieval.rerank_concurrency must be positive"));
        }
        if !retrieval.confidence_threshold.is_finite() {
            return Err(invalid("retrieval.confidence_threshold must be finite"));
        }

        if self.assembler.token_budget == 0 {
            return Err(invalid("assembler.token_budget must be positive"));
        }
        if self.ingestion.max_document_bytes == 0 {
            return Err(invalid("ingestion.max_document_bytes must be positive"));
        }
        if self.ingestion.allowed_file_types.is_empty() {
            return Err(invalid("ingestion.allowed_file_types must not be empty"));
        }

        for (name, policy) in [
            ("embedding.retry", &self.embedding.retry),
            ("sync.retry", &self.sync.retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(invalid(format!("{name}.max_attempts must be positive")));
            }
        }

        for (name, endpoint) in [
            ("services.embedding", &self.services.embedding),
            ("services.rerank", &self.services.rerank),
            ("services.generation", &self.services.generation),
        ] {
            if let Some(endpoint) = endpoint {
                url::Url::parse(&endpoint.endpoint)
                    .map_err(|error| invalid(format!("{name}.endpoint: {error}")))?;
            }
        }
        if let Some(embedding) = &self.services.embedding {
            if !matches!(embedding.dimensions, Some(dimensions) if dimensions > 0) {
                return Err(invalid("services.embedding.dimensions must be set and positive"));
            }
        }

        Ok(())
    }
}

pub fn parse_config(source: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = toml::from_str(source)?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let source = std::fs::read_to_string(path)?;
    parse_config(&source)
}
