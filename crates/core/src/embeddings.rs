use crate::error::ServiceError;
use crate::retry::{with_backoff, Exhausted, RetryPolicy};
use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

/// External embedding model: texts in, fixed-length vectors out.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimensions(&self) -> usize;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

/// Hashed character-trigram vectors. Deterministic and offline, used by the
/// local backend and by tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingService for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// OpenAI-compatible `/embeddings` endpoint.
pub struct HttpEmbeddingService {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbeddingService {
    pub fn new(
        endpoint: &str,
        model: impl Into<String>,
        api_key: Option<String>,
        dimensions: usize,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            api_key,
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "input": texts,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::RateLimited("embedding service".to_string()));
        }
        if status.is_server_error() {
            return Err(ServiceError::BackendResponse {
                backend: "embedding service".to_string(),
                details: status.to_string(),
            });
        }
        if !status.is_success() {
            return Err(ServiceError::Rejected {
                backend: "embedding service".to_string(),
                details: response.text().await.unwrap_or_else(|_| status.to_string()),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|item| item.index);
        Ok(parsed.data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
    /// Embedding calls in flight across all ingestions and queries.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Batches texts, bounds concurrency with a shared semaphore, and retries
/// transient failures with backoff. Callers past the pool's capacity queue.
#[derive(Clone)]
pub struct EmbedderClient {
    service: Arc<dyn EmbeddingService>,
    permits: Arc<Semaphore>,
    config: EmbeddingConfig,
}

impl EmbedderClient {
    pub fn new(service: Arc<dyn EmbeddingService>, config: EmbeddingConfig) -> Self {
        Self {
            service,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            config,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.service.dimensions()
    }

    /// Embeds every text or fails as a whole; partial results are never returned.
    pub async fn embed_all(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Exhausted<ServiceError>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches = texts
            .chunks(self.config.batch_size.max(1))
            .map(|batch| self.embed_batch(batch));
        let embedded = try_join_all(batches).await?;

        debug!(texts = texts.len(), "embedded batch set");
        Ok(embedded.into_iter().flatten().collect())
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, Exhausted<ServiceError>> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_batch(&texts).await?;
        vectors.pop().ok_or_else(|| Exhausted {
            attempts: 1,
            last_error: ServiceError::BackendResponse {
                backend: "embedding service".to_string(),
                details: "no vector returned for query".to_string(),
            },
        })
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, Exhausted<ServiceError>> {
        let client = self;
        with_backoff(
            self.config.retry,
            "embed",
            move || async move {
                let _permit = client
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| ServiceError::Request("embedding pool closed".to_string()))?;
                let vectors = client.service.embed(batch).await?;
                client.check_shape(batch.len(), &vectors)?;
                Ok::<_, ServiceError>(vectors)
            },
            ServiceError::is_retryable,
        )
        .await
    }

    fn check_shape(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<(), ServiceError> {
        if vectors.len() != expected {
            return Err(ServiceError::BackendResponse {
                backend: "embedding service".to_string(),
                details: format!("returned {} vectors for {} texts", vectors.len(), expected),
            });
        }
        let dimensions = self.service.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(ServiceError::Request(format!(
                "embedding dimension {} != {}",
                bad.len(),
                dimensions
            )));
        }
        Ok(())
    }
}
