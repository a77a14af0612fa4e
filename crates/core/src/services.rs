use crate::error::ServiceError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeSet;
use url::Url;

/// Cross-encoder style scorer: one relevance score per text, in input order.
#[async_trait]
pub trait RerankService: Send + Sync {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError>;
}

#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError>;
}

async fn check_status(backend: &str, response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ServiceError::RateLimited(backend.to_string()));
    }
    if status.is_server_error() {
        return Err(ServiceError::BackendResponse {
            backend: backend.to_string(),
            details: status.to_string(),
        });
    }
    Err(ServiceError::Rejected {
        backend: backend.to_string(),
        details: response.text().await.unwrap_or_else(|_| status.to_string()),
    })
}

/// Cohere-compatible `/rerank` endpoint.
pub struct HttpRerankService {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl HttpRerankService {
    pub fn new(endpoint: &str, model: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl RerankService for HttpRerankService {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "query": query,
            "documents": texts,
            "top_n": texts.len(),
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = check_status("rerank service", request.send().await?).await?;
        let parsed: RerankResponse = response.json().await?;

        let mut scores = vec![None; texts.len()];
        for result in parsed.results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = Some(result.relevance_score);
            }
        }
        scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| {
                score.ok_or_else(|| ServiceError::BackendResponse {
                    backend: "rerank service".to_string(),
                    details: format!("no score for candidate {index}"),
                })
            })
            .collect()
    }
}

/// Offline scorer: fraction of distinct query terms present in the text.
#[derive(Debug, Default, Clone, Copy)]
pub struct LexicalReranker;

fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

#[async_trait]
impl RerankService for LexicalReranker {
    async fn score(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
        let wanted = terms(query);
        if wanted.is_empty() {
            return Ok(vec![0.0; texts.len()]);
        }

        Ok(texts
            .iter()
            .map(|text| {
                let present = terms(text);
                let hits = wanted.iter().filter(|term| present.contains(*term)).count();
                hits as f32 / wanted.len() as f32
            })
            .collect())
    }
}

/// Ollama-compatible `/api/generate` endpoint, non-streaming.
pub struct HttpGenerationService {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

impl HttpGenerationService {
    pub fn new(endpoint: &str, model: impl Into<String>, api_key: Option<String>) -> Result<Self, ServiceError> {
        Ok(Self {
            client: Client::new(),
            endpoint: Url::parse(endpoint)?,
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl GenerationService for HttpGenerationService {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        }));
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = check_status("generation service", request.send().await?).await?;
        let parsed: GenerateResponse = response.json().await?;
        Ok(parsed.response.trim().to_string())
    }
}

pub fn expansion_prompt(query: &str, variants: usize) -> String {
    format!(
        "Rewrite the search query below as {variants} alternative phrasings that could match \
relevant passages. Return one phrasing per line with no numbering.\n\nQuery: {query}"
    )
}

/// One variant per line. List markers, blanks and repeats of the original
/// query are dropped.
pub fn parse_variants(query: &str, generated: &str, limit: usize) -> Vec<String> {
    let mut seen = BTreeSet::new();
    seen.insert(query.trim().to_lowercase());

    generated
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | ')' | '-' | '*'))
                .trim()
                .trim_matches('"')
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .filter(|line| seen.insert(line.to_lowercase()))
        .take(limit)
        .collect()
}
