use crate::error::ServiceError;
use crate::traits::{VectorFilter, VectorHit, VectorIndex, VectorIndexEntry};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use tracing::info;

pub struct QdrantStore {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ServiceError::RateLimited("qdrant".to_string()));
    }
    if status.is_server_error() {
        return Err(ServiceError::BackendResponse {
            backend: "qdrant".to_string(),
            details: status.to_string(),
        });
    }
    Err(ServiceError::Rejected {
        backend: "qdrant".to_string(),
        details: response.text().await.unwrap_or_else(|_| status.to_string()),
    })
}

fn build_filter(filter: &VectorFilter) -> Value {
    let mut must = Vec::new();
    if let Some(state) = filter.state {
        must.push(json!({"key": "state", "match": {"value": state.as_str()}}));
    }
    if !filter.document_ids.is_empty() {
        must.push(json!({"key": "document_id", "match": {"any": filter.document_ids}}));
    }
    json!({ "must": must })
}

impl QdrantStore {
    pub fn new(endpoint: impl Into<String>, collection: impl Into<String>, vector_size: usize) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/collections/{}", self.endpoint, self.collection)
    }

    /// Creates the collection with cosine distance unless it already exists.
    pub async fn ensure_collection(&self) -> Result<(), ServiceError> {
        let response = self.client.get(self.collection_url()).send().await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status() != StatusCode::NOT_FOUND {
            check(response).await?;
            return Ok(());
        }

        check(
            self.client
                .put(self.collection_url())
                .json(&json!({
                    "vectors": {
                        "size": self.vector_size,
                        "distance": "Cosine"
                    }
                }))
                .send()
                .await?,
        )
        .await?;
        info!(collection = %self.collection, size = self.vector_size, "created qdrant collection");
        Ok(())
    }

    async fn delete_points(&self, selector: Value) -> Result<(), ServiceError> {
        check(
            self.client
                .post(format!("{}/points/delete?wait=true", self.collection_url()))
                .json(&selector)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantStore {
    async fn upsert(&self, entries: &[VectorIndexEntry]) -> Result<(), ServiceError> {
        let points = entries
            .iter()
            .map(|entry| {
                if entry.vector.len() != self.vector_size {
                    return Err(ServiceError::Request(format!(
                        "embedding dimension {} != {}",
                        entry.vector.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": entry.chunk_id,
                    "vector": entry.vector,
                    "payload": {
                        "document_id": entry.document_id,
                        "state": entry.state.as_str(),
                        "chunk_index": entry.chunk_index,
                        "generation": entry.generation,
                    },
                }))
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        check(
            self.client
                .put(format!("{}/points?wait=true", self.collection_url()))
                .json(&json!({ "points": points }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), ServiceError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        self.delete_points(json!({ "points": chunk_ids })).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), ServiceError> {
        self.delete_points(json!({
            "filter": {
                "must": [{"key": "document_id", "match": {"value": document_id}}]
            }
        }))
        .await
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        top_m: usize,
    ) -> Result<Vec<VectorHit>, ServiceError> {
        if vector.len() != self.vector_size {
            return Err(ServiceError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }

        let response = check(
            self.client
                .post(format!("{}/points/search", self.collection_url()))
                .json(&json!({
                    "vector": vector,
                    "limit": top_m,
                    "with_payload": true,
                    "filter": build_filter(filter),
                }))
                .send()
                .await?,
        )
        .await?;

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut result = Vec::with_capacity(hits.len());
        for hit in hits {
            let chunk_id = match hit.pointer("/id") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => continue,
            };
            let document_id = hit
                .pointer("/payload/document_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0) as f32;

            result.push(VectorHit {
                chunk_id,
                document_id,
                score,
            });
        }

        Ok(result)
    }
}
