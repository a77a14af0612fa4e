use crate::error::ServiceError;
use crate::models::{
    FacetCount, FacetFilters, FacetQuery, Facets, SearchHit, SearchIndexEntry, SortField, SortOrder,
};
use crate::traits::{FacetIndex, FacetSearchResult};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

pub struct OpenSearchStore {
    client: Arc<Client>,
    endpoint: String,
    index_name: String,
}

async fn check(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ServiceError::RateLimited("opensearch".to_string()));
    }
    if status.is_server_error() {
        return Err(ServiceError::BackendResponse {
            backend: "opensearch".to_string(),
            details: status.to_string(),
        });
    }
    Err(ServiceError::Rejected {
        backend: "opensearch".to_string(),
        details: response.text().await.unwrap_or_else(|_| status.to_string()),
    })
}

impl OpenSearchStore {
    pub fn new(endpoint: impl Into<String>, index_name: impl Into<String>) -> Self {
        Self {
            client: Arc::new(Client::new()),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index_name: index_name.into(),
        }
    }

    pub async fn ensure_index(&self) -> Result<(), ServiceError> {
        let response = self
            .client
            .head(format!("{}/{}", self.endpoint, self.index_name))
            .send()
            .await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(ServiceError::BackendResponse {
                backend: "opensearch".to_string(),
                details: response.status().to_string(),
            });
        }

        check(
            self.client
                .put(format!("{}/{}", self.endpoint, self.index_name))
                .json(&json!({
                    "settings": {
                        "number_of_shards": 1,
                        "number_of_replicas": 0,
                        "analysis": {
                            "analyzer": {
                                "standard_english": {
                                    "type": "standard",
                                    "stopwords": "_english_"
                                }
                            }
                        }
                    },
                    "mappings": {
                        "properties": {
                            "document_id": {"type": "keyword"},
                            "filename": {
                                "type": "text",
                                "analyzer": "standard_english",
                                "fields": {"keyword": {"type": "keyword"}}
                            },
                            "content": {"type": "text", "analyzer": "standard_english"},
                            "file_type": {"type": "keyword"},
                            "uploader_id": {"type": "keyword"},
                            "uploaded_at": {"type": "date"},
                            "file_size": {"type": "long"},
                            "status": {"type": "keyword"},
                            "tags": {"type": "keyword"},
                            "metadata": {"type": "object", "dynamic": true}
                        }
                    }
                }))
                .send()
                .await?,
        )
        .await?;

        info!(index = %self.index_name, "created opensearch index");
        Ok(())
    }
}

fn build_filters(filters: &FacetFilters) -> Vec<Value> {
    let mut predicates = Vec::new();

    if let Some(file_type) = filters.file_type {
        predicates.push(json!({"term": {"file_type": file_type.as_str()}}));
    }
    if let Some(uploader) = &filters.uploader_id {
        predicates.push(json!({"term": {"uploader_id": uploader}}));
    }
    if !filters.tags.is_empty() {
        predicates.push(json!({"terms": {"tags": filters.tags}}));
    }
    if filters.uploaded_from.is_some() || filters.uploaded_to.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(from) = filters.uploaded_from {
            range.insert("gte".to_string(), json!(from.to_rfc3339()));
        }
        if let Some(to) = filters.uploaded_to {
            range.insert("lte".to_string(), json!(to.to_rfc3339()));
        }
        predicates.push(json!({"range": {"uploaded_at": range}}));
    }
    if filters.min_file_size.is_some() || filters.max_file_size.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(min) = filters.min_file_size {
            range.insert("gte".to_string(), json!(min));
        }
        if let Some(max) = filters.max_file_size {
            range.insert("lte".to_string(), json!(max));
        }
        predicates.push(json!({"range": {"file_size": range}}));
    }
    for (key, value) in &filters.metadata {
        predicates.push(json!({"term": {format!("metadata.{key}"): value}}));
    }

    predicates
}

fn build_sort(field: SortField, order: SortOrder) -> Value {
    let direction = match order {
        SortOrder::Asc => "asc",
        SortOrder::Desc => "desc",
    };
    let field = match field {
        SortField::Relevance => "_score",
        SortField::UploadedAt => "uploaded_at",
        SortField::Filename => "filename.keyword",
        SortField::FileSize => "file_size",
    };
    json!([{ field: {"order": direction} }, {"document_id": {"order": "asc"}}])
}

pub(crate) fn build_search_body(query: &FacetQuery) -> Value {
    let mut filters = build_filters(&query.filters);
    if let Some(status) = query.status {
        filters.push(json!({"term": {"status": status.as_str()}}));
    }

    let must = if query.text.trim().is_empty() {
        json!([{"match_all": {}}])
    } else {
        json!([{
            "multi_match": {
                "query": query.text,
                "fields": ["filename^2", "content", "tags"],
                "fuzziness": "AUTO"
            }
        }])
    };

    json!({
        "from": query.page.saturating_sub(1).saturating_mul(query.size),
        "size": query.size,
        "track_total_hits": true,
        "query": {
            "bool": {
                "must": must,
                "filter": filters
            }
        },
        "sort": build_sort(query.sort.field, query.sort.order),
        "_source": {"excludes": ["content"]},
        "aggs": {
            "file_types": {"terms": {"field": "file_type"}},
            "uploaders": {"terms": {"field": "uploader_id"}},
            "statuses": {"terms": {"field": "status"}},
            "tags": {"terms": {"field": "tags", "size": 50}},
            "upload_months": {
                "date_histogram": {
                    "field": "uploaded_at",
                    "calendar_interval": "month",
                    "format": "yyyy-MM",
                    "min_doc_count": 1
                }
            }
        }
    })
}

fn parse_buckets(response: &Value, name: &str) -> Vec<FacetCount> {
    response
        .pointer(&format!("/aggregations/{name}/buckets"))
        .and_then(Value::as_array)
        .map(|buckets| {
            buckets
                .iter()
                .filter_map(|bucket| {
                    let key = bucket
                        .get("key_as_string")
                        .and_then(Value::as_str)
                        .or_else(|| bucket.get("key").and_then(Value::as_str))?;
                    let count = bucket.get("doc_count").and_then(Value::as_u64)?;
                    Some(FacetCount {
                        key: key.to_string(),
                        count,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn parse_search_response(response: &Value) -> Result<FacetSearchResult, ServiceError> {
    let raw_hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut hits = Vec::with_capacity(raw_hits.len());
    for raw in raw_hits {
        let mut source = raw.get("_source").cloned().unwrap_or(Value::Null);
        if let Some(object) = source.as_object_mut() {
            object.entry("content").or_insert_with(|| json!(""));
        }
        let entry: SearchIndexEntry = serde_json::from_value(source)?;
        let score = raw.get("_score").and_then(Value::as_f64).unwrap_or(0.0);

        hits.push(SearchHit {
            document_id: entry.document_id,
            filename: entry.filename,
            file_type: entry.file_type,
            uploader_id: entry.uploader_id,
            uploaded_at: entry.uploaded_at,
            file_size: entry.file_size,
            status: entry.status,
            tags: entry.tags,
            score,
        });
    }

    let total = response
        .pointer("/hits/total/value")
        .and_then(Value::as_u64)
        .unwrap_or(hits.len() as u64);

    Ok(FacetSearchResult {
        hits,
        total,
        facets: Facets {
            file_types: parse_buckets(response, "file_types"),
            uploaders: parse_buckets(response, "uploaders"),
            statuses: parse_buckets(response, "statuses"),
            tags: parse_buckets(response, "tags"),
            upload_months: parse_buckets(response, "upload_months"),
        },
    })
}

#[async_trait]
impl FacetIndex for OpenSearchStore {
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), ServiceError> {
        check(
            self.client
                .put(format!(
                    "{}/{}/_doc/{}?refresh=wait_for",
                    self.endpoint, self.index_name, entry.document_id
                ))
                .json(entry)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<(), ServiceError> {
        let response = self
            .client
            .delete(format!(
                "{}/{}/_doc/{}?refresh=wait_for",
                self.endpoint, self.index_name, document_id
            ))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).await?;
        Ok(())
    }

    async fn search(&self, query: &FacetQuery) -> Result<FacetSearchResult, ServiceError> {
        let response = check(
            self.client
                .post(format!("{}/{}/_search", self.endpoint, self.index_name))
                .json(&build_search_body(query))
                .send()
                .await?,
        )
        .await?;

        let response_json: Value = response.json().await?;
        parse_search_response(&response_json)
    }
}
