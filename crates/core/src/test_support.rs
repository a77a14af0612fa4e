use crate::chunking::make_chunk_id;
use crate::embeddings::{CharacterNgramEmbedder, EmbeddingService};
use crate::error::ServiceError;
use crate::models::{Chunk, Document, DocumentFlags, FileType, LifecycleState, SearchIndexEntry, FacetQuery};
use crate::stores::content_hash;
use crate::traits::{FacetIndex, FacetSearchResult};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) fn document(document_id: &str, state: LifecycleState) -> Document {
    Document {
        document_id: document_id.to_string(),
        filename: format!("{document_id}.txt"),
        content_hash: content_hash(document_id.as_bytes()),
        byte_size: 100,
        file_type: FileType::Text,
        uploader_id: "alice".to_string(),
        uploaded_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp"),
        state,
        visible: false,
        generation: 1,
        object_locator: None,
        page_count: 1,
        metadata: Default::default(),
        tags: Default::default(),
        flags: DocumentFlags::default(),
    }
}

/// Four-dimensional embeddings, all pointing roughly along the first axis.
pub(crate) fn chunks(document_id: &str, generation: u32, count: u32) -> Vec<Chunk> {
    (0..count)
        .map(|index| {
            let text = format!("{document_id} generation {generation} chunk {index}");
            let chunk_id = make_chunk_id(document_id, generation, index, &text);
            Chunk {
                chunk_id: chunk_id.clone(),
                document_id: document_id.to_string(),
                generation,
                chunk_index: index,
                token_count: text.split_whitespace().count(),
                text,
                page_start: 1,
                page_end: 1,
                embedding_ref: chunk_id,
                embedding: vec![1.0, index as f32 * 0.1, 0.0, 0.0],
            }
        })
        .collect()
}

/// `count` distinct whitespace-separated words.
pub(crate) fn words(count: usize) -> String {
    (0..count)
        .map(|index| format!("w{index}"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub(crate) struct FailingFacetIndex;

#[async_trait]
impl FacetIndex for FailingFacetIndex {
    async fn upsert(&self, _entry: &SearchIndexEntry) -> Result<(), ServiceError> {
        Err(ServiceError::Timeout("facet index".to_string()))
    }

    async fn delete(&self, _document_id: &str) -> Result<(), ServiceError> {
        Err(ServiceError::Timeout("facet index".to_string()))
    }

    async fn search(&self, _query: &FacetQuery) -> Result<FacetSearchResult, ServiceError> {
        Err(ServiceError::Timeout("facet index".to_string()))
    }
}

/// Wraps the offline embedder with an outage switch.
pub(crate) struct SwitchableEmbedder {
    inner: CharacterNgramEmbedder,
    pub(crate) failing: AtomicBool,
}

impl SwitchableEmbedder {
    pub(crate) fn new(inner: CharacterNgramEmbedder) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EmbeddingService for SwitchableEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ServiceError::BackendResponse {
                backend: "embedding".to_string(),
                details: "503 service unavailable".to_string(),
            });
        }
        self.inner.embed(texts).await
    }
}
