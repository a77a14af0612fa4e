use crate::error::{ServiceError, StoreError};
use crate::locks::DocumentLease;
use crate::models::{
    Chunk, Document, DocumentFlags, DocumentListQuery, DocumentPage, FacetQuery, Facets,
    LifecycleState, SearchHit, SearchIndexEntry,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One chunk vector as projected into the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorIndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    pub vector: Vec<f32>,
    /// Lifecycle state of the owning document when the entry was written.
    pub state: LifecycleState,
    pub chunk_index: u32,
    pub generation: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VectorFilter {
    pub state: Option<LifecycleState>,
    /// Restricts hits to these documents when non-empty.
    pub document_ids: Vec<String>,
}

impl VectorFilter {
    pub fn active() -> Self {
        Self {
            state: Some(LifecycleState::Active),
            document_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FacetSearchResult {
    pub hits: Vec<SearchHit>,
    pub total: u64,
    pub facets: Facets,
}

/// Upserts and deletes are keyed by chunk id, so replaying them is harmless.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, entries: &[VectorIndexEntry]) -> Result<(), ServiceError>;

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), ServiceError>;

    async fn delete_document(&self, document_id: &str) -> Result<(), ServiceError>;

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        top_m: usize,
    ) -> Result<Vec<VectorHit>, ServiceError>;
}

#[async_trait]
pub trait FacetIndex: Send + Sync {
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), ServiceError>;

    async fn delete(&self, document_id: &str) -> Result<(), ServiceError>;

    async fn search(&self, query: &FacetQuery) -> Result<FacetSearchResult, ServiceError>;
}

/// Source of truth for documents and chunks.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Advisory lock, held until the lease is dropped.
    async fn lock_document(&self, key: &str) -> DocumentLease;

    /// Latest non-rejected document with these bytes from this uploader.
    async fn find_by_content_hash(
        &self,
        uploader_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError>;

    async fn list_documents(&self, query: &DocumentListQuery) -> Result<DocumentPage, StoreError>;

    async fn document_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError>;

    /// Writes the document record and swaps in `chunks` as its only chunk
    /// set in one transaction. Returns the ids of the chunks replaced.
    async fn commit_generation(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, StoreError>;

    async fn update_state(
        &self,
        document_id: &str,
        state: LifecycleState,
        visible: bool,
    ) -> Result<(), StoreError>;

    async fn set_visible(&self, document_id: &str, visible: bool) -> Result<(), StoreError>;

    async fn update_flags(&self, document_id: &str, flags: &DocumentFlags) -> Result<(), StoreError>;

    /// Current generation, ordered by chunk index.
    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError>;

    /// Chunks of the current generation among `chunk_ids`; stale ids are skipped.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, StoreError>;

    /// Removes the document and its chunks. `false` when it did not exist.
    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError>;
}

/// Raw upload bytes, addressed by an opaque locator.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String, StoreError>;

    async fn get(&self, locator: &str) -> Result<Vec<u8>, StoreError>;
}
