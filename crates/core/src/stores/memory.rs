//! In-process stores.
//!
//! The metadata store backs tests; the two indices also back the local CLI,
//! which rebuilds them from the SQLite metadata store on every start.

use crate::error::{ServiceError, StoreError};
use crate::locks::{DocumentLease, DocumentLocks};
use crate::models::{
    Chunk, Document, DocumentFlags, DocumentListQuery, DocumentPage, FacetCount, FacetQuery,
    Facets, LifecycleState, SearchHit, SearchIndexEntry, SortField, SortOrder,
};
use crate::traits::{
    FacetIndex, FacetSearchResult, MetadataStore, VectorFilter, VectorHit, VectorIndex,
    VectorIndexEntry,
};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct MetadataTables {
    documents: HashMap<String, Document>,
    /// Current generation per document, ordered by chunk index.
    chunks: HashMap<String, Vec<Chunk>>,
}

#[derive(Default)]
pub struct InMemoryMetadataStore {
    tables: RwLock<MetadataTables>,
    locks: DocumentLocks,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(document_id: &str) -> StoreError {
    StoreError::NotFound(format!("document {document_id}"))
}

/// Newest first, then by id so pages are stable.
pub(crate) fn list_order(left: &Document, right: &Document) -> Ordering {
    right
        .uploaded_at
        .cmp(&left.uploaded_at)
        .then_with(|| left.document_id.cmp(&right.document_id))
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn lock_document(&self, key: &str) -> DocumentLease {
        self.locks.acquire(key).await
    }

    async fn find_by_content_hash(
        &self,
        uploader_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>, StoreError> {
        let tables = self.tables.read().await;
        Ok(tables
            .documents
            .values()
            .filter(|doc| {
                doc.uploader_id == uploader_id
                    && doc.content_hash == content_hash
                    && doc.state != LifecycleState::Rejected
            })
            .max_by_key(|doc| doc.uploaded_at)
            .cloned())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.tables.read().await.documents.get(document_id).cloned())
    }

    async fn list_documents(&self, query: &DocumentListQuery) -> Result<DocumentPage, StoreError> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&Document> = tables
            .documents
            .values()
            .filter(|doc| query.status.map_or(true, |status| doc.state == status))
            .filter(|doc| {
                query
                    .uploader_id
                    .as_deref()
                    .map_or(true, |uploader| doc.uploader_id == uploader)
            })
            .collect();
        matching.sort_by(|left, right| list_order(left, right));

        let total = matching.len() as u64;
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let documents = matching
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(DocumentPage { documents, total })
    }

    async fn document_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.tables.read().await.documents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .documents
            .insert(document.document_id.clone(), document.clone());
        Ok(())
    }

    async fn commit_generation(
        &self,
        document: &Document,
        chunks: &[Chunk],
    ) -> Result<Vec<String>, StoreError> {
        let mut tables = self.tables.write().await;
        let mut ordered = chunks.to_vec();
        ordered.sort_by_key(|chunk| chunk.chunk_index);

        let previous = tables
            .chunks
            .insert(document.document_id.clone(), ordered)
            .unwrap_or_default();
        tables
            .documents
            .insert(document.document_id.clone(), document.clone());

        Ok(previous.into_iter().map(|chunk| chunk.chunk_id).collect())
    }

    async fn update_state(
        &self,
        document_id: &str,
        state: LifecycleState,
        visible: bool,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let document = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| missing(document_id))?;
        document.state = state;
        document.visible = visible;
        Ok(())
    }

    async fn set_visible(&self, document_id: &str, visible: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let document = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| missing(document_id))?;
        document.visible = visible;
        Ok(())
    }

    async fn update_flags(&self, document_id: &str, flags: &DocumentFlags) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let document = tables
            .documents
            .get_mut(document_id)
            .ok_or_else(|| missing(document_id))?;
        document.flags = flags.clone();
        Ok(())
    }

    async fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, StoreError> {
        let tables = self.tables.read().await;
        let by_id: HashMap<&str, &Chunk> = tables
            .chunks
            .values()
            .flatten()
            .map(|chunk| (chunk.chunk_id.as_str(), chunk))
            .collect();

        Ok(chunk_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|chunk| (*chunk).clone()))
            .collect())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        tables.chunks.remove(document_id);
        Ok(tables.documents.remove(document_id).is_some())
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let dot: f32 = left.iter().zip(right.iter()).map(|(x, y)| x * y).sum();
    let left_norm: f32 = left.iter().map(|x| x * x).sum::<f32>().sqrt();
    let right_norm: f32 = right.iter().map(|x| x * x).sum::<f32>().sqrt();
    if left_norm < f32::EPSILON || right_norm < f32::EPSILON {
        0.0
    } else {
        dot / (left_norm * right_norm)
    }
}

/// Brute-force cosine search over every stored vector.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<String, VectorIndexEntry>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn document_chunk_ids(&self, document_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .await
            .values()
            .filter(|entry| entry.document_id == document_id)
            .map(|entry| entry.chunk_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, entries: &[VectorIndexEntry]) -> Result<(), ServiceError> {
        let mut stored = self.entries.write().await;
        for entry in entries {
            stored.insert(entry.chunk_id.clone(), entry.clone());
        }
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), ServiceError> {
        let mut stored = self.entries.write().await;
        for chunk_id in chunk_ids {
            stored.remove(chunk_id);
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), ServiceError> {
        self.entries
            .write()
            .await
            .retain(|_, entry| entry.document_id != document_id);
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &VectorFilter,
        top_m: usize,
    ) -> Result<Vec<VectorHit>, ServiceError> {
        let allowed: HashSet<&str> = filter.document_ids.iter().map(String::as_str).collect();
        let stored = self.entries.read().await;

        let mut hits: Vec<VectorHit> = stored
            .values()
            .filter(|entry| filter.state.map_or(true, |state| entry.state == state))
            .filter(|entry| allowed.is_empty() || allowed.contains(entry.document_id.as_str()))
            .map(|entry| VectorHit {
                chunk_id: entry.chunk_id.clone(),
                document_id: entry.document_id.clone(),
                score: cosine_similarity(vector, &entry.vector),
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        hits.truncate(top_m);
        Ok(hits)
    }
}

/// Keyword scoring plus filters and facet counts over document entries.
#[derive(Default)]
pub struct InMemoryFacetIndex {
    entries: RwLock<HashMap<String, SearchIndexEntry>>,
}

impl InMemoryFacetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, document_id: &str) -> bool {
        self.entries.read().await.contains_key(document_id)
    }
}

fn query_terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Term occurrences, with filename hits weighted double.
fn keyword_score(entry: &SearchIndexEntry, terms: &[String]) -> f64 {
    let filename = entry.filename.to_lowercase();
    let content = entry.content.to_lowercase();
    terms
        .iter()
        .map(|term| {
            let tag_hits = entry
                .tags
                .iter()
                .filter(|tag| tag.to_lowercase() == *term)
                .count();
            2.0 * filename.matches(term.as_str()).count() as f64
                + content.matches(term.as_str()).count() as f64
                + tag_hits as f64
        })
        .sum()
}

fn counts(values: impl Iterator<Item = String>) -> Vec<FacetCount> {
    let mut tally: BTreeMap<String, u64> = BTreeMap::new();
    for value in values {
        *tally.entry(value).or_default() += 1;
    }
    let mut buckets: Vec<FacetCount> = tally
        .into_iter()
        .map(|(key, count)| FacetCount { key, count })
        .collect();
    buckets.sort_by(|left, right| right.count.cmp(&left.count).then_with(|| left.key.cmp(&right.key)));
    buckets
}

pub(crate) fn compute_facets<'a>(entries: impl Iterator<Item = &'a SearchIndexEntry> + Clone) -> Facets {
    let mut months: BTreeMap<String, u64> = BTreeMap::new();
    for entry in entries.clone() {
        *months
            .entry(entry.uploaded_at.format("%Y-%m").to_string())
            .or_default() += 1;
    }

    Facets {
        file_types: counts(entries.clone().map(|entry| entry.file_type.to_string())),
        uploaders: counts(entries.clone().map(|entry| entry.uploader_id.clone())),
        statuses: counts(entries.clone().map(|entry| entry.status.to_string())),
        tags: counts(entries.flat_map(|entry| entry.tags.iter().cloned())),
        upload_months: months
            .into_iter()
            .map(|(key, count)| FacetCount { key, count })
            .collect(),
    }
}

fn compare_hits(field: SortField, order: SortOrder, left: &SearchHit, right: &SearchHit) -> Ordering {
    let primary = match field {
        SortField::UploadedAt => left.uploaded_at.cmp(&right.uploaded_at),
        SortField::Filename => left.filename.cmp(&right.filename),
        SortField::FileSize => left.file_size.cmp(&right.file_size),
        SortField::Relevance => left
            .score
            .total_cmp(&right.score)
            .then_with(|| left.uploaded_at.cmp(&right.uploaded_at)),
    };
    let primary = match order {
        SortOrder::Asc => primary,
        SortOrder::Desc => primary.reverse(),
    };
    primary.then_with(|| left.document_id.cmp(&right.document_id))
}

#[async_trait]
impl FacetIndex for InMemoryFacetIndex {
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), ServiceError> {
        self.entries
            .write()
            .await
            .insert(entry.document_id.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, document_id: &str) -> Result<(), ServiceError> {
        self.entries.write().await.remove(document_id);
        Ok(())
    }

    async fn search(&self, query: &FacetQuery) -> Result<FacetSearchResult, ServiceError> {
        let terms = query_terms(&query.text);
        let stored = self.entries.read().await;

        let matched: Vec<(&SearchIndexEntry, f64)> = stored
            .values()
            .filter(|entry| query.status.map_or(true, |status| entry.status == status))
            .filter(|entry| query.filters.matches_entry(entry))
            .filter_map(|entry| {
                if terms.is_empty() {
                    return Some((entry, 0.0));
                }
                let score = keyword_score(entry, &terms);
                (score > 0.0).then_some((entry, score))
            })
            .collect();

        let facets = compute_facets(matched.iter().map(|(entry, _)| *entry));
        let total = matched.len() as u64;

        let mut hits: Vec<SearchHit> = matched
            .into_iter()
            .map(|(entry, score)| SearchHit {
                document_id: entry.document_id.clone(),
                filename: entry.filename.clone(),
                file_type: entry.file_type,
                uploader_id: entry.uploader_id.clone(),
                uploaded_at: entry.uploaded_at,
                file_size: entry.file_size,
                status: entry.status,
                tags: entry.tags.clone(),
                score,
            })
            .collect();
        hits.sort_by(|left, right| compare_hits(query.sort.field, query.sort.order, left, right));

        let skip = query.page.saturating_sub(1).saturating_mul(query.size);
        let hits = hits.into_iter().skip(skip).take(query.size).collect();

        Ok(FacetSearchResult { hits, total, facets })
    }
}
