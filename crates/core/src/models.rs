use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Approval status of a document, controlling whether retrieval may see it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    PendingReview,
    Active,
    Rejected,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::PendingReview => "pending_review",
            LifecycleState::Active => "active",
            LifecycleState::Rejected => "rejected",
        }
    }

    /// Legal edges: review either way, plus reopening a rejection.
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::PendingReview, LifecycleState::Active)
                | (LifecycleState::PendingReview, LifecycleState::Rejected)
                | (LifecycleState::Rejected, LifecycleState::PendingReview)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending_review" | "pending" => Ok(LifecycleState::PendingReview),
            "active" => Ok(LifecycleState::Active),
            "rejected" => Ok(LifecycleState::Rejected),
            other => Err(format!("unknown lifecycle state: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Text,
    Markdown,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Text => "text",
            FileType::Markdown => "markdown",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileType::Pdf => "application/pdf",
            FileType::Text => "text/plain",
            FileType::Markdown => "text/markdown",
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "txt" | "text" => Some(FileType::Text),
            "md" | "markdown" => Some(FileType::Markdown),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/pdf" => Some(FileType::Pdf),
            "text/plain" => Some(FileType::Text),
            "text/markdown" | "text/x-markdown" => Some(FileType::Markdown),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pdf" => Ok(FileType::Pdf),
            "text" | "txt" => Ok(FileType::Text),
            "markdown" | "md" => Ok(FileType::Markdown),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentFlags {
    /// Set when a redaction detector failed and text may still carry sensitive spans.
    pub needs_manual_review: bool,
    /// Reason the last ingestion attempt failed, if it did.
    pub ingestion_error: Option<String>,
}

/// Canonical document record owned by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub document_id: String,
    pub filename: String,
    pub content_hash: String,
    pub byte_size: u64,
    pub file_type: FileType,
    pub uploader_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub state: LifecycleState,
    /// Flipped on only after both index projections succeeded.
    pub visible: bool,
    /// Chunk generation currently live; 0 means no chunks were ever committed.
    pub generation: u32,
    pub object_locator: Option<String>,
    pub page_count: u32,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub tags: BTreeSet<String>,
    pub flags: DocumentFlags,
}

impl Document {
    pub fn is_retrievable(&self) -> bool {
        self.state == LifecycleState::Active && self.visible
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    pub generation: u32,
    pub chunk_index: u32,
    pub text: String,
    pub token_count: usize,
    pub page_start: u32,
    pub page_end: u32,
    /// Id of the point this chunk projects to in the vector index.
    pub embedding_ref: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RedactionCategory {
    Email,
    Phone,
    CreditCard,
    IpAddress,
    NationalId,
    Custom(String),
}

impl RedactionCategory {
    pub fn label(&self) -> String {
        match self {
            RedactionCategory::Email => "EMAIL".to_string(),
            RedactionCategory::Phone => "PHONE".to_string(),
            RedactionCategory::CreditCard => "CREDIT_CARD".to_string(),
            RedactionCategory::IpAddress => "IP_ADDRESS".to_string(),
            RedactionCategory::NationalId => "NATIONAL_ID".to_string(),
            RedactionCategory::Custom(name) => name.to_ascii_uppercase(),
        }
    }
}

/// Audit record of one redacted range, offsets are bytes into the page text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RedactionSpan {
    pub page: u32,
    pub start: usize,
    pub end: usize,
    pub category: RedactionCategory,
}

/// Caller-supplied attributes for an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub filename: String,
    pub mime_type: Option<String>,
    pub uploader_id: String,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: String,
    /// True when identical bytes from the same uploader were already ingested.
    pub reused_existing: bool,
    pub generation: u32,
    pub chunk_count: usize,
    pub needs_manual_review: bool,
    pub redactions: Vec<RedactionSpan>,
}

/// Projection of a document into the facet/full-text index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchIndexEntry {
    pub document_id: String,
    pub filename: String,
    pub content: String,
    pub file_type: FileType,
    pub uploader_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub file_size: u64,
    pub status: LifecycleState,
    pub tags: BTreeSet<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl SearchIndexEntry {
    pub fn from_document(document: &Document, content: String) -> Self {
        Self {
            document_id: document.document_id.clone(),
            filename: document.filename.clone(),
            content,
            file_type: document.file_type,
            uploader_id: document.uploader_id.clone(),
            uploaded_at: document.uploaded_at,
            file_size: document.byte_size,
            status: document.state,
            tags: document.tags.clone(),
            metadata: document.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FacetFilters {
    pub file_type: Option<FileType>,
    pub uploader_id: Option<String>,
    /// Matches documents carrying any of these tags.
    pub tags: Vec<String>,
    pub uploaded_from: Option<DateTime<Utc>>,
    pub uploaded_to: Option<DateTime<Utc>>,
    pub min_file_size: Option<u64>,
    pub max_file_size: Option<u64>,
    /// Exact match on `metadata.<key>`.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl FacetFilters {
    pub fn is_empty(&self) -> bool {
        self.file_type.is_none()
            && self.uploader_id.is_none()
            && self.tags.is_empty()
            && self.uploaded_from.is_none()
            && self.uploaded_to.is_none()
            && self.min_file_size.is_none()
            && self.max_file_size.is_none()
            && self.metadata.is_empty()
    }

    pub fn matches_entry(&self, entry: &SearchIndexEntry) -> bool {
        self.matches_fields(
            entry.file_type,
            &entry.uploader_id,
            &entry.tags,
            entry.uploaded_at,
            entry.file_size,
            &entry.metadata,
        )
    }

    pub fn matches_document(&self, document: &Document) -> bool {
        self.matches_fields(
            document.file_type,
            &document.uploader_id,
            &document.tags,
            document.uploaded_at,
            document.byte_size,
            &document.metadata,
        )
    }

    fn matches_fields(
        &self,
        file_type: FileType,
        uploader_id: &str,
        tags: &BTreeSet<String>,
        uploaded_at: DateTime<Utc>,
        file_size: u64,
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> bool {
        if self.file_type.is_some_and(|wanted| wanted != file_type) {
            return false;
        }
        if self
            .uploader_id
            .as_deref()
            .is_some_and(|wanted| wanted != uploader_id)
        {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|tag| tags.contains(tag)) {
            return false;
        }
        if self.uploaded_from.is_some_and(|from| uploaded_at < from) {
            return false;
        }
        if self.uploaded_to.is_some_and(|to| uploaded_at > to) {
            return false;
        }
        if self.min_file_size.is_some_and(|min| file_size < min) {
            return false;
        }
        if self.max_file_size.is_some_and(|max| file_size > max) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(key, wanted)| metadata.get(key) == Some(wanted))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    UploadedAt,
    Filename,
    FileSize,
    Relevance,
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uploaded_at" | "date" => Ok(SortField::UploadedAt),
            "filename" | "name" => Ok(SortField::Filename),
            "file_size" | "size" => Ok(SortField::FileSize),
            "relevance" | "score" => Ok(SortField::Relevance),
            other => Err(format!("unknown sort field: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            other => Err(format!("unknown sort order: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct SearchSort {
    pub field: SortField,
    pub order: SortOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub filters: FacetFilters,
    pub sort: SearchSort,
    /// 1-based.
    pub page: usize,
    pub size: usize,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: String::new(),
            filters: FacetFilters::default(),
            sort: SearchSort::default(),
            page: 1,
            size: 20,
        }
    }
}

/// Query sent to the facet index; `status` pins the lifecycle state searched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacetQuery {
    pub text: String,
    pub filters: FacetFilters,
    pub status: Option<LifecycleState>,
    pub sort: SearchSort,
    pub page: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub document_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub uploader_id: String,
    pub uploaded_at: DateTime<Utc>,
    pub file_size: u64,
    pub status: LifecycleState,
    pub tags: BTreeSet<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FacetCount {
    pub key: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Facets {
    pub file_types: Vec<FacetCount>,
    pub uploaders: Vec<FacetCount>,
    pub statuses: Vec<FacetCount>,
    pub tags: Vec<FacetCount>,
    /// Buckets keyed `YYYY-MM`, ascending.
    pub upload_months: Vec<FacetCount>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub total: u64,
    pub page: usize,
    pub size: usize,
    pub facets: Facets,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalRequest {
    pub query: String,
    pub filters: FacetFilters,
    pub top_k: usize,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            filters: FacetFilters::default(),
            top_k,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: u32,
    pub filename: String,
    pub page_start: u32,
    pub page_end: u32,
    pub text: String,
    pub token_count: usize,
    pub uploaded_at: DateTime<Utc>,
    /// Reranker score, or the vector similarity when reranking was skipped.
    pub score: f32,
    pub vector_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum RetrievalWarning {
    ExpansionFailed(String),
    VariantTimedOut(String),
    VariantFailed(String),
    FacetSearchFailed(String),
    RerankFailed(String),
    GenerationFailed(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RankedChunks {
    pub chunks: Vec<RankedChunk>,
    pub query_variants: Vec<String>,
    pub reranked: bool,
    pub refined: bool,
    pub warnings: Vec<RetrievalWarning>,
}

impl RankedChunks {
    pub fn degraded(&self) -> bool {
        !self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub document_id: String,
    pub chunk_index: u32,
    pub chunk_id: String,
    pub filename: String,
    pub page_start: u32,
    pub page_end: u32,
    pub score: f32,
}

impl Citation {
    pub fn format_inline(&self) -> String {
        let pages = if self.page_start == self.page_end {
            format!("page {}", self.page_start)
        } else {
            format!("pages {}-{}", self.page_start, self.page_end)
        };
        format!(
            "source: {} ({}), section {}, {}",
            self.filename, self.document_id, self.chunk_index, pages
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssembledContext {
    pub context: String,
    pub citations: Vec<Citation>,
    pub token_count: usize,
    /// Set when the top chunk alone overflowed the budget and was cut.
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub query: String,
    pub answer: Option<String>,
    pub context: String,
    pub citations: Vec<Citation>,
    pub degraded: bool,
    pub warnings: Vec<RetrievalWarning>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentListQuery {
    pub status: Option<LifecycleState>,
    pub uploader_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentPage {
    pub documents: Vec<Document>,
    pub total: u64,
}
