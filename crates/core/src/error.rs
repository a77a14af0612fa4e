use crate::models::LifecycleState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),

    #[error("document is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("document is not valid utf-8 text")]
    InvalidEncoding,

    #[error("document has no readable text: {0}")]
    Empty(String),
}

/// Failure at one of the external call boundaries (indices, model services).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("{backend} rejected the request: {details}")]
    Rejected { backend: String, details: String },

    #[error("{0} rate limited the request")]
    RateLimited(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("service request failed: {0}")]
    Request(String),
}

impl ServiceError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Http(error) => {
                error.is_timeout()
                    || error.is_connect()
                    || error.status().is_some_and(|status| status.is_server_error())
            }
            ServiceError::BackendResponse { .. }
            | ServiceError::RateLimited(_)
            | ServiceError::Timeout(_) => true,
            ServiceError::Url(_)
            | ServiceError::Serialization(_)
            | ServiceError::Rejected { .. }
            | ServiceError::Request(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum IndexSyncError {
    #[error("vector index sync failed for {document_id} after {attempts} attempt(s): {source}")]
    Vector {
        document_id: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("facet index sync failed for {document_id} after {attempts} attempt(s): {source}")]
    Facet {
        document_id: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("metadata store error during sync: {0}")]
    Store(#[from] StoreError),

    #[error("document disappeared during sync: {0}")]
    MissingDocument(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("embedding service failed for {document_id} after {attempts} attempt(s): {source}")]
    EmbeddingService {
        document_id: String,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] IndexSyncError),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {0} has no stored source bytes to reprocess")]
    MissingSource(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("persist task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {document_id} cannot move from {from} to {to}")]
    InvalidTransition {
        document_id: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("document {document_id} is not ready for approval: {reason}")]
    NotReady { document_id: String, reason: String },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sync(#[from] IndexSyncError),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query is invalid: {0}")]
    InvalidQuery(String),

    #[error("vector index unavailable: {0}")]
    VectorIndexUnavailable(String),

    #[error("query was cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("facet index unavailable: {0}")]
    FacetIndexUnavailable(#[source] ServiceError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
