pub mod anonymizer;
pub mod assembler;
pub mod cancel;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod locks;
pub mod models;
pub mod orchestrator;
pub mod retry;
pub mod search_cache;
pub mod service;
pub mod services;
pub mod stores;
pub mod sync;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use anonymizer::{AnonymizedText, Anonymizer, DetectedSpan, DetectorError, PatternDetector, SpanDetector};
pub use assembler::{assemble, build_grounded_prompt, AssemblerConfig};
pub use cancel::{cancellation_pair, CancelHandle, CancellationToken};
pub use chunking::{chunk_pages, count_tokens, normalize_whitespace, ChunkDraft, ChunkingConfig};
pub use config::{load_config, parse_config, PipelineConfig, ServiceEndpoint, ServicesConfig, SyncConfig};
pub use embeddings::{
    CharacterNgramEmbedder, EmbedderClient, EmbeddingConfig, EmbeddingService, HttpEmbeddingService,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    ConfigError, ExtractionError, IndexSyncError, IngestError, LifecycleError, RetrievalError,
    ServiceError, StoreError,
};
pub use extractor::{extract_document, ExtractedDocument, PageText};
pub use ingest::{discover_documents, FolderIngestReport, IngestionConfig, IngestionCoordinator, SkippedDocument};
pub use locks::{DocumentLease, DocumentLocks};
pub use models::{
    Answer, AssembledContext, Chunk, Citation, Document, DocumentFlags, DocumentListQuery,
    DocumentPage, FacetFilters, FacetQuery, Facets, FileType, IngestOutcome, LifecycleState,
    RankedChunk, RankedChunks, RedactionCategory, RedactionSpan, RetrievalRequest,
    RetrievalWarning, SearchHit, SearchIndexEntry, SearchRequest, SearchResponse, SearchSort,
    SortField, SortOrder, UploadMetadata,
};
pub use orchestrator::{rank_order, RetrievalConfig, RetrievalEngine};
pub use retry::RetryPolicy;
pub use search_cache::{SearchCache, SearchCacheConfig};
pub use service::{Backends, KnowledgeBase, ModelServices};
pub use services::{
    GenerationService, HttpGenerationService, HttpRerankService, LexicalReranker, RerankService,
};
pub use stores::{
    FsObjectStore, InMemoryFacetIndex, InMemoryMetadataStore, InMemoryObjectStore,
    InMemoryVectorIndex, OpenSearchStore, QdrantStore, SqliteMetadataStore,
};
pub use sync::{plan_transition, IndexSynchronizer, ReconcileReport, SyncStep};
pub use traits::{
    FacetIndex, FacetSearchResult, MetadataStore, ObjectStore, VectorFilter, VectorHit,
    VectorIndex, VectorIndexEntry,
};
