//! The operations exposed to callers, wired over the collaborator traits.

use crate::assembler::{assemble, build_grounded_prompt};
use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::embeddings::{EmbedderClient, EmbeddingService};
use crate::error::{IndexSyncError, IngestError, LifecycleError, RetrievalError};
use crate::ingest::{FolderIngestReport, IngestionCoordinator};
use crate::models::{
    Answer, Document, DocumentListQuery, DocumentPage, FacetQuery, IngestOutcome, LifecycleState,
    RankedChunks, RetrievalRequest, RetrievalWarning, SearchRequest, SearchResponse, UploadMetadata,
};
use crate::orchestrator::RetrievalEngine;
use crate::search_cache::SearchCache;
use crate::services::{GenerationService, RerankService};
use crate::sync::{IndexSynchronizer, ReconcileReport};
use crate::traits::{FacetIndex, MetadataStore, ObjectStore, VectorIndex};
use crate::anonymizer::Anonymizer;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{info, warn};

const SLOW_SEARCH: Duration = Duration::from_secs(2);
const MAX_PAGE_SIZE: usize = 100;

/// Storage collaborators.
#[derive(Clone)]
pub struct Backends {
    pub metadata: Arc<dyn MetadataStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub facets: Arc<dyn FacetIndex>,
}

/// Model collaborators. Reranking and generation are optional.
#[derive(Clone)]
pub struct ModelServices {
    pub embedding: Arc<dyn EmbeddingService>,
    pub reranker: Option<Arc<dyn RerankService>>,
    pub generator: Option<Arc<dyn GenerationService>>,
}

pub struct KnowledgeBase {
    metadata: Arc<dyn MetadataStore>,
    facets: Arc<dyn FacetIndex>,
    synchronizer: Arc<IndexSynchronizer>,
    ingestion: IngestionCoordinator,
    retrieval: RetrievalEngine,
    generator: Option<Arc<dyn GenerationService>>,
    search_cache: Arc<SearchCache>,
    config: PipelineConfig,
}

impl KnowledgeBase {
    pub fn new(backends: Backends, models: ModelServices, config: PipelineConfig) -> Self {
        Self::with_anonymizer(backends, models, config, Anonymizer::with_default_detectors())
    }

    pub fn with_anonymizer(
        backends: Backends,
        models: ModelServices,
        config: PipelineConfig,
        anonymizer: Anonymizer,
    ) -> Self {
        let search_cache = Arc::new(SearchCache::new(config.search_cache));
        let synchronizer = Arc::new(
            IndexSynchronizer::new(
                Arc::clone(&backends.metadata),
                Arc::clone(&backends.vectors),
                Arc::clone(&backends.facets),
                config.sync.retry,
            )
            .with_search_cache(Arc::clone(&search_cache)),
        );

        // One client, so ingestion and queries share the embedding pool.
        let embedder = EmbedderClient::new(models.embedding, config.embedding);

        let ingestion = IngestionCoordinator::new(
            Arc::clone(&backends.metadata),
            backends.objects,
            embedder.clone(),
            Arc::new(anonymizer),
            Arc::clone(&synchronizer),
            config.chunking,
            config.ingestion.clone(),
        );

        let mut retrieval = RetrievalEngine::new(
            Arc::clone(&backends.metadata),
            backends.vectors,
            Arc::clone(&backends.facets),
            embedder,
            config.retrieval,
        );
        if let Some(reranker) = models.reranker {
            retrieval = retrieval.with_reranker(reranker);
        }
        if let Some(generator) = &models.generator {
            retrieval = retrieval.with_expander(Arc::clone(generator));
        }

        Self {
            metadata: backends.metadata,
            facets: backends.facets,
            synchronizer,
            ingestion,
            retrieval,
            generator: models.generator,
            search_cache,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn ingest(&self, bytes: &[u8], upload: UploadMetadata) -> Result<IngestOutcome, IngestError> {
        self.ingestion.ingest(bytes, upload).await
    }

    pub async fn ingest_path(
        &self,
        path: &Path,
        uploader_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<IngestOutcome, IngestError> {
        self.ingestion.ingest_path(path, uploader_id, tags).await
    }

    pub async fn ingest_folder(
        &self,
        folder: &Path,
        uploader_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<FolderIngestReport, IngestError> {
        self.ingestion.ingest_folder(folder, uploader_id, tags).await
    }

    pub async fn reprocess(&self, document_id: &str) -> Result<IngestOutcome, IngestError> {
        self.ingestion.reprocess(document_id).await
    }

    pub async fn approve(&self, document_id: &str) -> Result<Document, LifecycleError> {
        self.transition(document_id, LifecycleState::Active).await
    }

    pub async fn reject(&self, document_id: &str) -> Result<Document, LifecycleError> {
        self.transition(document_id, LifecycleState::Rejected).await
    }

    pub async fn reopen(&self, document_id: &str) -> Result<Document, LifecycleError> {
        self.transition(document_id, LifecycleState::PendingReview).await
    }

    /// Applies a lifecycle transition under the document lock. Requesting
    /// the current state replays its sync pass, which heals a projection
    /// left behind by an earlier failure.
    async fn transition(&self, document_id: &str, target: LifecycleState) -> Result<Document, LifecycleError> {
        let _lease = self.metadata.lock_document(document_id).await;
        let document = self
            .metadata
            .get_document(document_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(document_id.to_string()))?;

        let from = document.state;
        if from != target && !from.can_transition_to(target) {
            return Err(LifecycleError::InvalidTransition {
                document_id: document_id.to_string(),
                from,
                to: target,
            });
        }
        if target == LifecycleState::Active {
            if let Some(reason) = &document.flags.ingestion_error {
                return Err(LifecycleError::NotReady {
                    document_id: document_id.to_string(),
                    reason: reason.clone(),
                });
            }
            if document.generation == 0 {
                return Err(LifecycleError::NotReady {
                    document_id: document_id.to_string(),
                    reason: "document has no chunks".to_string(),
                });
            }
        }

        self.synchronizer
            .on_lifecycle_transition(document_id, Some(from), Some(target))
            .await?;
        info!(document_id, from = %from, to = %target, "lifecycle transition applied");

        self.metadata
            .get_document(document_id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(document_id.to_string()))
    }

    /// Hard delete: indices first, then records. `false` for unknown ids.
    pub async fn delete(&self, document_id: &str) -> Result<bool, LifecycleError> {
        let _lease = self.metadata.lock_document(document_id).await;
        let Some(document) = self.metadata.get_document(document_id).await? else {
            return Ok(false);
        };

        self.synchronizer
            .on_lifecycle_transition(document_id, Some(document.state), None)
            .await?;
        info!(document_id, state = %document.state, "document deleted");
        Ok(true)
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<Document>, LifecycleError> {
        Ok(self.metadata.get_document(document_id).await?)
    }

    pub async fn list_documents(&self, query: &DocumentListQuery) -> Result<DocumentPage, LifecycleError> {
        Ok(self.metadata.list_documents(query).await?)
    }

    /// The review queue, newest first.
    pub async fn pending_documents(&self) -> Result<Vec<Document>, LifecycleError> {
        let page = self
            .metadata
            .list_documents(&DocumentListQuery {
                status: Some(LifecycleState::PendingReview),
                ..Default::default()
            })
            .await?;
        Ok(page.documents)
    }

    /// Faceted full-text search over active documents.
    ///
    /// Hits the metadata store no longer considers retrievable are dropped
    /// from the page and subtracted from `total`. Only the returned page is
    /// checked, so `total` and `facets` can still count documents hidden on
    /// other pages until the index catches up.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, RetrievalError> {
        if let Some(cached) = self.search_cache.get(request) {
            return Ok(cached);
        }

        let epoch = self.search_cache.epoch();
        let started = Instant::now();
        let query = FacetQuery {
            text: request.query.trim().to_string(),
            filters: request.filters.clone(),
            status: Some(LifecycleState::Active),
            sort: request.sort,
            page: request.page.max(1),
            size: request.size.clamp(1, MAX_PAGE_SIZE),
        };
        let result = self
            .facets
            .search(&query)
            .await
            .map_err(RetrievalError::FacetIndexUnavailable)?;

        // The index may briefly lag the metadata store; the store decides.
        let mut hits = Vec::with_capacity(result.hits.len());
        let mut hidden = 0u64;
        for hit in result.hits {
            let visible = self
                .metadata
                .get_document(&hit.document_id)
                .await?
                .is_some_and(|document| document.is_retrievable());
            if visible {
                hits.push(hit);
            } else {
                hidden += 1;
            }
        }

        let response = SearchResponse {
            hits,
            total: result.total.saturating_sub(hidden),
            page: query.page,
            size: query.size,
            facets: result.facets,
        };

        let elapsed = started.elapsed();
        if elapsed > SLOW_SEARCH {
            warn!(
                query = %query.text,
                elapsed_ms = elapsed.as_millis() as u64,
                "slow search"
            );
        }
        self.search_cache.put(request, &response, epoch);
        Ok(response)
    }

    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<RankedChunks, RetrievalError> {
        self.retrieval.retrieve(request, cancel).await
    }

    pub async fn ask(&self, query: &str) -> Result<Answer, RetrievalError> {
        let request = RetrievalRequest::new(query, self.config.retrieval.top_k);
        self.ask_with(&request, &CancellationToken::never()).await
    }

    /// Retrieves, assembles the context window and, when a generation
    /// service is configured, synthesizes a grounded answer. A failed
    /// generation still returns the context and citations.
    pub async fn ask_with(
        &self,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<Answer, RetrievalError> {
        let ranked = self.retrieval.retrieve(request, cancel).await?;
        let assembled = assemble(&request.query, &ranked.chunks, self.config.assembler.token_budget);
        let mut warnings = ranked.warnings;

        let mut answer = None;
        if let Some(generator) = &self.generator {
            if !assembled.citations.is_empty() {
                let prompt = build_grounded_prompt(&request.query, &assembled);
                let limit = Duration::from_millis(self.config.retrieval.generation_timeout_ms);
                let generated = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(RetrievalError::Cancelled),
                    generated = timeout(limit, generator.generate(&prompt)) => generated,
                };
                match generated {
                    Ok(Ok(text)) => answer = Some(text),
                    Ok(Err(error)) => {
                        warn!(error = %error, "answer generation failed, returning context only");
                        warnings.push(RetrievalWarning::GenerationFailed(error.to_string()));
                    }
                    Err(_) => {
                        warn!(timeout_ms = self.config.retrieval.generation_timeout_ms, "answer generation timed out");
                        warnings.push(RetrievalWarning::GenerationFailed(format!(
                            "timed out after {} ms",
                            self.config.retrieval.generation_timeout_ms
                        )));
                    }
                }
            }
        }

        Ok(Answer {
            query: request.query.clone(),
            answer,
            context: assembled.context,
            citations: assembled.citations,
            degraded: !warnings.is_empty(),
            warnings,
        })
    }

    /// Replays the sync pass for every document's current state.
    pub async fn reconcile(&self) -> Result<ReconcileReport, IndexSyncError> {
        self.synchronizer.reconcile().await
    }
}
