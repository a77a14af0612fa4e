//! Query-time pipeline: expand, search variants in parallel, merge, rerank,
//! optionally broaden once, truncate.
//!
//! External failures in expansion, facet prefiltering and reranking degrade
//! to the previous stage's output and are reported as warnings. Only a vector
//! index that fails for every variant is fatal.

use crate::cancel::CancellationToken;
use crate::embeddings::EmbedderClient;
use crate::error::{RetrievalError, ServiceError};
use crate::models::{
    Document, DocumentListQuery, FacetFilters, FacetQuery, LifecycleState, RankedChunk,
    RankedChunks, RetrievalRequest, RetrievalWarning,
};
use crate::services::{expansion_prompt, parse_variants, GenerationService, RerankService};
use crate::traits::{FacetIndex, MetadataStore, VectorFilter, VectorHit, VectorIndex};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Results returned when the request does not set its own.
    pub top_k: usize,
    /// Nearest neighbours fetched per query variant.
    pub top_m: usize,
    /// Extra phrasings requested from the generation service.
    pub expansion_variants: usize,
    /// Multiplier applied to `top_m` on the refinement pass.
    pub broaden_factor: usize,
    /// Mean score of the top results below which one refinement pass runs.
    pub confidence_threshold: f32,
    pub variant_timeout_ms: u64,
    pub rerank_timeout_ms: u64,
    pub generation_timeout_ms: u64,
    pub rerank_concurrency: usize,
    pub facet_candidate_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            top_m: 20,
            expansion_variants: 3,
            broaden_factor: 2,
            confidence_threshold: 0.3,
            variant_timeout_ms: 5_000,
            rerank_timeout_ms: 10_000,
            generation_timeout_ms: 20_000,
            rerank_concurrency: 2,
            facet_candidate_limit: 1_000,
        }
    }
}

/// Score descending, then newer documents, then earlier chunks. The chunk id
/// settles anything left so repeated runs cite identically.
pub fn rank_order(left: &RankedChunk, right: &RankedChunk) -> Ordering {
    right
        .score
        .total_cmp(&left.score)
        .then_with(|| right.uploaded_at.cmp(&left.uploaded_at))
        .then_with(|| left.chunk_index.cmp(&right.chunk_index))
        .then_with(|| left.chunk_id.cmp(&right.chunk_id))
}

/// Best vector score per chunk across all variants.
fn merge_hits(pool: &mut HashMap<String, VectorHit>, hits: Vec<VectorHit>) {
    for hit in hits {
        match pool.get_mut(&hit.chunk_id) {
            Some(existing) if existing.score >= hit.score => {}
            Some(existing) => *existing = hit,
            None => {
                pool.insert(hit.chunk_id.clone(), hit);
            }
        }
    }
}

fn mean_top_score(chunks: &[RankedChunk], top_k: usize) -> f32 {
    let top = &chunks[..chunks.len().min(top_k)];
    if top.is_empty() {
        return 0.0;
    }
    top.iter().map(|chunk| chunk.score).sum::<f32>() / top.len() as f32
}

struct CandidatePass {
    chunks: Vec<RankedChunk>,
    /// Some variant filled its whole window, so a wider one may find more.
    saturated: bool,
}

pub struct RetrievalEngine {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    facets: Arc<dyn FacetIndex>,
    embedder: EmbedderClient,
    reranker: Option<Arc<dyn RerankService>>,
    expander: Option<Arc<dyn GenerationService>>,
    rerank_permits: Arc<Semaphore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        facets: Arc<dyn FacetIndex>,
        embedder: EmbedderClient,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            metadata,
            vectors,
            facets,
            embedder,
            reranker: None,
            expander: None,
            rerank_permits: Arc::new(Semaphore::new(config.rerank_concurrency.max(1))),
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<dyn RerankService>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_expander(mut self, expander: Arc<dyn GenerationService>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Runs the pipeline until it finishes or `cancel` fires. Cancelling drops
    /// every outstanding embedding, index and rerank call of this query.
    pub async fn retrieve(
        &self,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<RankedChunks, RetrievalError> {
        if cancel.is_cancelled() {
            return Err(RetrievalError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(query = %request.query, "retrieval cancelled");
                Err(RetrievalError::Cancelled)
            }
            result = self.run(request) => result,
        }
    }

    async fn run(&self, request: &RetrievalRequest) -> Result<RankedChunks, RetrievalError> {
        let started = Instant::now();
        let query = request.query.trim();
        if query.is_empty() {
            return Err(RetrievalError::InvalidQuery("query is empty".to_string()));
        }
        let top_k = if request.top_k == 0 {
            self.config.top_k
        } else {
            request.top_k
        };

        let mut warnings = Vec::new();
        let variants = self.expand(query, &mut warnings).await;

        let allowed = if request.filters.is_empty() {
            None
        } else {
            let candidates = self.facet_candidates(&request.filters, &mut warnings).await?;
            if candidates.is_empty() {
                debug!(query, "no documents match the facet filters");
                return Ok(RankedChunks {
                    query_variants: variants,
                    warnings,
                    ..Default::default()
                });
            }
            Some(candidates)
        };

        let top_m = self.config.top_m.max(top_k);
        let first = self
            .candidate_pass(query, &variants, allowed.as_ref(), top_m, &mut warnings)
            .await?;
        let mut chunks = first.chunks;
        let mut reranked = self.rerank(query, &mut chunks, &mut warnings).await;
        chunks.sort_by(rank_order);

        let mut refined = false;
        let confidence = mean_top_score(&chunks, top_k);
        if first.saturated && confidence < self.config.confidence_threshold {
            let broadened = top_m.saturating_mul(self.config.broaden_factor.max(1));
            debug!(query, confidence, top_m = broadened, "low confidence, broadening search");

            let second = self
                .candidate_pass(query, &variants, allowed.as_ref(), broadened, &mut warnings)
                .await?;
            chunks = second.chunks;
            reranked = self.rerank(query, &mut chunks, &mut warnings).await;
            chunks.sort_by(rank_order);
            refined = true;
        }

        chunks.truncate(top_k);
        let result = RankedChunks {
            chunks,
            query_variants: variants,
            reranked,
            refined,
            warnings,
        };

        info!(
            query,
            variants = result.query_variants.len(),
            returned = result.chunks.len(),
            reranked,
            refined,
            degraded = result.degraded(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "retrieval finished"
        );
        Ok(result)
    }

    /// The original query first, then up to `expansion_variants` rephrasings.
    async fn expand(&self, query: &str, warnings: &mut Vec<RetrievalWarning>) -> Vec<String> {
        let mut variants = vec![query.to_string()];
        let Some(expander) = &self.expander else {
            return variants;
        };
        if self.config.expansion_variants == 0 {
            return variants;
        }

        let prompt = expansion_prompt(query, self.config.expansion_variants);
        let limit = Duration::from_millis(self.config.generation_timeout_ms);
        match timeout(limit, expander.generate(&prompt)).await {
            Ok(Ok(generated)) => {
                variants.extend(parse_variants(query, &generated, self.config.expansion_variants));
            }
            Ok(Err(error)) => {
                warn!(error = %error, "query expansion failed, using original query");
                warnings.push(RetrievalWarning::ExpansionFailed(error.to_string()));
            }
            Err(_) => {
                warn!(timeout_ms = self.config.generation_timeout_ms, "query expansion timed out");
                warnings.push(RetrievalWarning::ExpansionFailed(format!(
                    "timed out after {} ms",
                    self.config.generation_timeout_ms
                )));
            }
        }
        variants
    }

    /// Active documents matching `filters`, from the facet index or, when it
    /// is unavailable, from the metadata store.
    async fn facet_candidates(
        &self,
        filters: &FacetFilters,
        warnings: &mut Vec<RetrievalWarning>,
    ) -> Result<HashSet<String>, RetrievalError> {
        let query = FacetQuery {
            text: String::new(),
            filters: filters.clone(),
            status: Some(LifecycleState::Active),
            sort: Default::default(),
            page: 1,
            size: self.config.facet_candidate_limit.max(1),
        };

        match self.facets.search(&query).await {
            Ok(result) => {
                if result.total as usize > result.hits.len() {
                    debug!(
                        total = result.total,
                        kept = result.hits.len(),
                        "facet prefilter truncated to candidate limit"
                    );
                }
                Ok(result.hits.into_iter().map(|hit| hit.document_id).collect())
            }
            Err(error) => {
                warn!(error = %error, "facet prefilter failed, filtering from metadata");
                warnings.push(RetrievalWarning::FacetSearchFailed(error.to_string()));

                let page = self
                    .metadata
                    .list_documents(&DocumentListQuery {
                        status: Some(LifecycleState::Active),
                        ..Default::default()
                    })
                    .await?;
                Ok(page
                    .documents
                    .into_iter()
                    .filter(|document| document.is_retrievable() && filters.matches_document(document))
                    .map(|document| document.document_id)
                    .collect())
            }
        }
    }

    async fn candidate_pass(
        &self,
        query: &str,
        variants: &[String],
        allowed: Option<&HashSet<String>>,
        top_m: usize,
        warnings: &mut Vec<RetrievalWarning>,
    ) -> Result<CandidatePass, RetrievalError> {
        let filter = VectorFilter {
            state: Some(LifecycleState::Active),
            document_ids: allowed
                .map(|ids| {
                    let mut ids: Vec<String> = ids.iter().cloned().collect();
                    ids.sort_unstable();
                    ids
                })
                .unwrap_or_default(),
        };
        let limit = Duration::from_millis(self.config.variant_timeout_ms);

        let searches = variants.iter().map(|variant| {
            let filter = &filter;
            async move {
                let search = async {
                    let vector = self
                        .embedder
                        .embed_query(variant)
                        .await
                        .map_err(|exhausted| exhausted.last_error)?;
                    self.vectors.query(&vector, filter, top_m).await
                };
                (variant, timeout(limit, search).await)
            }
        });

        let mut pool = HashMap::new();
        let mut failures = Vec::new();
        let mut saturated = false;
        for (variant, outcome) in join_all(searches).await {
            match outcome {
                Ok(Ok(hits)) => {
                    saturated |= hits.len() >= top_m;
                    merge_hits(&mut pool, hits);
                }
                Ok(Err(error)) => {
                    warn!(variant = %variant, error = %error, "query variant failed");
                    failures.push(format!("{variant}: {error}"));
                    warnings.push(RetrievalWarning::VariantFailed(format!("{variant}: {error}")));
                }
                Err(_) => {
                    warn!(variant = %variant, timeout_ms = self.config.variant_timeout_ms, "query variant timed out");
                    failures.push(format!("{variant}: timed out"));
                    warnings.push(RetrievalWarning::VariantTimedOut(variant.clone()));
                }
            }
        }

        if failures.len() == variants.len() {
            return Err(RetrievalError::VectorIndexUnavailable(failures.join("; ")));
        }

        debug!(query, candidates = pool.len(), top_m, "merged variant candidates");
        let chunks = self.hydrate(pool, allowed).await?;
        Ok(CandidatePass { chunks, saturated })
    }

    /// Resolves hits against the metadata store. Chunks from stale
    /// generations or from documents that are not retrievable right now are
    /// dropped here, whatever the index still holds.
    async fn hydrate(
        &self,
        pool: HashMap<String, VectorHit>,
        allowed: Option<&HashSet<String>>,
    ) -> Result<Vec<RankedChunk>, RetrievalError> {
        if pool.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids: Vec<String> = pool.keys().cloned().collect();
        ids.sort_unstable();
        let chunks = self.metadata.get_chunks(&ids).await?;

        let mut documents: HashMap<String, Option<Document>> = HashMap::new();
        let mut ranked = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if allowed.is_some_and(|allowed| !allowed.contains(&chunk.document_id)) {
                continue;
            }
            if !documents.contains_key(&chunk.document_id) {
                let document = self.metadata.get_document(&chunk.document_id).await?;
                documents.insert(chunk.document_id.clone(), document);
            }
            let Some(Some(document)) = documents.get(&chunk.document_id) else {
                continue;
            };
            if !document.is_retrievable() {
                continue;
            }
            let Some(hit) = pool.get(&chunk.chunk_id) else {
                continue;
            };

            ranked.push(RankedChunk {
                chunk_id: chunk.chunk_id,
                document_id: chunk.document_id,
                chunk_index: chunk.chunk_index,
                filename: document.filename.clone(),
                page_start: chunk.page_start,
                page_end: chunk.page_end,
                text: chunk.text,
                token_count: chunk.token_count,
                uploaded_at: document.uploaded_at,
                score: hit.score,
                vector_score: hit.score,
            });
        }
        Ok(ranked)
    }

    /// Replaces scores with reranker scores. On any failure the vector
    /// scores stay and a warning is recorded.
    async fn rerank(
        &self,
        query: &str,
        chunks: &mut [RankedChunk],
        warnings: &mut Vec<RetrievalWarning>,
    ) -> bool {
        let Some(reranker) = &self.reranker else {
            return false;
        };
        if chunks.is_empty() {
            return false;
        }

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let scoring = async {
            let _permit = self
                .rerank_permits
                .acquire()
                .await
                .map_err(|_| ServiceError::Request("rerank pool closed".to_string()))?;
            reranker.score(query, &texts).await
        };

        let limit = Duration::from_millis(self.config.rerank_timeout_ms);
        let failure = match timeout(limit, scoring).await {
            Ok(Ok(scores)) if scores.len() == chunks.len() => {
                for (chunk, score) in chunks.iter_mut().zip(scores) {
                    chunk.score = score;
                }
                return true;
            }
            Ok(Ok(scores)) => format!(
                "reranker returned {} scores for {} candidates",
                scores.len(),
                chunks.len()
            ),
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("timed out after {} ms", self.config.rerank_timeout_ms),
        };

        warn!(error = %failure, candidates = chunks.len(), "rerank failed, keeping vector order");
        for chunk in chunks.iter_mut() {
            chunk.score = chunk.vector_score;
        }
        warnings.push(RetrievalWarning::RerankFailed(failure));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancellation_pair;
    use crate::chunking::make_chunk_id;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingConfig};
    use crate::models::Chunk;
    use crate::retry::RetryPolicy;
    use crate::services::LexicalReranker;
    use crate::stores::{InMemoryFacetIndex, InMemoryMetadataStore, InMemoryVectorIndex};
    use crate::sync::IndexSynchronizer;
    use crate::test_support::{document, FailingFacetIndex};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    const DIMENSIONS: usize = 64;

    struct SlowReranker(Duration);

    #[async_trait]
    impl RerankService for SlowReranker {
        async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
            tokio::time::sleep(self.0).await;
            Ok(vec![1.0; texts.len()])
        }
    }

    struct FixedGenerator(Result<String, String>);

    #[async_trait]
    impl GenerationService for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, ServiceError> {
            self.0.clone().map_err(|details| ServiceError::BackendResponse {
                backend: "generation".to_string(),
                details,
            })
        }
    }

    struct DownVectorIndex;

    #[async_trait]
    impl VectorIndex for DownVectorIndex {
        async fn upsert(&self, _entries: &[crate::traits::VectorIndexEntry]) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn delete(&self, _chunk_ids: &[String]) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn delete_document(&self, _document_id: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _filter: &VectorFilter,
            _top_m: usize,
        ) -> Result<Vec<VectorHit>, ServiceError> {
            Err(ServiceError::Request("connection refused".to_string()))
        }
    }

    struct Harness {
        metadata: Arc<InMemoryMetadataStore>,
        vectors: Arc<InMemoryVectorIndex>,
        facets: Arc<InMemoryFacetIndex>,
        sync: IndexSynchronizer,
    }

    impl Harness {
        fn new() -> Self {
            let metadata = Arc::new(InMemoryMetadataStore::new());
            let vectors = Arc::new(InMemoryVectorIndex::new());
            let facets = Arc::new(InMemoryFacetIndex::new());
            let sync = IndexSynchronizer::new(
                metadata.clone(),
                vectors.clone(),
                facets.clone(),
                RetryPolicy::immediate(1),
            );
            Self {
                metadata,
                vectors,
                facets,
                sync,
            }
        }

        fn engine(&self, config: RetrievalConfig) -> RetrievalEngine {
            RetrievalEngine::new(
                self.metadata.clone(),
                self.vectors.clone(),
                self.facets.clone(),
                embedder(),
                config,
            )
        }

        async fn seed(&self, id: &str, texts: &[&str], state: LifecycleState, day: u32) {
            let mut doc = document(id, LifecycleState::PendingReview);
            doc.uploaded_at = Utc
                .with_ymd_and_hms(2024, 3, day, 12, 0, 0)
                .single()
                .expect("valid date");
            doc.tags.insert(if day % 2 == 0 { "even" } else { "odd" }.to_string());

            let model = CharacterNgramEmbedder {
                dimensions: DIMENSIONS,
            };
            let chunks: Vec<Chunk> = texts
                .iter()
                .enumerate()
                .map(|(index, text)| {
                    let chunk_id = make_chunk_id(id, 1, index as u32, text);
                    Chunk {
                        chunk_id: chunk_id.clone(),
                        document_id: id.to_string(),
                        generation: 1,
                        chunk_index: index as u32,
                        text: text.to_string(),
                        token_count: text.split_whitespace().count(),
                        page_start: 1,
                        page_end: 1,
                        embedding_ref: chunk_id,
                        embedding: model.embed_text(text),
                    }
                })
                .collect();
            self.metadata.commit_generation(&doc, &chunks).await.expect("seed");

            if state != LifecycleState::PendingReview {
                self.sync
                    .on_lifecycle_transition(id, Some(LifecycleState::PendingReview), Some(state))
                    .await
                    .expect("sync");
            }
        }
    }

    fn embedder() -> EmbedderClient {
        EmbedderClient::new(
            Arc::new(CharacterNgramEmbedder {
                dimensions: DIMENSIONS,
            }),
            EmbeddingConfig {
                retry: RetryPolicy::immediate(1),
                ..Default::default()
            },
        )
    }

    fn fast_config() -> RetrievalConfig {
        RetrievalConfig {
            confidence_threshold: 0.0,
            variant_timeout_ms: 1_000,
            rerank_timeout_ms: 50,
            generation_timeout_ms: 200,
            ..Default::default()
        }
    }

    async fn refund_corpus() -> Harness {
        let h = Harness::new();
        h.seed("doc-a", &["Our refund policy allows returns within 30 days."], LifecycleState::Active, 1).await;
        h.seed("doc-b", &["The refund policy excludes gift cards.", "Shipping is free."], LifecycleState::Active, 2).await;
        h.seed("doc-pending", &["Draft refund policy: no refunds at all."], LifecycleState::PendingReview, 3).await;
        h.seed("doc-rejected", &["Old refund policy text."], LifecycleState::Rejected, 4).await;
        h
    }

    #[tokio::test]
    async fn only_active_documents_are_retrieved() {
        let h = refund_corpus().await;
        let engine = h.engine(fast_config()).with_reranker(Arc::new(LexicalReranker));

        let result = engine
            .retrieve(&RetrievalRequest::new("refund policy", 10), &CancellationToken::never())
            .await
            .expect("retrieves");

        assert!(!result.chunks.is_empty());
        let documents: HashSet<&str> = result.chunks.iter().map(|c| c.document_id.as_str()).collect();
        assert!(documents.is_subset(&HashSet::from(["doc-a", "doc-b"])));
        assert!(result.reranked);
        assert!(!result.degraded());
    }

    #[tokio::test]
    async fn reranker_timeout_keeps_vector_order() {
        let h = refund_corpus().await;
        let engine = h
            .engine(fast_config())
            .with_reranker(Arc::new(SlowReranker(Duration::from_secs(5))));

        let result = engine
            .retrieve(&RetrievalRequest::new("refund policy", 10), &CancellationToken::never())
            .await
            .expect("degrades instead of failing");

        assert!(!result.reranked);
        assert!(result.degraded());
        assert!(matches!(result.warnings[0], RetrievalWarning::RerankFailed(_)));
        assert!(result
            .chunks
            .windows(2)
            .all(|pair| pair[0].vector_score >= pair[1].vector_score));
        assert!(result.chunks.iter().all(|c| c.score == c.vector_score));
    }

    #[tokio::test]
    async fn reranking_only_reorders_the_candidate_set() {
        let h = refund_corpus().await;
        let request = RetrievalRequest::new("refund policy", 10);

        let plain = h
            .engine(fast_config())
            .retrieve(&request, &CancellationToken::never())
            .await
            .expect("plain");
        let reranked = h
            .engine(fast_config())
            .with_reranker(Arc::new(LexicalReranker))
            .retrieve(&request, &CancellationToken::never())
            .await
            .expect("reranked");

        let ids = |chunks: &[RankedChunk]| chunks.iter().map(|c| c.chunk_id.clone()).collect::<HashSet<_>>();
        assert_eq!(ids(&plain.chunks), ids(&reranked.chunks));

        let again = h
            .engine(fast_config())
            .with_reranker(Arc::new(LexicalReranker))
            .retrieve(&request, &CancellationToken::never())
            .await
            .expect("repeat");
        assert_eq!(reranked.chunks, again.chunks);
    }

    #[tokio::test]
    async fn expansion_failure_falls_back_to_original_query() {
        let h = refund_corpus().await;
        let engine = h
            .engine(fast_config())
            .with_expander(Arc::new(FixedGenerator(Err("model overloaded".to_string()))));

        let result = engine
            .retrieve(&RetrievalRequest::new("refund policy", 5), &CancellationToken::never())
            .await
            .expect("retrieves");

        assert_eq!(result.query_variants, vec!["refund policy".to_string()]);
        assert!(matches!(result.warnings[0], RetrievalWarning::ExpansionFailed(_)));
        assert!(!result.chunks.is_empty());
    }

    #[tokio::test]
    async fn expanded_variants_are_searched_alongside_the_query() {
        let h = refund_corpus().await;
        let engine = h.engine(fast_config()).with_expander(Arc::new(FixedGenerator(Ok(
            "1. money back rules\n2. refund policy\n3. return window".to_string(),
        ))));

        let result = engine
            .retrieve(&RetrievalRequest::new("refund policy", 5), &CancellationToken::never())
            .await
            .expect("retrieves");

        assert_eq!(
            result.query_variants,
            vec!["refund policy", "money back rules", "return window"]
        );
        let unique: HashSet<&str> = result.chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(unique.len(), result.chunks.len());
    }

    #[tokio::test]
    async fn unreachable_vector_index_is_fatal() {
        let h = refund_corpus().await;
        let engine = RetrievalEngine::new(
            h.metadata.clone(),
            Arc::new(DownVectorIndex),
            h.facets.clone(),
            embedder(),
            fast_config(),
        );

        let error = engine
            .retrieve(&RetrievalRequest::new("refund policy", 5), &CancellationToken::never())
            .await
            .expect_err("no variant can be served");
        assert!(matches!(error, RetrievalError::VectorIndexUnavailable(_)));
    }

    #[tokio::test]
    async fn facet_filters_restrict_candidates() {
        let h = refund_corpus().await;
        let engine = h.engine(fast_config());
        let mut request = RetrievalRequest::new("refund policy", 10);
        request.filters.tags = vec!["even".to_string()];

        let result = engine
            .retrieve(&request, &CancellationToken::never())
            .await
            .expect("retrieves");

        assert!(!result.chunks.is_empty());
        assert!(result.chunks.iter().all(|c| c.document_id == "doc-b"));
    }

    #[tokio::test]
    async fn facet_outage_falls_back_to_metadata_filtering() {
        let h = refund_corpus().await;
        let engine = RetrievalEngine::new(
            h.metadata.clone(),
            h.vectors.clone(),
            Arc::new(FailingFacetIndex),
            embedder(),
            fast_config(),
        );
        let mut request = RetrievalRequest::new("refund policy", 10);
        request.filters.tags = vec!["odd".to_string()];

        let result = engine
            .retrieve(&request, &CancellationToken::never())
            .await
            .expect("degrades");

        assert!(matches!(result.warnings[0], RetrievalWarning::FacetSearchFailed(_)));
        assert!(!result.chunks.is_empty());
        assert!(result.chunks.iter().all(|c| c.document_id == "doc-a"));
    }

    #[tokio::test]
    async fn low_confidence_broadens_once() {
        let h = refund_corpus().await;
        let engine = h
            .engine(RetrievalConfig {
                top_k: 1,
                top_m: 1,
                confidence_threshold: 2.0,
                ..fast_config()
            })
            .with_reranker(Arc::new(LexicalReranker));

        let result = engine
            .retrieve(&RetrievalRequest::new("refund policy", 1), &CancellationToken::never())
            .await
            .expect("retrieves");

        assert!(result.refined);
        assert_eq!(result.chunks.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_the_query() {
        let h = refund_corpus().await;
        let engine = h
            .engine(RetrievalConfig {
                rerank_timeout_ms: 10_000,
                ..fast_config()
            })
            .with_reranker(Arc::new(SlowReranker(Duration::from_secs(10))));
        let (handle, token) = cancellation_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(2),
            engine.retrieve(&RetrievalRequest::new("refund policy", 5), &token),
        )
        .await
        .expect("cancellation is prompt");

        assert!(matches!(result, Err(RetrievalError::Cancelled)));
        canceller.await.expect("canceller finished");
    }

    #[test]
    fn ties_break_by_recency_then_chunk_index() {
        let at = |day| Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).single().expect("date");
        let chunk = |id: &str, index: u32, day: u32| RankedChunk {
            chunk_id: id.to_string(),
            document_id: format!("doc-{day}"),
            chunk_index: index,
            filename: "f.txt".to_string(),
            page_start: 1,
            page_end: 1,
            text: String::new(),
            token_count: 0,
            uploaded_at: at(day),
            score: 0.5,
            vector_score: 0.5,
        };

        let mut chunks = vec![chunk("c", 1, 1), chunk("b", 2, 2), chunk("a", 0, 1), chunk("d", 0, 2)];
        chunks.sort_by(rank_order);

        let order: Vec<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
    }
}
