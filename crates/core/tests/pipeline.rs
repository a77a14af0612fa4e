use async_trait::async_trait;
use docgate_core::{
    assemble, Backends, CancellationToken, CharacterNgramEmbedder, FacetIndex, FacetQuery,
    FacetSearchResult, FsObjectStore, GenerationService, InMemoryFacetIndex,
    InMemoryMetadataStore, InMemoryObjectStore, InMemoryVectorIndex, IngestOutcome,
    KnowledgeBase, LexicalReranker, LifecycleError, LifecycleState, MetadataStore, ModelServices,
    PipelineConfig, RankedChunk, RerankService, RetrievalRequest, RetrievalWarning, RetryPolicy,
    SearchIndexEntry, SearchRequest, ServiceError, SqliteMetadataStore, UploadMetadata,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct SlowReranker;

#[async_trait]
impl RerankService for SlowReranker {
    async fn score(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>, ServiceError> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(vec![1.0; texts.len()])
    }
}

struct CannedGenerator;

#[async_trait]
impl GenerationService for CannedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, ServiceError> {
        if prompt.starts_with("Rewrite the search query") {
            return Ok(String::new());
        }
        Ok("Refunds are accepted within 30 days [1].".to_string())
    }
}

/// Fails the first `failures` upserts, then behaves like the in-memory index.
struct FlakyFacetIndex {
    inner: InMemoryFacetIndex,
    failures: AtomicUsize,
}

#[async_trait]
impl FacetIndex for FlakyFacetIndex {
    async fn upsert(&self, entry: &SearchIndexEntry) -> Result<(), ServiceError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::Timeout("facet index".to_string()));
        }
        self.inner.upsert(entry).await
    }

    async fn delete(&self, document_id: &str) -> Result<(), ServiceError> {
        self.inner.delete(document_id).await
    }

    async fn search(&self, query: &FacetQuery) -> Result<FacetSearchResult, ServiceError> {
        self.inner.search(query).await
    }
}

struct Fixture {
    kb: KnowledgeBase,
    metadata: Arc<InMemoryMetadataStore>,
    vectors: Arc<InMemoryVectorIndex>,
}

fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sync.retry = RetryPolicy::immediate(2);
    config.embedding.retry = RetryPolicy::immediate(1);
    config
}

fn fixture_with(
    config: PipelineConfig,
    facets: Arc<dyn FacetIndex>,
    reranker: Option<Arc<dyn RerankService>>,
    generator: Option<Arc<dyn GenerationService>>,
) -> Fixture {
    let metadata = Arc::new(InMemoryMetadataStore::new());
    let vectors = Arc::new(InMemoryVectorIndex::new());
    let kb = KnowledgeBase::new(
        Backends {
            metadata: metadata.clone(),
            objects: Arc::new(InMemoryObjectStore::new()),
            vectors: vectors.clone(),
            facets,
        },
        ModelServices {
            embedding: Arc::new(CharacterNgramEmbedder::default()),
            reranker,
            generator,
        },
        config,
    );
    Fixture {
        kb,
        metadata,
        vectors,
    }
}

fn fixture() -> Fixture {
    fixture_with(
        test_config(),
        Arc::new(InMemoryFacetIndex::new()),
        Some(Arc::new(LexicalReranker)),
        None,
    )
}

fn upload(filename: &str) -> UploadMetadata {
    UploadMetadata {
        filename: filename.to_string(),
        uploader_id: "alice".to_string(),
        ..Default::default()
    }
}

async fn ingest(kb: &KnowledgeBase, filename: &str, text: &str) -> IngestOutcome {
    kb.ingest(text.as_bytes(), upload(filename))
        .await
        .expect("ingest succeeds")
}

async fn ingest_active(kb: &KnowledgeBase, filename: &str, text: &str) -> String {
    let outcome = ingest(kb, filename, text).await;
    kb.approve(&outcome.document_id).await.expect("approve");
    outcome.document_id
}

fn cited_documents(chunks: &[RankedChunk]) -> HashSet<String> {
    chunks.iter().map(|chunk| chunk.document_id.clone()).collect()
}

#[tokio::test]
async fn three_page_upload_makes_four_overlapping_chunks() {
    let f = fixture();
    let pages: Vec<String> = (0..3)
        .map(|page| {
            (1..=400)
                .map(|n| {
                    let word = page * 400 + n;
                    if word % 10 == 0 {
                        format!("w{word}.")
                    } else {
                        format!("w{word}")
                    }
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    let text = pages.join("\u{c}");

    let outcome = ingest(&f.kb, "manual.txt", &text).await;
    assert_eq!(outcome.chunk_count, 4);

    let chunks = f
        .metadata
        .chunks_for_document(&outcome.document_id)
        .await
        .expect("chunks");
    let indices: Vec<u32> = chunks.iter().map(|chunk| chunk.chunk_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert!(chunks.iter().all(|chunk| chunk.token_count <= 400));

    for pair in chunks.windows(2) {
        let previous: Vec<&str> = pair[0].text.split_whitespace().collect();
        let next_head = pair[1].text.split_whitespace().next().expect("non-empty chunk");
        let overlap = previous.len()
            - previous
                .iter()
                .position(|word| *word == next_head)
                .expect("next chunk starts inside the previous one");
        assert!((40..=60).contains(&overlap), "overlap was {overlap}");
    }
    assert_eq!(chunks[0].page_start, 1);
    assert_eq!(chunks[3].page_end, 3);
}

#[tokio::test]
async fn identical_reupload_returns_the_same_document() {
    let f = fixture();
    let first = ingest(&f.kb, "policy.txt", "Refund policy: thirty days.").await;
    f.kb.approve(&first.document_id).await.expect("approve");

    let again = ingest(&f.kb, "policy-copy.txt", "Refund policy: thirty days.").await;

    assert!(again.reused_existing);
    assert_eq!(again.document_id, first.document_id);
    let page = f.kb.list_documents(&Default::default()).await.expect("list");
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn refund_policy_query_only_cites_active_documents() {
    let f = fixture();
    let hardware = ingest_active(&f.kb, "hardware.txt", "The refund policy for hardware is 30 days.").await;
    let software = ingest_active(&f.kb, "software.txt", "The refund policy for software is 14 days.").await;
    let draft = ingest(&f.kb, "draft.txt", "Draft refund policy: no refunds whatsoever.").await;

    let ranked = f
        .kb
        .retrieve(&RetrievalRequest::new("refund policy", 10), &CancellationToken::never())
        .await
        .expect("retrieve");
    assert_eq!(
        cited_documents(&ranked.chunks),
        HashSet::from([hardware.clone(), software.clone()])
    );

    let answer = f.kb.ask("refund policy").await.expect("ask");
    assert!(answer
        .citations
        .iter()
        .all(|citation| citation.document_id != draft.document_id));

    let search = f
        .kb
        .search(&SearchRequest {
            query: "refund policy".to_string(),
            ..Default::default()
        })
        .await
        .expect("search");
    let found: HashSet<String> = search.hits.iter().map(|hit| hit.document_id.clone()).collect();
    assert_eq!(found, HashSet::from([hardware, software]));
}

#[tokio::test]
async fn reranker_timeout_still_answers_from_vector_order() {
    let mut config = test_config();
    config.retrieval.rerank_timeout_ms = 50;
    let f = fixture_with(
        config,
        Arc::new(InMemoryFacetIndex::new()),
        Some(Arc::new(SlowReranker)),
        Some(Arc::new(CannedGenerator)),
    );
    ingest_active(&f.kb, "refunds.txt", "Refunds are accepted within 30 days of purchase.").await;

    let answer = f.kb.ask("refund window").await.expect("ask degrades, not fails");

    assert!(answer.degraded);
    assert!(answer.answer.is_some());
    assert!(!answer.citations.is_empty());
    assert!(answer
        .warnings
        .iter()
        .any(|warning| matches!(warning, RetrievalWarning::RerankFailed(_))));
}

#[tokio::test]
async fn approval_converges_after_transient_index_failure() {
    let facets = Arc::new(FlakyFacetIndex {
        inner: InMemoryFacetIndex::new(),
        failures: AtomicUsize::new(2),
    });
    let f = fixture_with(test_config(), facets, Some(Arc::new(LexicalReranker)), None);
    let outcome = ingest(&f.kb, "refunds.txt", "Refund policy: thirty days.").await;

    let error = f
        .kb
        .approve(&outcome.document_id)
        .await
        .expect_err("facet index down for every attempt");
    assert!(matches!(error, LifecycleError::Sync(_)));

    let stored = f
        .kb
        .get_document(&outcome.document_id)
        .await
        .expect("read")
        .expect("exists");
    assert_eq!(stored.state, LifecycleState::Active);
    assert!(!stored.visible);
    let before = f.kb.ask("refund policy").await.expect("ask");
    assert!(before.citations.is_empty());

    let report = f.kb.reconcile().await.expect("reconcile");
    assert!(report.failures.is_empty());

    let after = f.kb.ask("refund policy").await.expect("ask");
    assert_eq!(after.citations[0].document_id, outcome.document_id);
}

#[tokio::test]
async fn deletion_removes_every_trace() {
    let f = fixture();
    let id = ingest_active(&f.kb, "refunds.txt", "Refund policy: thirty days.").await;
    assert!(!f.vectors.document_chunk_ids(&id).await.is_empty());

    assert!(f.kb.delete(&id).await.expect("delete"));

    assert!(f.vectors.document_chunk_ids(&id).await.is_empty());
    assert!(f.metadata.chunks_for_document(&id).await.expect("chunks").is_empty());
    let search = f
        .kb
        .search(&SearchRequest {
            query: "refund".to_string(),
            ..Default::default()
        })
        .await
        .expect("search");
    assert_eq!(search.total, 0);
    let answer = f.kb.ask("refund policy").await.expect("ask");
    assert!(answer.citations.iter().all(|citation| citation.document_id != id));
}

#[tokio::test]
async fn reprocessing_an_active_document_swaps_indexed_generation() {
    let f = fixture();
    let id = ingest_active(&f.kb, "refunds.txt", "Refund policy: thirty days.").await;
    let old_ids = f.vectors.document_chunk_ids(&id).await;

    let outcome = f.kb.reprocess(&id).await.expect("reprocess");
    assert_eq!(outcome.generation, 2);

    let new_ids = f.vectors.document_chunk_ids(&id).await;
    assert_eq!(new_ids.len(), old_ids.len());
    assert!(old_ids.iter().all(|old| !new_ids.contains(old)));

    let answer = f.kb.ask("refund policy").await.expect("ask");
    assert!(answer
        .citations
        .iter()
        .all(|citation| new_ids.contains(&citation.chunk_id)));
}

#[tokio::test]
async fn local_backend_survives_a_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let open = || -> Result<KnowledgeBase, Box<dyn std::error::Error>> {
        Ok(KnowledgeBase::new(
            Backends {
                metadata: Arc::new(SqliteMetadataStore::open(dir.path().join("metadata.sqlite3"))?),
                objects: Arc::new(FsObjectStore::new(dir.path().join("objects"))),
                vectors: Arc::new(InMemoryVectorIndex::new()),
                facets: Arc::new(InMemoryFacetIndex::new()),
            },
            ModelServices {
                embedding: Arc::new(CharacterNgramEmbedder::default()),
                reranker: Some(Arc::new(LexicalReranker)),
                generator: None,
            },
            test_config(),
        ))
    };

    let id = {
        let kb = open()?;
        ingest_active(&kb, "refunds.txt", "Refund policy: thirty days.").await
    };

    let kb = open()?;
    assert!(kb.ask("refund policy").await?.citations.is_empty());

    let report = kb.reconcile().await?;
    assert_eq!(report.projected, 1);
    let answer = kb.ask("refund policy").await?;
    assert_eq!(answer.citations[0].document_id, id);

    let reprocessed = kb.reprocess(&id).await?;
    assert_eq!(reprocessed.generation, 2);
    Ok(())
}

#[tokio::test]
async fn assembler_keeps_whole_chunks_within_budget() {
    let f = fixture();
    let body = |tag: &str| {
        (0..150)
            .map(|n| format!("{tag}{n}"))
            .collect::<Vec<_>>()
            .join(" ")
    };
    for tag in ["a", "b", "c", "d", "e"] {
        ingest_active(&f.kb, &format!("{tag}.txt"), &format!("refund {}", body(tag))).await;
    }

    let ranked = f
        .kb
        .retrieve(&RetrievalRequest::new("refund", 5), &CancellationToken::never())
        .await
        .expect("retrieve");
    assert_eq!(ranked.chunks.len(), 5);
    assert!(ranked.chunks.iter().all(|chunk| chunk.token_count == 151));

    let assembled = assemble("refund", &ranked.chunks, 500);
    assert_eq!(assembled.citations.len(), 3);
    assert_eq!(assembled.token_count, 453);
    assert!(!assembled.truncated);
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Approve,
    Reject,
    Reopen,
    Delete,
    Reprocess,
}

fn action() -> impl Strategy<Value = (Action, usize)> {
    let kind = prop_oneof![
        Just(Action::Approve),
        Just(Action::Reject),
        Just(Action::Reopen),
        Just(Action::Delete),
        Just(Action::Reprocess),
    ];
    (kind, 0..3usize)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn documents_outside_active_are_never_retrieved(actions in prop::collection::vec(action(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let f = fixture();
            let mut ids = Vec::new();
            for (index, text) in [
                "Refund policy for hardware returns.",
                "Refund policy for software licenses.",
                "Refund policy for gift cards.",
            ]
            .iter()
            .enumerate()
            {
                ids.push(ingest(&f.kb, &format!("doc-{index}.txt"), text).await.document_id);
            }

            for (action, target) in actions {
                let id = &ids[target];
                // Illegal transitions and unknown ids are expected here.
                match action {
                    Action::Approve => {
                        let _ = f.kb.approve(id).await;
                    }
                    Action::Reject => {
                        let _ = f.kb.reject(id).await;
                    }
                    Action::Reopen => {
                        let _ = f.kb.reopen(id).await;
                    }
                    Action::Delete => {
                        let _ = f.kb.delete(id).await;
                    }
                    Action::Reprocess => {
                        let _ = f.kb.reprocess(id).await;
                    }
                }

                let ranked = f
                    .kb
                    .retrieve(&RetrievalRequest::new("refund policy", 10), &CancellationToken::never())
                    .await
                    .expect("retrieve");
                for document_id in cited_documents(&ranked.chunks) {
                    let state = f
                        .metadata
                        .get_document(&document_id)
                        .await
                        .expect("read")
                        .map(|document| document.state);
                    prop_assert_eq!(state, Some(LifecycleState::Active));
                }

                let search = f
                    .kb
                    .search(&SearchRequest {
                        query: "refund".to_string(),
                        ..Default::default()
                    })
                    .await
                    .expect("search");
                for hit in search.hits {
                    prop_assert_eq!(hit.status, LifecycleState::Active);
                    let stored = f.metadata.get_document(&hit.document_id).await.expect("read");
                    prop_assert!(stored.is_some_and(|document| document.is_retrievable()));
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}
