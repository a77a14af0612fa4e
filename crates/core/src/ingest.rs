//! Upload pipeline: extract, anonymize, chunk, embed, persist.
//!
//! Stages before persistence write nothing except the content-addressed
//! source object, so an extraction failure leaves no document behind. The
//! persist stage runs on its own task and is never cancelled by a dropped
//! caller.

use crate::anonymizer::{AnonymizedText, Anonymizer};
use crate::chunking::{chunk_pages, ChunkDraft, ChunkingConfig};
use crate::embeddings::EmbedderClient;
use crate::error::{ExtractionError, IngestError, ServiceError};
use crate::extractor::extract_document;
use crate::models::{
    Document, DocumentFlags, FileType, IngestOutcome, LifecycleState, UploadMetadata,
};
use crate::stores::content_hash;
use crate::sync::IndexSynchronizer;
use crate::traits::{MetadataStore, ObjectStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestionConfig {
    pub max_document_bytes: u64,
    pub allowed_file_types: Vec<FileType>,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: 10 * 1024 * 1024,
            allowed_file_types: vec![FileType::Pdf, FileType::Text, FileType::Markdown],
        }
    }
}

/// Files under `folder` whose extension maps to an allowed type, sorted.
pub fn discover_documents(folder: &Path, allowed: &[FileType]) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(FileType::from_extension)
            .is_some_and(|file_type| allowed.contains(&file_type));

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderIngestReport {
    pub ingested: Vec<IngestOutcome>,
    pub skipped: Vec<SkippedDocument>,
}

/// Everything produced before the persist stage.
struct PreparedGeneration {
    file_type: FileType,
    page_count: u32,
    object_locator: String,
    anonymized: AnonymizedText,
    drafts: Vec<ChunkDraft>,
    vectors: Vec<Vec<f32>>,
}

enum PrepareFailure {
    Extraction(ExtractionError),
    Embedding {
        object_locator: String,
        file_type: FileType,
        page_count: u32,
        attempts: u32,
        source: ServiceError,
    },
    Other(IngestError),
}

impl From<IngestError> for PrepareFailure {
    fn from(error: IngestError) -> Self {
        PrepareFailure::Other(error)
    }
}

pub struct IngestionCoordinator {
    metadata: Arc<dyn MetadataStore>,
    objects: Arc<dyn ObjectStore>,
    embedder: EmbedderClient,
    anonymizer: Arc<Anonymizer>,
    synchronizer: Arc<IndexSynchronizer>,
    chunking: ChunkingConfig,
    config: IngestionConfig,
}

fn pii_metadata(document: &mut Document, anonymized: &AnonymizedText) {
    document
        .metadata
        .insert("pii_detected".to_string(), json!(!anonymized.spans.is_empty()));
    document
        .metadata
        .insert("pii_count".to_string(), json!(anonymized.spans.len()));
    document
        .metadata
        .insert("pii_types".to_string(), json!(anonymized.categories()));
}

impl IngestionCoordinator {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: Arc<dyn ObjectStore>,
        embedder: EmbedderClient,
        anonymizer: Arc<Anonymizer>,
        synchronizer: Arc<IndexSynchronizer>,
        chunking: ChunkingConfig,
        config: IngestionConfig,
    ) -> Self {
        Self {
            metadata,
            objects,
            embedder,
            anonymizer,
            synchronizer,
            chunking,
            config,
        }
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Ingests one upload. Identical bytes from the same uploader resolve to
    /// the existing non-rejected document; one whose last attempt failed is
    /// rebuilt in place.
    pub async fn ingest(&self, bytes: &[u8], upload: UploadMetadata) -> Result<IngestOutcome, IngestError> {
        if upload.uploader_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("uploader id is required".to_string()));
        }
        if upload.filename.trim().is_empty() {
            return Err(IngestError::InvalidArgument("filename is required".to_string()));
        }
        let size = bytes.len() as u64;
        if size > self.config.max_document_bytes {
            return Err(ExtractionError::TooLarge {
                size,
                limit: self.config.max_document_bytes,
            }
            .into());
        }

        let hash = content_hash(bytes);
        let _content_lease = self
            .metadata
            .lock_document(&format!("content:{}:{}", upload.uploader_id, hash))
            .await;

        if let Some(existing) = self
            .metadata
            .find_by_content_hash(&upload.uploader_id, &hash)
            .await?
        {
            if existing.flags.ingestion_error.is_none() {
                return self.reused(existing).await;
            }

            let _lease = self.metadata.lock_document(&existing.document_id).await;
            // A delete or review decision may have landed while we waited.
            match self.metadata.get_document(&existing.document_id).await? {
                Some(current) if current.state != LifecycleState::Rejected => {
                    if current.flags.ingestion_error.is_none() {
                        return self.reused(current).await;
                    }
                    info!(document_id = %current.document_id, "retrying failed ingestion");
                    return self.run(bytes, current).await;
                }
                _ => {
                    info!(
                        document_id = %existing.document_id,
                        "failed document was removed or rejected, ingesting as new"
                    );
                }
            }
        }

        let document = Document {
            document_id: uuid::Uuid::new_v4().to_string(),
            filename: upload.filename,
            content_hash: hash,
            byte_size: size,
            file_type: FileType::Text,
            uploader_id: upload.uploader_id,
            uploaded_at: Utc::now(),
            state: LifecycleState::PendingReview,
            visible: false,
            generation: 0,
            object_locator: None,
            page_count: 0,
            metadata: upload.metadata,
            tags: upload.tags,
            flags: DocumentFlags::default(),
        };
        self.run_with_hint(bytes, document, upload.mime_type.as_deref()).await
    }

    async fn reused(&self, existing: Document) -> Result<IngestOutcome, IngestError> {
        let chunk_count = self
            .metadata
            .chunks_for_document(&existing.document_id)
            .await?
            .len();
        info!(document_id = %existing.document_id, "duplicate upload resolved to existing document");
        Ok(IngestOutcome {
            document_id: existing.document_id,
            reused_existing: true,
            generation: existing.generation,
            chunk_count,
            needs_manual_review: existing.flags.needs_manual_review,
            redactions: Vec::new(),
        })
    }

    /// Rebuilds the chunk generation of an existing document from its
    /// stored source bytes.
    pub async fn reprocess(&self, document_id: &str) -> Result<IngestOutcome, IngestError> {
        let _lease = self.metadata.lock_document(document_id).await;
        let document = self
            .metadata
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;
        let locator = document
            .object_locator
            .clone()
            .ok_or_else(|| IngestError::MissingSource(document_id.to_string()))?;
        let bytes = self.objects.get(&locator).await?;

        info!(document_id, generation = document.generation, "reprocessing document");
        self.run(&bytes, document).await
    }

    pub async fn ingest_path(
        &self,
        path: &Path,
        uploader_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<IngestOutcome, IngestError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| IngestError::InvalidArgument(format!("{}: {error}", path.display())))?;
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::InvalidArgument(format!("path missing filename: {}", path.display()))
            })?;

        self.ingest(
            &bytes,
            UploadMetadata {
                filename: filename.to_string(),
                mime_type: None,
                uploader_id: uploader_id.to_string(),
                tags: tags.clone(),
                metadata: Default::default(),
            },
        )
        .await
    }

    /// Best effort over every supported file below `folder`.
    pub async fn ingest_folder(
        &self,
        folder: &Path,
        uploader_id: &str,
        tags: &BTreeSet<String>,
    ) -> Result<FolderIngestReport, IngestError> {
        let files = discover_documents(folder, &self.config.allowed_file_types);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported documents found in {}",
                folder.display()
            )));
        }

        let mut report = FolderIngestReport::default();
        for path in files {
            match self.ingest_path(&path, uploader_id, tags).await {
                Ok(outcome) => report.ingested.push(outcome),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping document");
                    report.skipped.push(SkippedDocument {
                        path,
                        reason: error.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn run(&self, bytes: &[u8], document: Document) -> Result<IngestOutcome, IngestError> {
        let mime = document.file_type.mime_type();
        self.run_with_hint(bytes, document, Some(mime)).await
    }

    /// Runs the stages for `base`, a new document (generation 0, not yet
    /// stored) or an existing one whose generation is replaced.
    async fn run_with_hint(
        &self,
        bytes: &[u8],
        mut base: Document,
        mime_type: Option<&str>,
    ) -> Result<IngestOutcome, IngestError> {
        let started = Instant::now();
        let stored = base.object_locator.is_some() || base.generation > 0 || base.flags.ingestion_error.is_some();

        let prepared = match self.prepare(bytes, &base.filename, mime_type, &base.document_id).await {
            Ok(prepared) => prepared,
            Err(PrepareFailure::Extraction(error)) => {
                warn!(document_id = %base.document_id, error = %error, "extraction failed");
                return Err(error.into());
            }
            Err(PrepareFailure::Other(error)) => return Err(error),
            Err(PrepareFailure::Embedding {
                object_locator,
                file_type,
                page_count,
                attempts,
                source,
            }) => {
                let reason = format!("embedding failed after {attempts} attempt(s): {source}");
                warn!(document_id = %base.document_id, attempts, error = %source, "embedding failed, marking document");

                base.flags.ingestion_error = Some(reason);
                if stored {
                    self.metadata
                        .update_flags(&base.document_id, &base.flags)
                        .await?;
                } else {
                    base.file_type = file_type;
                    base.page_count = page_count;
                    base.object_locator = Some(object_locator);
                    self.metadata.insert_document(&base).await?;
                }

                return Err(IngestError::EmbeddingService {
                    document_id: base.document_id,
                    attempts,
                    source,
                });
            }
        };

        let previous_state = stored.then_some(base.state);
        let generation = base.generation + 1;
        base.generation = generation;
        base.file_type = prepared.file_type;
        base.page_count = prepared.page_count;
        base.object_locator = Some(prepared.object_locator);
        base.flags = DocumentFlags {
            needs_manual_review: prepared.anonymized.degraded(),
            ingestion_error: None,
        };
        pii_metadata(&mut base, &prepared.anonymized);

        let vectors = prepared.vectors;
        let chunks: Vec<_> = prepared
            .drafts
            .into_iter()
            .zip(vectors)
            .map(|(draft, vector)| draft.into_chunk(&base.document_id, generation, vector))
            .collect();
        let chunk_count = chunks.len();

        let metadata = Arc::clone(&self.metadata);
        let document = base;
        let persisted = tokio::spawn(async move {
            metadata
                .commit_generation(&document, &chunks)
                .await
                .map(|stale| (document, stale))
        })
        .await
        .map_err(|error| IngestError::Task(error.to_string()))??;
        let (document, stale) = persisted;

        match previous_state {
            None => {
                self.synchronizer
                    .on_lifecycle_transition(&document.document_id, None, Some(document.state))
                    .await?;
            }
            Some(LifecycleState::Active) => {
                self.synchronizer
                    .refresh_generation(&document.document_id, &stale)
                    .await?;
            }
            Some(_) => {}
        }

        info!(
            document_id = %document.document_id,
            generation,
            chunk_count,
            redactions = prepared.anonymized.spans.len(),
            needs_manual_review = document.flags.needs_manual_review,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "document ingested"
        );

        Ok(IngestOutcome {
            document_id: document.document_id,
            reused_existing: false,
            generation,
            chunk_count,
            needs_manual_review: document.flags.needs_manual_review,
            redactions: prepared.anonymized.spans,
        })
    }

    async fn prepare(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: Option<&str>,
        document_id: &str,
    ) -> Result<PreparedGeneration, PrepareFailure> {
        let extracted = extract_document(bytes, filename, mime_type, &self.config.allowed_file_types)
            .map_err(PrepareFailure::Extraction)?;

        let anonymized = self.anonymizer.anonymize_pages(&extracted.pages);
        if anonymized.degraded() {
            warn!(
                document_id,
                failures = anonymized.failures.len(),
                "anonymization degraded, document needs manual review"
            );
        }

        let drafts = chunk_pages(&anonymized.pages, &self.chunking);
        if drafts.is_empty() {
            return Err(PrepareFailure::Extraction(ExtractionError::Empty(
                "no text left after anonymization".to_string(),
            )));
        }

        let object_locator = self
            .objects
            .put(bytes)
            .await
            .map_err(|error| PrepareFailure::Other(error.into()))?;

        let texts: Vec<String> = drafts.iter().map(|draft| draft.text.clone()).collect();
        let vectors = match self.embedder.embed_all(&texts).await {
            Ok(vectors) => vectors,
            Err(exhausted) => {
                return Err(PrepareFailure::Embedding {
                    object_locator,
                    file_type: extracted.file_type,
                    page_count: extracted.page_count(),
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        };

        Ok(PreparedGeneration {
            file_type: extracted.file_type,
            page_count: extracted.page_count(),
            object_locator,
            anonymized,
            drafts,
            vectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingConfig};
    use crate::retry::RetryPolicy;
    use crate::stores::{
        InMemoryFacetIndex, InMemoryMetadataStore, InMemoryObjectStore, InMemoryVectorIndex,
    };
    use crate::test_support::{words, SwitchableEmbedder};
    use std::fs::{self, File};
    use std::io::Write;
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    struct Fixture {
        metadata: Arc<InMemoryMetadataStore>,
        embedder: Arc<SwitchableEmbedder>,
        coordinator: IngestionCoordinator,
    }

    fn fixture() -> Fixture {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let embedder = Arc::new(SwitchableEmbedder::new(CharacterNgramEmbedder { dimensions: 16 }));
        let synchronizer = Arc::new(IndexSynchronizer::new(
            metadata.clone(),
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(InMemoryFacetIndex::new()),
            RetryPolicy::immediate(1),
        ));
        let coordinator = IngestionCoordinator::new(
            metadata.clone(),
            Arc::new(InMemoryObjectStore::new()),
            EmbedderClient::new(
                embedder.clone(),
                EmbeddingConfig {
                    batch_size: 4,
                    max_concurrency: 2,
                    retry: RetryPolicy::immediate(2),
                },
            ),
            Arc::new(Anonymizer::with_default_detectors()),
            synchronizer,
            ChunkingConfig {
                target_tokens: 40,
                overlap_ratio: 0.125,
            },
            IngestionConfig::default(),
        );
        Fixture {
            metadata,
            embedder,
            coordinator,
        }
    }

    fn upload(filename: &str) -> UploadMetadata {
        UploadMetadata {
            filename: filename.to_string(),
            uploader_id: "alice".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn new_documents_start_pending_with_contiguous_chunks() {
        let f = fixture();
        let outcome = f
            .coordinator
            .ingest(words(130).as_bytes(), upload("notes.txt"))
            .await
            .expect("ingests");

        let document = f
            .metadata
            .get_document(&outcome.document_id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(document.state, LifecycleState::PendingReview);
        assert!(!document.visible);
        assert_eq!(document.generation, 1);

        let chunks = f.metadata.chunks_for_document(&outcome.document_id).await.expect("chunks");
        assert_eq!(chunks.len(), outcome.chunk_count);
        for (index, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, index as u32);
            assert_eq!(chunk.embedding.len(), 16);
        }
    }

    #[tokio::test]
    async fn identical_upload_returns_the_same_document() {
        let f = fixture();
        let first = f
            .coordinator
            .ingest(b"Refund policy text.", upload("a.txt"))
            .await
            .expect("first");
        let second = f
            .coordinator
            .ingest(b"Refund policy text.", upload("copy.txt"))
            .await
            .expect("second");

        assert_eq!(first.document_id, second.document_id);
        assert!(second.reused_existing);
        assert_eq!(f.metadata.document_ids().await.expect("ids").len(), 1);
    }

    #[tokio::test]
    async fn extraction_failure_leaves_no_document() {
        let f = fixture();
        let result = f
            .coordinator
            .ingest(b"%PDF-1.4\n%broken", upload("broken.pdf"))
            .await;

        assert!(matches!(result, Err(IngestError::Extraction(ExtractionError::PdfParse(_)))));
        assert!(f.metadata.document_ids().await.expect("ids").is_empty());
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_up_front() {
        let f = fixture();
        let big = vec![b'a'; (IngestionConfig::default().max_document_bytes + 1) as usize];
        let result = f.coordinator.ingest(&big, upload("big.txt")).await;
        assert!(matches!(
            result,
            Err(IngestError::Extraction(ExtractionError::TooLarge { .. }))
        ));
    }

    #[tokio::test]
    async fn embedding_outage_flags_document_and_retry_recovers() {
        let f = fixture();
        f.embedder.failing.store(true, Ordering::SeqCst);

        let error = f
            .coordinator
            .ingest(b"Quarterly refund numbers.", upload("q.txt"))
            .await
            .expect_err("embedding is down");
        let IngestError::EmbeddingService { document_id, attempts, .. } = error else {
            panic!("unexpected error: {error}");
        };
        assert_eq!(attempts, 2);

        let flagged = f.metadata.get_document(&document_id).await.expect("read").expect("exists");
        assert_eq!(flagged.state, LifecycleState::PendingReview);
        assert_eq!(flagged.generation, 0);
        assert!(flagged.flags.ingestion_error.is_some());
        assert!(f.metadata.chunks_for_document(&document_id).await.expect("chunks").is_empty());

        f.embedder.failing.store(false, Ordering::SeqCst);
        let retried = f
            .coordinator
            .ingest(b"Quarterly refund numbers.", upload("q.txt"))
            .await
            .expect("retry succeeds");

        assert_eq!(retried.document_id, document_id);
        assert!(!retried.reused_existing);
        let recovered = f.metadata.get_document(&document_id).await.expect("read").expect("exists");
        assert!(recovered.flags.ingestion_error.is_none());
        assert_eq!(recovered.generation, 1);
    }

    /// Leaves a flagged document behind, then re-uploads the same bytes while
    /// `decide` runs under the document's lease.
    async fn retry_racing<F, Fut>(decide: F) -> (String, IngestOutcome, Arc<InMemoryMetadataStore>)
    where
        F: FnOnce(Arc<InMemoryMetadataStore>, String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let f = fixture();
        f.embedder.failing.store(true, Ordering::SeqCst);
        let error = f
            .coordinator
            .ingest(b"Quarterly refund numbers.", upload("q.txt"))
            .await
            .expect_err("embedding is down");
        let IngestError::EmbeddingService { document_id, .. } = error else {
            panic!("unexpected error: {error}");
        };
        f.embedder.failing.store(false, Ordering::SeqCst);

        let lease = f.metadata.lock_document(&document_id).await;
        let coordinator = Arc::new(f.coordinator);
        let retry = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move {
                coordinator
                    .ingest(b"Quarterly refund numbers.", upload("q.txt"))
                    .await
            }
        });
        // Let the retry find the flagged document and queue on its lease.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        decide(Arc::clone(&f.metadata), document_id.clone()).await;
        drop(lease);

        let outcome = retry.await.expect("join").expect("retry ingests");
        (document_id, outcome, f.metadata)
    }

    #[tokio::test]
    async fn retry_does_not_resurrect_a_document_deleted_meanwhile() {
        let (deleted, outcome, metadata) = retry_racing(|metadata, id| async move {
            assert!(metadata.delete_document(&id).await.expect("delete"));
        })
        .await;

        assert_ne!(outcome.document_id, deleted);
        assert!(!outcome.reused_existing);
        assert!(metadata.get_document(&deleted).await.expect("read").is_none());
        let fresh = metadata
            .get_document(&outcome.document_id)
            .await
            .expect("read")
            .expect("new document");
        assert_eq!(fresh.state, LifecycleState::PendingReview);
        assert_eq!(fresh.generation, 1);
    }

    #[tokio::test]
    async fn retry_leaves_a_document_rejected_meanwhile_alone() {
        let (rejected, outcome, metadata) = retry_racing(|metadata, id| async move {
            metadata
                .update_state(&id, LifecycleState::Rejected, false)
                .await
                .expect("reject");
        })
        .await;

        assert_ne!(outcome.document_id, rejected);
        let old = metadata.get_document(&rejected).await.expect("read").expect("kept");
        assert_eq!(old.state, LifecycleState::Rejected);
        assert_eq!(old.generation, 0);
    }

    #[tokio::test]
    async fn pii_summary_lands_in_metadata() {
        let f = fixture();
        let outcome = f
            .coordinator
            .ingest(b"Contact ops@example.com about refunds.", upload("pii.txt"))
            .await
            .expect("ingests");

        let document = f
            .metadata
            .get_document(&outcome.document_id)
            .await
            .expect("read")
            .expect("exists");
        assert_eq!(document.metadata.get("pii_detected"), Some(&json!(true)));
        assert_eq!(document.metadata.get("pii_count"), Some(&json!(1)));
        assert_eq!(document.metadata.get("pii_types"), Some(&json!(["EMAIL"])));

        let chunks = f.metadata.chunks_for_document(&outcome.document_id).await.expect("chunks");
        assert!(chunks[0].text.contains("[REDACTED:EMAIL]"));
        assert!(!chunks[0].text.contains("ops@example.com"));
    }

    #[tokio::test]
    async fn reprocess_swaps_in_a_new_generation() {
        let f = fixture();
        let outcome = f
            .coordinator
            .ingest(words(90).as_bytes(), upload("doc.txt"))
            .await
            .expect("ingests");
        let before = f.metadata.chunks_for_document(&outcome.document_id).await.expect("chunks");

        let again = f.coordinator.reprocess(&outcome.document_id).await.expect("reprocess");
        let after = f.metadata.chunks_for_document(&outcome.document_id).await.expect("chunks");

        assert_eq!(again.generation, 2);
        assert_eq!(before.len(), after.len());
        assert!(before.iter().zip(&after).all(|(old, new)| old.chunk_id != new.chunk_id));
        assert!(after.iter().all(|chunk| chunk.generation == 2));
    }

    #[test]
    fn discovery_is_recursive_and_type_aware() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(nested.join("b.md"), b"# notes")?;
        fs::write(nested.join("c.png"), b"\x89PNG")?;

        let all = discover_documents(base, &IngestionConfig::default().allowed_file_types);
        assert_eq!(all.len(), 2);

        let only_pdf = discover_documents(base, &[FileType::Pdf]);
        assert_eq!(only_pdf.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn folder_ingest_skips_unreadable_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join("good.txt"), b"Refunds are issued within 30 days.")?;
        fs::write(dir.path().join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;

        let f = fixture();
        let report = f
            .coordinator
            .ingest_folder(dir.path(), "alice", &BTreeSet::new())
            .await?;

        assert_eq!(report.ingested.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            report.skipped[0].path.file_name().and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }
}
