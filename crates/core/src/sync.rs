//! Projection of canonical document state into the two indices.
//!
//! A transition is planned as a pure list of [`SyncStep`]s keyed by
//! (old state, new state) and then executed in order. Every step is keyed by
//! document or chunk id, so replaying a plan converges to the same result.
//!
//! Ordering contract:
//! - into `active`: commit state (invisible), project vectors, project
//!   facets, flip `visible` last;
//! - out of `active` or deletion: retract both projections first, then
//!   commit the new state or purge the records.

use crate::error::{IndexSyncError, ServiceError};
use crate::models::{Document, LifecycleState, SearchIndexEntry};
use crate::retry::{with_backoff, RetryPolicy};
use crate::search_cache::SearchCache;
use crate::traits::{FacetIndex, MetadataStore, VectorIndex, VectorIndexEntry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStep {
    /// Writes the state to the metadata store. Entering a new state always
    /// clears `visible`; re-committing the current state changes nothing.
    CommitState(LifecycleState),
    ProjectVectors,
    ProjectFacets,
    MarkVisible,
    RetractVectors,
    RetractFacets,
    PurgeRecords,
}

/// `None` on the new side means deletion; on the old side, a new document.
pub fn plan_transition(old: Option<LifecycleState>, new: Option<LifecycleState>) -> Vec<SyncStep> {
    use SyncStep::*;

    match (old, new) {
        (_, Some(LifecycleState::Active)) => vec![
            CommitState(LifecycleState::Active),
            ProjectVectors,
            ProjectFacets,
            MarkVisible,
        ],
        (None, Some(state)) => vec![CommitState(state)],
        (Some(_), Some(state)) => vec![RetractVectors, RetractFacets, CommitState(state)],
        (_, None) => vec![RetractVectors, RetractFacets, PurgeRecords],
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub documents: usize,
    pub projected: usize,
    pub retracted: usize,
    /// `(document_id, error)` for documents that could not be synchronized.
    pub failures: Vec<(String, String)>,
}

pub struct IndexSynchronizer {
    metadata: Arc<dyn MetadataStore>,
    vectors: Arc<dyn VectorIndex>,
    facets: Arc<dyn FacetIndex>,
    retry: RetryPolicy,
    cache: Option<Arc<SearchCache>>,
}

impl IndexSynchronizer {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        vectors: Arc<dyn VectorIndex>,
        facets: Arc<dyn FacetIndex>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            metadata,
            vectors,
            facets,
            retry,
            cache: None,
        }
    }

    pub fn with_search_cache(mut self, cache: Arc<SearchCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Runs the plan for one transition. The caller must hold the
    /// document's lock for the duration.
    pub async fn on_lifecycle_transition(
        &self,
        document_id: &str,
        old: Option<LifecycleState>,
        new: Option<LifecycleState>,
    ) -> Result<(), IndexSyncError> {
        let steps = plan_transition(old, new);
        info!(
            document_id,
            from = ?old.map(|state| state.as_str()),
            to = ?new.map(|state| state.as_str()),
            steps = steps.len(),
            "synchronizing indices"
        );

        let result = self.execute(document_id, &steps).await;
        self.invalidate_cache();
        result
    }

    /// Re-projects an active document after its chunk generation was
    /// swapped, then removes the replaced chunk ids from the vector index.
    pub async fn refresh_generation(
        &self,
        document_id: &str,
        stale_chunk_ids: &[String],
    ) -> Result<(), IndexSyncError> {
        let document = self.load(document_id).await?;
        if document.state != LifecycleState::Active {
            return Ok(());
        }

        let result = async {
            self.project_vectors(&document).await?;
            self.project_facets(&document).await?;
            self.retract_chunks(document_id, stale_chunk_ids).await?;
            self.metadata.set_visible(document_id, true).await?;
            Ok::<(), IndexSyncError>(())
        }
        .await;
        self.invalidate_cache();

        if result.is_ok() {
            info!(
                document_id,
                generation = document.generation,
                stale = stale_chunk_ids.len(),
                "refreshed chunk generation"
            );
        }
        result
    }

    /// Replays the plan for every document's current state, taking each
    /// document's lock in turn. Only documents the metadata store knows are
    /// visited; index entries of ids it has forgotten are left in place and
    /// are never served, since hydration drops chunks without a record.
    pub async fn reconcile(&self) -> Result<ReconcileReport, IndexSyncError> {
        let ids = self.metadata.document_ids().await?;
        let mut report = ReconcileReport {
            documents: ids.len(),
            ..Default::default()
        };

        for document_id in ids {
            let _lease = self.metadata.lock_document(&document_id).await;
            let Some(document) = self.metadata.get_document(&document_id).await? else {
                continue;
            };

            let steps = plan_transition(Some(document.state), Some(document.state));
            match self.execute(&document_id, &steps).await {
                Ok(()) if document.state == LifecycleState::Active => report.projected += 1,
                Ok(()) => report.retracted += 1,
                Err(error) => {
                    warn!(document_id = %document_id, error = %error, "reconcile failed for document");
                    report.failures.push((document_id.clone(), error.to_string()));
                }
            }
        }

        self.invalidate_cache();
        info!(
            documents = report.documents,
            projected = report.projected,
            retracted = report.retracted,
            failed = report.failures.len(),
            "reconcile finished"
        );
        Ok(report)
    }

    async fn execute(&self, document_id: &str, steps: &[SyncStep]) -> Result<(), IndexSyncError> {
        for step in steps {
            debug!(document_id, step = ?step, "sync step");
            self.apply(document_id, *step).await?;
        }
        Ok(())
    }

    async fn apply(&self, document_id: &str, step: SyncStep) -> Result<(), IndexSyncError> {
        match step {
            SyncStep::CommitState(state) => {
                let document = self.load(document_id).await?;
                if document.state != state {
                    self.metadata.update_state(document_id, state, false).await?;
                }
            }
            SyncStep::ProjectVectors => {
                let document = self.load(document_id).await?;
                self.project_vectors(&document).await?;
            }
            SyncStep::ProjectFacets => {
                let document = self.load(document_id).await?;
                self.project_facets(&document).await?;
            }
            SyncStep::MarkVisible => {
                self.metadata.set_visible(document_id, true).await?;
            }
            SyncStep::RetractVectors => {
                let vectors = &self.vectors;
                with_backoff(
                    self.retry,
                    "vector retract",
                    move || vectors.delete_document(document_id),
                    ServiceError::is_retryable,
                )
                .await
                .map_err(|exhausted| IndexSyncError::Vector {
                    document_id: document_id.to_string(),
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })?;
            }
            SyncStep::RetractFacets => {
                let facets = &self.facets;
                with_backoff(
                    self.retry,
                    "facet retract",
                    move || facets.delete(document_id),
                    ServiceError::is_retryable,
                )
                .await
                .map_err(|exhausted| IndexSyncError::Facet {
                    document_id: document_id.to_string(),
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })?;
            }
            SyncStep::PurgeRecords => {
                self.metadata.delete_document(document_id).await?;
            }
        }
        Ok(())
    }

    async fn load(&self, document_id: &str) -> Result<Document, IndexSyncError> {
        self.metadata
            .get_document(document_id)
            .await?
            .ok_or_else(|| IndexSyncError::MissingDocument(document_id.to_string()))
    }

    async fn project_vectors(&self, document: &Document) -> Result<(), IndexSyncError> {
        let chunks = self.metadata.chunks_for_document(&document.document_id).await?;
        let entries: Vec<VectorIndexEntry> = chunks
            .into_iter()
            .map(|chunk| VectorIndexEntry {
                chunk_id: chunk.embedding_ref,
                document_id: chunk.document_id,
                vector: chunk.embedding,
                state: document.state,
                chunk_index: chunk.chunk_index,
                generation: chunk.generation,
            })
            .collect();

        let vectors = &self.vectors;
        let batch = &entries;
        with_backoff(
            self.retry,
            "vector upsert",
            move || vectors.upsert(batch),
            ServiceError::is_retryable,
        )
        .await
        .map_err(|exhausted| IndexSyncError::Vector {
            document_id: document.document_id.clone(),
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        })?;

        debug!(document_id = %document.document_id, vectors = entries.len(), "projected vectors");
        Ok(())
    }

    async fn project_facets(&self, document: &Document) -> Result<(), IndexSyncError> {
        let chunks = self.metadata.chunks_for_document(&document.document_id).await?;
        let content = chunks
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let entry = SearchIndexEntry::from_document(document, content);

        let facets = &self.facets;
        let entry = &entry;
        with_backoff(
            self.retry,
            "facet upsert",
            move || facets.upsert(entry),
            ServiceError::is_retryable,
        )
        .await
        .map_err(|exhausted| IndexSyncError::Facet {
            document_id: document.document_id.clone(),
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        })?;
        Ok(())
    }

    async fn retract_chunks(&self, document_id: &str, chunk_ids: &[String]) -> Result<(), IndexSyncError> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let vectors = &self.vectors;
        with_backoff(
            self.retry,
            "vector retract",
            move || vectors.delete(chunk_ids),
            ServiceError::is_retryable,
        )
        .await
        .map_err(|exhausted| IndexSyncError::Vector {
            document_id: document_id.to_string(),
            attempts: exhausted.attempts,
            source: exhausted.last_error,
        })
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }
}
