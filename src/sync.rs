//! Knowledge synchronizer.
//!
//! Keeps the vector index consistent with the authoritative knowledge source
//! by applying the minimal set of changes on each pass:
//!
//! ```text
//! fetch rows ─▶ validate ─▶ diff vs SyncState ─┬─ new/changed ─▶ chunk ─▶ embed ─▶ persist ─▶ index ─▶ state
//!                                              ├─ removed ─────▶ persist ─▶ index ─▶ state
//!                                              └─ unchanged ───▶ (skipped)
//! ```
//!
//! # Guarantees
//!
//! - Only one pass runs at a time; a concurrent pass returns
//!   [`SyncError::InProgress`] without side effects.
//! - A fetch failure aborts before any mutation.
//! - A per-document failure (embedding, persistence) is recorded in the
//!   report, leaves that document's prior state untouched, and the pass
//!   continues. The document is retried on the next pass.
//! - Each pass starts by reconciling the index against [`SyncState`]:
//!   chunks without a state entry are removed, and state entries without
//!   chunks are dropped so the document is re-embedded.
//! - Cancellation is observed between documents and during upstream calls.
//!   Documents committed before cancellation stay committed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::try_join_all;
use serde::Serialize;
use support_harness_core::chunk;
use support_harness_core::embedding::Embedder;
use support_harness_core::index::VectorIndex;
use support_harness_core::models::SourceDocument;
use tokio_util::sync::CancellationToken;

use crate::config::ChunkingConfig;
use crate::embedding::embed_input;
use crate::error::{PoolError, SyncError};
use crate::source::{parse_row, DocumentSource, RowOutcome};
use crate::state::{StateStore, StoredDocument, SyncState};
use crate::upstream::UpstreamPool;

/// Summary of one synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Documents whose processing failed: `(doc_id, reason)`.
    pub failed: Vec<(String, String)>,
    /// Rows that failed validation: `(row label, reason)`.
    pub rejected: Vec<(String, String)>,
    /// Divergences between index and state repaired at the start of the pass.
    pub reconciled: usize,
}

impl SyncReport {
    /// Number of index mutations the pass performed.
    pub fn changes(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// Marks a pass as running; cleared on drop.
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SyncError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| PassGuard(flag))
            .map_err(|_| SyncError::InProgress)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum DocOutcome {
    Committed,
    Failed(String),
}

pub struct KnowledgeSynchronizer {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn StateStore>,
    pool: UpstreamPool,
    chunking: ChunkingConfig,
    state: Mutex<SyncState>,
    running: AtomicBool,
}

impl KnowledgeSynchronizer {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn StateStore>,
        pool: UpstreamPool,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            store,
            pool,
            chunking,
            state: Mutex::new(SyncState::default()),
            running: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Snapshot of the current sync state.
    pub fn state(&self) -> SyncState {
        self.lock_state().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild the index and state from persistence without embedding.
    ///
    /// Documents whose stored vectors no longer fit the index (e.g. the
    /// embedding model changed) are skipped and will be re-embedded by the
    /// next pass. Returns the number of documents restored.
    pub async fn restore(&self) -> Result<usize, SyncError> {
        let _guard = PassGuard::acquire(&self.running)?;
        let docs = self.store.load().await.map_err(SyncError::Restore)?;

        let mut state = SyncState::default();
        for doc in docs {
            if doc.chunks.is_empty() {
                tracing::warn!(doc_id = %doc.doc_id, "persisted document has no chunks, skipping");
                continue;
            }
            match self.index.replace_source_doc(&doc.doc_id, doc.chunks) {
                Ok(()) => state.insert(doc.doc_id, doc.content_hash),
                Err(e) => {
                    tracing::warn!(doc_id = %doc.doc_id, error = %e, "cannot restore document, it will be re-embedded");
                }
            }
        }

        let restored = state.len();
        *self.lock_state() = state;
        tracing::info!(documents = restored, chunks = self.index.count(), "restored sync state");
        Ok(restored)
    }

    /// Fetch every row from `source`, validate it, and synchronize.
    ///
    /// Rows rejected by validation keep their prior state: if their doc_id
    /// was indexed before, it stays indexed rather than being treated as
    /// removed. Inactive rows are treated as absent.
    pub async fn run(
        &self,
        source: &dyn DocumentSource,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let _guard = PassGuard::acquire(&self.running)?;

        let rows = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            rows = source.fetch_all() => rows.map_err(|e| {
                tracing::error!(source = source.name(), error = %format!("{:#}", e), "knowledge source fetch failed");
                SyncError::Fetch(e)
            })?,
        };

        let mut report = SyncReport::default();
        let mut docs = Vec::with_capacity(rows.len());
        let mut keep = BTreeSet::new();

        for (i, row) in rows.iter().enumerate() {
            match parse_row(row) {
                RowOutcome::Document(doc) => docs.push(doc),
                RowOutcome::Inactive { doc_id } => {
                    tracing::debug!(doc_id = %doc_id, "row inactive, treating as removed");
                }
                RowOutcome::Rejected { doc_id, reason } => {
                    // Row numbers are 1-based after the header.
                    let label = doc_id.clone().unwrap_or_else(|| format!("row {}", i + 2));
                    tracing::warn!(row = %label, reason = %reason, "rejected knowledge row");
                    report.rejected.push((label, reason));
                    keep.extend(doc_id);
                }
            }
        }

        self.apply(docs, keep, report, cancel).await
    }

    /// Synchronize against an already-validated document set.
    pub async fn sync(
        &self,
        docs: Vec<SourceDocument>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let _guard = PassGuard::acquire(&self.running)?;
        self.apply(docs, BTreeSet::new(), SyncReport::default(), cancel)
            .await
    }

    async fn apply(
        &self,
        docs: Vec<SourceDocument>,
        keep: BTreeSet<String>,
        mut report: SyncReport,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        report.reconciled = self.reconcile().await;

        let snapshot = self.state();
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for mut doc in docs {
            if !seen.insert(doc.doc_id.clone()) {
                tracing::warn!(doc_id = %doc.doc_id, "duplicate doc_id in source, keeping first row");
                report
                    .rejected
                    .push((doc.doc_id.clone(), "duplicate doc_id".to_string()));
                continue;
            }
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            doc.content_hash = doc.compute_hash();
            let previous = snapshot.get(&doc.doc_id);
            if previous == Some(doc.content_hash.as_str()) {
                report.unchanged += 1;
                continue;
            }

            match self.upsert_document(&doc, cancel).await? {
                DocOutcome::Committed if previous.is_some() => report.updated += 1,
                DocOutcome::Committed => report.added += 1,
                DocOutcome::Failed(reason) => {
                    tracing::warn!(doc_id = %doc.doc_id, reason = %reason, "document sync failed, will retry next pass");
                    report.failed.push((doc.doc_id.clone(), reason));
                }
            }
        }

        let removed: Vec<String> = snapshot
            .doc_ids()
            .filter(|id| !seen.contains(*id) && !keep.contains(*id))
            .map(str::to_string)
            .collect();

        for doc_id in removed {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if let Err(e) = self.store.remove_document(&doc_id).await {
                let reason = format!("failed to remove persisted document: {:#}", e);
                tracing::warn!(doc_id = %doc_id, reason = %reason, "document removal failed");
                report.failed.push((doc_id, reason));
                continue;
            }
            let chunks = self.index.delete_by_source_doc(&doc_id);
            self.lock_state().remove(&doc_id);
            tracing::debug!(doc_id = %doc_id, chunks, "removed document");
            report.deleted += 1;
        }

        tracing::info!(
            added = report.added,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            rejected = report.rejected.len(),
            chunks = self.index.count(),
            "sync pass complete"
        );
        Ok(report)
    }

    /// Chunk, embed, persist, index, then record state for one dirty
    /// document. Only cancellation escapes as an error.
    async fn upsert_document(
        &self,
        doc: &SourceDocument,
        cancel: &CancellationToken,
    ) -> Result<DocOutcome, SyncError> {
        let mut chunks =
            match chunk::split(doc, self.chunking.max_chunk_size, self.chunking.overlap) {
                Ok(chunks) => chunks,
                Err(e) => return Ok(DocOutcome::Failed(e.to_string())),
            };

        let embedder = &self.embedder;
        let inputs: Vec<String> = chunks
            .iter()
            .map(|c| embed_input(&c.metadata.title, &c.text))
            .collect();
        let vectors = try_join_all(inputs.iter().map(|input| {
            self.pool
                .call("embedder", cancel, move || embedder.embed(input))
        }))
        .await;

        let vectors = match vectors {
            Ok(vectors) => vectors,
            Err(PoolError::Cancelled) => return Err(SyncError::Cancelled),
            Err(PoolError::Upstream(e)) => return Ok(DocOutcome::Failed(e.to_string())),
        };

        let dims = self.index.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Ok(DocOutcome::Failed(format!(
                "embedder returned {} dims, index expects {}",
                bad.len(),
                dims
            )));
        }
        for (chunk, vector) in chunks.iter_mut().zip(vectors) {
            chunk.vector = vector;
        }
        tracing::debug!(doc_id = %doc.doc_id, chunks = chunks.len(), "embedded document");

        let stored = StoredDocument {
            doc_id: doc.doc_id.clone(),
            content_hash: doc.content_hash.clone(),
            chunks,
        };
        if let Err(e) = self.store.commit_document(&stored).await {
            return Ok(DocOutcome::Failed(format!(
                "failed to persist document: {:#}",
                e
            )));
        }

        if let Err(e) = self.index.replace_source_doc(&doc.doc_id, stored.chunks) {
            tracing::error!(doc_id = %doc.doc_id, error = %e, "index rejected persisted chunks");
            return Ok(DocOutcome::Failed(e.to_string()));
        }
        self.lock_state()
            .insert(doc.doc_id.clone(), doc.content_hash.clone());
        Ok(DocOutcome::Committed)
    }

    /// Repair divergence between the index and [`SyncState`]. Returns the
    /// number of repaired documents.
    async fn reconcile(&self) -> usize {
        let (orphaned, stale) = {
            let mut state = self.lock_state();
            let indexed = self.index.source_doc_ids();

            let orphaned: Vec<String> = indexed
                .iter()
                .filter(|id| !state.contains(id))
                .cloned()
                .collect();
            for doc_id in &orphaned {
                let removed = self.index.delete_by_source_doc(doc_id);
                tracing::error!(doc_id = %doc_id, chunks = removed, "consistency: indexed chunks without sync state, removed");
            }

            let stale: Vec<String> = state
                .doc_ids()
                .filter(|id| !indexed.contains(*id))
                .map(str::to_string)
                .collect();
            for doc_id in &stale {
                state.remove(doc_id);
                tracing::error!(doc_id = %doc_id, "consistency: sync state without indexed chunks, will re-embed");
            }
            (orphaned, stale)
        };

        for doc_id in &stale {
            if let Err(e) = self.store.remove_document(doc_id).await {
                tracing::warn!(doc_id = %doc_id, error = %format!("{:#}", e), "failed to drop stale persisted document");
            }
        }

        orphaned.len() + stale.len()
    }
}
