#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use support_harness::config::{ChunkingConfig, RetrievalConfig};
use support_harness::embedding::{HashEmbedder, DEFAULT_HASH_DIMS};
use support_harness::generation::{Generation, GenerationRequest, Generator};
use support_harness::source::{row_from_pairs, DocumentSource, SourceRow};
use support_harness::state::StateStore;
use support_harness::sync::KnowledgeSynchronizer;
use support_harness::upstream::{RetryPolicy, UpstreamPool};
use support_harness_core::embedding::Embedder;
use support_harness_core::error::{IndexError, UpstreamError};
use support_harness_core::index::{InMemoryIndex, MetadataFilter, VectorIndex};
use support_harness_core::models::{Chunk, ScoredChunk};
use tokio::sync::Semaphore;

pub const DIMS: usize = DEFAULT_HASH_DIMS;

pub fn fast_pool() -> UpstreamPool {
    UpstreamPool::new(
        4,
        RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            attempt_timeout: Duration::from_secs(5),
        },
    )
}

pub fn small_chunks() -> ChunkingConfig {
    ChunkingConfig {
        max_chunk_size: 200,
        overlap: 20,
    }
}

// ============ Embedder ============

/// Hash embedder that counts calls, can fail on texts containing a marker,
/// and can be gated so a test controls when calls complete.
pub struct CountingEmbedder {
    inner: HashEmbedder,
    pub calls: AtomicUsize,
    fail_marker: Mutex<Option<String>>,
    gate: Option<Arc<Semaphore>>,
    pub started: AtomicUsize,
}

impl CountingEmbedder {
    pub fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIMS),
            calls: AtomicUsize::new(0),
            fail_marker: Mutex::new(None),
            gate: None,
            started: AtomicUsize::new(0),
        }
    }

    /// Every call waits for a permit from `gate`.
    pub fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    pub fn fail_on(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| UpstreamError::Unavailable {
                service: "embedder".to_string(),
                message: "gate closed".to_string(),
            })?;
            permit.forget();
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let marker = self.fail_marker.lock().unwrap().clone();
        if let Some(marker) = marker {
            if text.contains(&marker) {
                return Err(UpstreamError::Status {
                    service: "embedder".to_string(),
                    status: 400,
                    body: "rejected".to_string(),
                });
            }
        }
        Ok(self.inner.embed_sync(text))
    }
}

// ============ Index ============

/// In-memory index that counts write operations.
pub struct CountingIndex {
    inner: InMemoryIndex,
    pub writes: AtomicUsize,
}

impl CountingIndex {
    pub fn new() -> Self {
        Self {
            inner: InMemoryIndex::new(DIMS),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl VectorIndex for CountingIndex {
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), IndexError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(chunks)
    }

    fn replace_source_doc(&self, doc_id: &str, chunks: Vec<Chunk>) -> Result<(), IndexError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.replace_source_doc(doc_id, chunks)
    }

    fn delete_by_source_doc(&self, doc_id: &str) -> usize {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_by_source_doc(doc_id)
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        self.inner.query(vector, k, filter)
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn source_doc_ids(&self) -> BTreeSet<String> {
        self.inner.source_doc_ids()
    }

    fn categories(&self) -> BTreeSet<String> {
        self.inner.categories()
    }
}

// ============ Generator ============

pub struct FakeGenerator {
    confidence: Option<f64>,
    fail: bool,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl FakeGenerator {
    pub fn confident(confidence: f64) -> Self {
        Self {
            confidence: Some(confidence),
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Succeeds without a self-reported confidence, like the OpenAI
    /// generator, so the configured prior applies.
    pub fn unscored() -> Self {
        Self {
            confidence: None,
            fail: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            confidence: None,
            fail: true,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, UpstreamError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(UpstreamError::Status {
                service: "generator".to_string(),
                status: 503,
                body: String::new(),
            });
        }
        Ok(Generation {
            text: format!("answer to: {}", request.query),
            confidence: self.confidence,
        })
    }
}

// ============ Source ============

/// In-memory knowledge source whose rows can be replaced between passes.
pub struct StaticSource {
    rows: Mutex<Vec<SourceRow>>,
    fail: Mutex<bool>,
    pub fetches: AtomicUsize,
}

impl StaticSource {
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            rows: Mutex::new(rows),
            fail: Mutex::new(false),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_rows(&self, rows: Vec<SourceRow>) {
        *self.rows.lock().unwrap() = rows;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_all(&self) -> anyhow::Result<Vec<SourceRow>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if *self.fail.lock().unwrap() {
            anyhow::bail!("spreadsheet unavailable");
        }
        Ok(self.rows.lock().unwrap().clone())
    }
}

pub fn row(pairs: &[(&str, &str)]) -> SourceRow {
    row_from_pairs(pairs.iter().map(|(k, v)| (*k, *v)))
}

pub fn refunds_row() -> SourceRow {
    row(&[
        ("id", "d1"),
        ("title", "Refunds"),
        ("content", "Refunds are processed in 5 days."),
        ("category", "billing"),
        ("tags", "refund"),
    ])
}

pub fn synchronizer(
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn StateStore>,
) -> KnowledgeSynchronizer {
    KnowledgeSynchronizer::new(index, embedder, store, fast_pool(), small_chunks())
}

pub fn retrieval_config() -> RetrievalConfig {
    RetrievalConfig::default()
}
