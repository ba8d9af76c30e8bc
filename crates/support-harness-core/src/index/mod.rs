//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is the only owner of stored [`Chunk`]s. It
//! answers nearest-neighbour queries by cosine similarity with an optional
//! metadata filter applied *before* ranking, so a filtered-out chunk can
//! never occupy one of the `k` result slots.
//!
//! Implementations must be `Send + Sync`. Writes are serialized with respect
//! to each other and appear atomic to concurrent queries: a query observes
//! either the state before or after a write, never a partial batch.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorIndex::upsert) | Insert or replace chunks by id |
//! | [`replace_source_doc`](VectorIndex::replace_source_doc) | Swap all chunks of one document |
//! | [`delete_by_source_doc`](VectorIndex::delete_by_source_doc) | Remove every chunk of one document |
//! | [`query`](VectorIndex::query) | Top-k cosine search with pre-ranking filter |
//! | [`count`](VectorIndex::count) | Number of stored chunks |

pub mod memory;

use std::collections::BTreeSet;

use crate::error::IndexError;
use crate::models::{Chunk, ChunkMetadata, ScoredChunk};

pub use memory::InMemoryIndex;

/// Metadata predicate applied before similarity ranking.
///
/// An empty filter matches every chunk. When both fields are set, a chunk
/// must satisfy both.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    /// Category must equal this value (ASCII case-insensitive).
    pub category: Option<String>,
    /// Chunk must carry at least one of these tags.
    pub any_tags: BTreeSet<String>,
}

impl MetadataFilter {
    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            any_tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.any_tags.insert(tag.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.any_tags.is_empty()
    }

    pub fn matches(&self, metadata: &ChunkMetadata) -> bool {
        if let Some(ref category) = self.category {
            if !metadata.category.eq_ignore_ascii_case(category) {
                return false;
            }
        }
        self.any_tags.is_empty() || !self.any_tags.is_disjoint(&metadata.tags)
    }
}

/// Storage and similarity search over embedded chunks.
pub trait VectorIndex: Send + Sync {
    /// Fixed vector dimensionality accepted by this index.
    fn dims(&self) -> usize;

    /// Insert chunks, replacing any existing chunk with the same id.
    ///
    /// The batch is validated first and applied under a single write, so
    /// either every chunk is stored or none is.
    fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), IndexError>;

    /// Atomically remove every chunk of `doc_id` and insert `chunks`.
    ///
    /// All `chunks` must belong to `doc_id`. Used on resync so a document
    /// that shrank does not leave stale trailing chunks behind.
    fn replace_source_doc(&self, doc_id: &str, chunks: Vec<Chunk>) -> Result<(), IndexError>;

    /// Remove every chunk whose `source_doc_id == doc_id`. Returns how many
    /// were removed.
    fn delete_by_source_doc(&self, doc_id: &str) -> usize;

    /// Top-`k` chunks by descending cosine similarity, ties broken by
    /// ascending chunk id. Returns an empty list on an empty index.
    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>, IndexError>;

    /// Number of stored chunks.
    fn count(&self) -> usize;

    /// Distinct document ids with at least one stored chunk.
    fn source_doc_ids(&self) -> BTreeSet<String>;

    /// Distinct categories across stored chunks.
    fn categories(&self) -> BTreeSet<String>;
}
