//! In-memory [`VectorIndex`] implementation.
//!
//! Chunks live in a `BTreeMap` keyed by id behind a single
//! `std::sync::RwLock`, with a secondary `doc_id -> chunk ids` map so
//! per-document deletes do not scan the whole index, and per-category chunk
//! counts kept current on every write. Queries are
//! brute-force cosine similarity over the filtered candidate set.
//!
//! The lock is only ever held for in-memory work; callers embed vectors
//! before calling in, so no guard crosses an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::embedding::cosine_similarity;
use crate::error::IndexError;
use crate::models::{Chunk, ScoredChunk};

use super::{MetadataFilter, VectorIndex};

#[derive(Default)]
struct Inner {
    chunks: BTreeMap<String, Chunk>,
    by_doc: HashMap<String, BTreeSet<String>>,
    by_category: BTreeMap<String, usize>,
}

impl Inner {
    fn insert(&mut self, chunk: Chunk) {
        if let Some(old) = self.chunks.get(&chunk.id) {
            let old_doc = old.source_doc_id.clone();
            let old_category = old.metadata.category.clone();
            if old_doc != chunk.source_doc_id {
                self.unlink(&old_doc, &chunk.id);
            }
            self.uncount(&old_category);
        }
        self.by_doc
            .entry(chunk.source_doc_id.clone())
            .or_default()
            .insert(chunk.id.clone());
        if !chunk.metadata.category.is_empty() {
            *self
                .by_category
                .entry(chunk.metadata.category.clone())
                .or_default() += 1;
        }
        self.chunks.insert(chunk.id.clone(), chunk);
    }

    fn uncount(&mut self, category: &str) {
        if let Some(n) = self.by_category.get_mut(category) {
            *n -= 1;
            if *n == 0 {
                self.by_category.remove(category);
            }
        }
    }

    fn unlink(&mut self, doc_id: &str, chunk_id: &str) {
        if let Some(ids) = self.by_doc.get_mut(doc_id) {
            ids.remove(chunk_id);
            if ids.is_empty() {
                self.by_doc.remove(doc_id);
            }
        }
    }

    fn remove_doc(&mut self, doc_id: &str) -> usize {
        let ids = self.by_doc.remove(doc_id).unwrap_or_default();
        for id in &ids {
            if let Some(chunk) = self.chunks.remove(id) {
                self.uncount(&chunk.metadata.category);
            }
        }
        ids.len()
    }
}

/// Thread-safe in-memory vector index with a fixed dimensionality.
pub struct InMemoryIndex {
    dims: usize,
    inner: RwLock<Inner>,
}

impl InMemoryIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn validate(&self, chunk: &Chunk) -> Result<(), IndexError> {
        if chunk.vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: chunk.vector.len(),
            });
        }
        if chunk.vector.iter().any(|v| !v.is_finite()) {
            return Err(IndexError::NonFiniteVector {
                chunk_id: chunk.id.clone(),
            });
        }
        Ok(())
    }
}

impl VectorIndex for InMemoryIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn upsert(&self, chunks: Vec<Chunk>) -> Result<(), IndexError> {
        for chunk in &chunks {
            self.validate(chunk)?;
        }
        let mut inner = self.write();
        for chunk in chunks {
            inner.insert(chunk);
        }
        Ok(())
    }

    fn replace_source_doc(&self, doc_id: &str, chunks: Vec<Chunk>) -> Result<(), IndexError> {
        for chunk in &chunks {
            if chunk.source_doc_id != doc_id {
                return Err(IndexError::ForeignChunk {
                    chunk_id: chunk.id.clone(),
                    expected: doc_id.to_string(),
                    actual: chunk.source_doc_id.clone(),
                });
            }
            self.validate(chunk)?;
        }
        let mut inner = self.write();
        inner.remove_doc(doc_id);
        for chunk in chunks {
            inner.insert(chunk);
        }
        Ok(())
    }

    fn delete_by_source_doc(&self, doc_id: &str) -> usize {
        self.write().remove_doc(doc_id)
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<ScoredChunk>, IndexError> {
        let inner = self.read();
        if inner.chunks.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if vector.len() != self.dims {
            return Err(IndexError::DimensionMismatch {
                expected: self.dims,
                actual: vector.len(),
            });
        }

        let mut scored: Vec<(f32, &Chunk)> = inner
            .chunks
            .values()
            .filter(|c| filter.map_or(true, |f| f.matches(&c.metadata)))
            .map(|c| (cosine_similarity(vector, &c.vector), c))
            .collect();

        scored.sort_by(|(sa, a), (sb, b)| sb.total_cmp(sa).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(score, chunk)| ScoredChunk {
                chunk: chunk.clone(),
                score,
            })
            .collect())
    }

    fn count(&self) -> usize {
        self.read().chunks.len()
    }

    fn source_doc_ids(&self) -> BTreeSet<String> {
        self.read().by_doc.keys().cloned().collect()
    }

    fn categories(&self) -> BTreeSet<String> {
        self.read().by_category.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::models::{chunk_id, ChunkMetadata};

    fn chunk(doc: &str, pos: usize, category: &str, tags: &[&str], vector: Vec<f32>) -> Chunk {
        Chunk {
            id: chunk_id(doc, pos),
            source_doc_id: doc.to_string(),
            text: format!("{} chunk {}", doc, pos),
            vector,
            metadata: ChunkMetadata {
                title: doc.to_string(),
                category: category.to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                position: pos,
            },
        }
    }

    #[test]
    fn test_query_empty_index_returns_empty() {
        let index = InMemoryIndex::new(3);
        let results = index.query(&[1.0, 0.0, 0.0], 5, None).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![chunk("d1", 0, "a", &[], vec![1.0, 0.0])])
            .unwrap();
        let mut replacement = chunk("d1", 0, "a", &[], vec![0.0, 1.0]);
        replacement.text = "updated".to_string();
        index.upsert(vec![replacement]).unwrap();

        assert_eq!(index.count(), 1);
        let results = index.query(&[0.0, 1.0], 1, None).unwrap();
        assert_eq!(results[0].chunk.text, "updated");
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let index = InMemoryIndex::new(2);
        let batch = vec![
            chunk("d1", 0, "a", &[], vec![1.0, 0.0]),
            chunk("d1", 1, "a", &[], vec![0.5, 0.5]),
        ];
        index.upsert(batch.clone()).unwrap();
        index.upsert(batch).unwrap();
        assert_eq!(index.count(), 2);
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension_atomically() {
        let index = InMemoryIndex::new(2);
        let err = index
            .upsert(vec![
                chunk("d1", 0, "a", &[], vec![1.0, 0.0]),
                chunk("d1", 1, "a", &[], vec![1.0, 0.0, 0.0]),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            IndexError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
        assert_eq!(index.count(), 0);
    }

    #[test]
    fn test_upsert_rejects_nan() {
        let index = InMemoryIndex::new(2);
        let err = index
            .upsert(vec![chunk("d1", 0, "a", &[], vec![f32::NAN, 0.0])])
            .unwrap_err();
        assert!(matches!(err, IndexError::NonFiniteVector { .. }));
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![chunk("d1", 0, "a", &[], vec![1.0, 0.0])])
            .unwrap();
        assert!(index.query(&[1.0], 1, None).is_err());
    }

    #[test]
    fn test_delete_by_source_doc() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("d1", 0, "a", &[], vec![1.0, 0.0]),
                chunk("d1", 1, "a", &[], vec![1.0, 0.0]),
                chunk("d2", 0, "a", &[], vec![0.0, 1.0]),
            ])
            .unwrap();

        assert_eq!(index.delete_by_source_doc("d1"), 2);
        assert_eq!(index.count(), 1);
        assert_eq!(index.delete_by_source_doc("d1"), 0);
        assert_eq!(
            index.source_doc_ids().into_iter().collect::<Vec<_>>(),
            vec!["d2".to_string()]
        );
    }

    #[test]
    fn test_replace_source_doc_drops_stale_tail() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("d1", 0, "a", &[], vec![1.0, 0.0]),
                chunk("d1", 1, "a", &[], vec![1.0, 0.0]),
                chunk("d1", 2, "a", &[], vec![1.0, 0.0]),
            ])
            .unwrap();
        index
            .replace_source_doc("d1", vec![chunk("d1", 0, "a", &[], vec![0.0, 1.0])])
            .unwrap();
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_replace_source_doc_rejects_foreign_chunk() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![chunk("d1", 0, "a", &[], vec![1.0, 0.0])])
            .unwrap();
        let err = index
            .replace_source_doc("d1", vec![chunk("d2", 0, "a", &[], vec![1.0, 0.0])])
            .unwrap_err();
        assert!(matches!(err, IndexError::ForeignChunk { .. }));
        assert_eq!(index.count(), 1);
    }

    #[test]
    fn test_results_sorted_descending_with_id_tiebreak() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("c", 0, "a", &[], vec![1.0, 1.0]),
                chunk("a", 0, "a", &[], vec![1.0, 1.0]),
                chunk("b", 0, "a", &[], vec![1.0, 0.0]),
                chunk("d", 0, "a", &[], vec![2.0, 2.0]),
            ])
            .unwrap();

        let results = index.query(&[1.0, 1.0], 10, None).unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["a#0", "c#0", "d#0", "b#0"]);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_query_truncates_to_k() {
        let index = InMemoryIndex::new(2);
        let chunks = (0..10)
            .map(|i| chunk("d1", i, "a", &[], vec![1.0, i as f32]))
            .collect();
        index.upsert(chunks).unwrap();
        assert_eq!(index.query(&[1.0, 0.0], 3, None).unwrap().len(), 3);
        assert!(index.query(&[1.0, 0.0], 0, None).unwrap().is_empty());
    }

    #[test]
    fn test_filter_applied_before_ranking() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("best", 0, "shipping", &[], vec![1.0, 0.0]),
                chunk("good", 0, "shipping", &[], vec![0.9, 0.1]),
                chunk("weak", 0, "billing", &["refund"], vec![0.1, 0.9]),
            ])
            .unwrap();

        let filter = MetadataFilter::category("billing");
        let results = index.query(&[1.0, 0.0], 1, Some(&filter)).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source_doc_id, "weak");

        let by_tag = MetadataFilter::default().with_tag("refund");
        let results = index.query(&[1.0, 0.0], 2, Some(&by_tag)).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_categories() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("d1", 0, "billing", &[], vec![1.0, 0.0]),
                chunk("d2", 0, "shipping", &[], vec![1.0, 0.0]),
                chunk("d3", 0, "", &[], vec![1.0, 0.0]),
            ])
            .unwrap();
        let cats: Vec<String> = index.categories().into_iter().collect();
        assert_eq!(cats, vec!["billing".to_string(), "shipping".to_string()]);
    }

    #[test]
    fn test_categories_follow_writes() {
        let index = InMemoryIndex::new(2);
        index
            .upsert(vec![
                chunk("d1", 0, "billing", &[], vec![1.0, 0.0]),
                chunk("d1", 1, "billing", &[], vec![1.0, 0.0]),
                chunk("d2", 0, "shipping", &[], vec![1.0, 0.0]),
            ])
            .unwrap();

        // Re-categorized in place.
        index
            .upsert(vec![chunk("d2", 0, "returns", &[], vec![1.0, 0.0])])
            .unwrap();
        let cats: Vec<String> = index.categories().into_iter().collect();
        assert_eq!(cats, vec!["billing".to_string(), "returns".to_string()]);

        index
            .replace_source_doc("d1", vec![chunk("d1", 0, "billing", &[], vec![1.0, 0.0])])
            .unwrap();
        assert!(index.categories().contains("billing"));

        index.delete_by_source_doc("d1");
        index.delete_by_source_doc("d2");
        assert!(index.categories().is_empty());
    }

    #[test]
    fn test_concurrent_queries_see_whole_documents() {
        let index = Arc::new(InMemoryIndex::new(2));
        let v1: Vec<Chunk> = (0..4)
            .map(|i| chunk("d1", i, "a", &[], vec![1.0, 0.0]))
            .collect();
        index.upsert(v1.clone()).unwrap();

        let writer = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for round in 0..200 {
                    let n = if round % 2 == 0 { 2 } else { 4 };
                    let chunks = (0..n)
                        .map(|i| chunk("d1", i, "a", &[], vec![1.0, 0.0]))
                        .collect();
                    index.replace_source_doc("d1", chunks).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let n = index.query(&[1.0, 0.0], 10, None).unwrap().len();
                        assert!(n == 2 || n == 4, "observed partial write: {} chunks", n);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
