//! Synchronization state and its persistence.
//!
//! [`SyncState`] is the in-memory `doc_id → content_hash` map describing
//! what the vector index currently reflects. A [`StateStore`] persists it
//! together with the embedded chunks so that a restart can rebuild both
//! without calling the embedder.
//!
//! Each [`StateStore::commit_document`] is atomic: either the hash row and
//! all chunk rows for the document are written, or none are.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use support_harness_core::models::Chunk;

/// `doc_id → content_hash` for every document reflected in the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    hashes: BTreeMap<String, String>,
}

impl SyncState {
    pub fn get(&self, doc_id: &str) -> Option<&str> {
        self.hashes.get(doc_id).map(String::as_str)
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.hashes.contains_key(doc_id)
    }

    pub fn insert(&mut self, doc_id: impl Into<String>, content_hash: impl Into<String>) {
        self.hashes.insert(doc_id.into(), content_hash.into());
    }

    pub fn remove(&mut self, doc_id: &str) -> Option<String> {
        self.hashes.remove(doc_id)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &str> {
        self.hashes.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SyncState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            hashes: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A document as persisted: its hash plus its embedded chunks in order.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub doc_id: String,
    pub content_hash: String,
    pub chunks: Vec<Chunk>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted document.
    async fn load(&self) -> Result<Vec<StoredDocument>>;

    /// Atomically replace the hash and chunks of one document.
    async fn commit_document(&self, doc: &StoredDocument) -> Result<()>;

    /// Atomically remove one document's hash and chunks. Removing an
    /// unknown document is not an error.
    async fn remove_document(&self, doc_id: &str) -> Result<()>;
}

/// Non-persistent [`StateStore`] for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStateStore {
    docs: Mutex<BTreeMap<String, StoredDocument>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn docs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, StoredDocument>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.docs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Vec<StoredDocument>> {
        Ok(self.docs().values().cloned().collect())
    }

    async fn commit_document(&self, doc: &StoredDocument) -> Result<()> {
        self.docs().insert(doc.doc_id.clone(), doc.clone());
        Ok(())
    }

    async fn remove_document(&self, doc_id: &str) -> Result<()> {
        self.docs().remove(doc_id);
        Ok(())
    }
}
