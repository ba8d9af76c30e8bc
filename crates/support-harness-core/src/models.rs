//! Core data models used throughout Support Harness.
//!
//! These types represent the knowledge documents, chunks, retrieval
//! candidates, and conversation turns that flow through the sync and
//! answer pipelines.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An authoritative knowledge document, one row of the external spreadsheet.
///
/// `content_hash` is a digest over every field that affects chunking or
/// metadata. The synchronizer compares it against its recorded state to skip
/// documents that have not changed since the last pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub doc_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    pub content_hash: String,
}

impl SourceDocument {
    /// Build a document and compute its content hash.
    pub fn new<I, T>(
        doc_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        category: impl Into<String>,
        tags: I,
    ) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut doc = Self {
            doc_id: doc_id.into(),
            title: title.into(),
            content: content.into(),
            category: category.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            content_hash: String::new(),
        };
        doc.content_hash = doc.compute_hash();
        doc
    }

    /// SHA-256 over title, content, category, and the sorted tag set.
    ///
    /// Each field is length-prefixed so that moving text between fields
    /// always changes the digest. Tags come from a `BTreeSet`, which makes
    /// the hash independent of the order they were listed in.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for field in [&self.title, &self.content, &self.category] {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update((self.tags.len() as u64).to_le_bytes());
        for tag in &self.tags {
            hasher.update((tag.len() as u64).to_le_bytes());
            hasher.update(tag.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Metadata carried by every chunk, used for filtering and prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    pub category: String,
    pub tags: BTreeSet<String>,
    /// Zero-based position of the chunk within its document.
    pub position: usize,
}

/// A bounded slice of a document's content plus its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub source_doc_id: String,
    pub text: String,
    /// Empty until the synchronizer embeds the chunk.
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Deterministic chunk id: `"{doc_id}#{position}"`.
///
/// Re-chunking an unchanged document yields the same ids, so a resync
/// replaces chunks in place instead of accumulating copies.
pub fn chunk_id(doc_id: &str, position: usize) -> String {
    format!("{}#{}", doc_id, position)
}

/// A chunk returned from a similarity query, with its cosine score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Per-query working set. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct RetrievalContext {
    pub query_vector: Vec<f32>,
    /// Candidates that survived the similarity threshold, best first.
    pub candidates: Vec<ScoredChunk>,
    /// Prompt context built from the candidates that fit the budget.
    pub assembled_text: String,
    /// How many leading candidates were actually placed in `assembled_text`.
    pub used: usize,
}

/// One prior exchange in a session, fed back into the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub user: String,
    pub assistant: String,
}

/// The result of answering one user message.
///
/// Handed to a conversation sink; this crate never reads turns back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub session_id: String,
    pub user_id: Option<String>,
    pub message: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    /// Final confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// `false` when no knowledge snippet cleared the similarity threshold.
    pub knowledge_match: bool,
    /// Ids of the chunks placed in the prompt context.
    pub sources: Vec<String>,
    /// `true` when confidence fell below the escalation threshold.
    pub escalate: bool,
}
