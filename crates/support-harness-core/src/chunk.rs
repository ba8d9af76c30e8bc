//! Boundary-aware, overlapping text chunker.
//!
//! Splits a [`SourceDocument`]'s content into [`Chunk`]s of at most
//! `max_chunk_size` characters. Consecutive chunks share up to `overlap`
//! characters so that a fact straddling a cut is still retrievable from
//! either side.
//!
//! # Algorithm
//!
//! 1. Trim the content; fail with [`ChunkError::EmptyDocument`] if nothing
//!    remains.
//! 2. Break the text into pieces, preferring paragraph boundaries (`\n\n`).
//!    A paragraph longer than the limit is split into sentences (after
//!    `.`, `!`, or `?` followed by whitespace); a sentence longer than the
//!    limit is hard-split at the last whitespace inside the window, or at
//!    the window edge when there is none.
//! 3. Greedily pack pieces into a buffer. When the next piece does not fit,
//!    flush the buffer and seed the new one with the tail of the flushed
//!    chunk (at most `overlap` characters, snapped forward to a word start,
//!    shrunk so the seeded chunk still fits).
//!
//! Lengths are counted in Unicode scalar values and cuts never fall inside
//! a code point. The output depends only on the input text and parameters,
//! and chunk ids are `"{doc_id}#{position}"`, so re-chunking an unchanged
//! document reproduces the same chunks exactly.
//!
//! # Example
//!
//! ```rust
//! use support_harness_core::chunk::split;
//! use support_harness_core::models::SourceDocument;
//!
//! let doc = SourceDocument::new("d1", "Refunds", "Refunds take 5 days.", "billing", ["refund"]);
//! let chunks = split(&doc, 1000, 200).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "d1#0");
//! ```

use crate::error::ChunkError;
use crate::models::{chunk_id, Chunk, ChunkMetadata, SourceDocument};

const PARAGRAPH_BREAK: &str = "\n\n";
const SENTENCE_JOIN: &str = " ";

/// Split a document into ordered chunks with unset vectors.
///
/// # Errors
///
/// - [`ChunkError::InvalidParameters`] if `max_chunk_size` is zero or
///   `overlap >= max_chunk_size`.
/// - [`ChunkError::EmptyDocument`] if the content is blank.
pub fn split(
    doc: &SourceDocument,
    max_chunk_size: usize,
    overlap: usize,
) -> Result<Vec<Chunk>, ChunkError> {
    if max_chunk_size == 0 || overlap >= max_chunk_size {
        return Err(ChunkError::InvalidParameters {
            max_chunk_size,
            overlap,
        });
    }

    let text = doc.content.trim();
    if text.is_empty() {
        return Err(ChunkError::EmptyDocument {
            doc_id: doc.doc_id.clone(),
        });
    }

    let texts = pack(&pieces(text, max_chunk_size), max_chunk_size, overlap);

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(position, text)| Chunk {
            id: chunk_id(&doc.doc_id, position),
            source_doc_id: doc.doc_id.clone(),
            text,
            vector: Vec::new(),
            metadata: ChunkMetadata {
                title: doc.title.clone(),
                category: doc.category.clone(),
                tags: doc.tags.clone(),
                position,
            },
        })
        .collect())
}

/// A piece of text no longer than the limit, plus the separator that
/// joins it to whatever precedes it in a chunk.
struct Piece<'a> {
    text: &'a str,
    joiner: &'static str,
}

fn pieces(text: &str, max: usize) -> Vec<Piece<'_>> {
    let mut out = Vec::new();
    for para in text.split(PARAGRAPH_BREAK) {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }
        if char_len(para) <= max {
            out.push(Piece {
                text: para,
                joiner: PARAGRAPH_BREAK,
            });
            continue;
        }
        let mut first = true;
        for sentence in sentences(para) {
            for part in hard_split(sentence, max) {
                out.push(Piece {
                    text: part,
                    joiner: if first { PARAGRAPH_BREAK } else { SENTENCE_JOIN },
                });
                first = false;
            }
        }
    }
    out
}

fn pack(pieces: &[Piece<'_>], max: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if current.is_empty() {
            current.push_str(piece.text);
            continue;
        }

        let piece_len = char_len(piece.text);
        let joiner_len = piece.joiner.len();
        if char_len(&current) + joiner_len + piece_len <= max {
            current.push_str(piece.joiner);
            current.push_str(piece.text);
            continue;
        }

        let budget = max.saturating_sub(piece_len + joiner_len);
        let tail = overlap_tail(&current, overlap.min(budget));
        chunks.push(std::mem::take(&mut current));
        if !tail.is_empty() {
            current.push_str(&tail);
            current.push_str(piece.joiner);
        }
        current.push_str(piece.text);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split a paragraph after sentence-ending punctuation.
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(next_idx, next)) = chars.peek() {
            if next.is_whitespace() {
                let sentence = text[start..next_idx].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                start = next_idx;
            }
        }
    }
    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Cut text into windows of at most `max` characters, preferring to end
/// each window at whitespace.
fn hard_split(text: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        if char_len(rest) <= max {
            out.push(rest);
            break;
        }
        let limit = byte_offset(rest, max);
        let cut = match rest[..limit].rfind(char::is_whitespace) {
            Some(pos) if pos > 0 => pos,
            _ => limit,
        };
        let part = rest[..cut].trim_end();
        if !part.is_empty() {
            out.push(part);
        }
        rest = rest[cut..].trim_start();
    }
    out
}

/// The last `n` characters of `text`, starting on a word boundary.
fn overlap_tail(text: &str, n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    let total = char_len(text);
    let mut start = byte_offset(text, total.saturating_sub(n));

    let mid_word = start > 0
        && text[..start]
            .chars()
            .next_back()
            .is_some_and(|c| !c.is_whitespace());
    if mid_word {
        start = match text[start..].find(char::is_whitespace) {
            Some(ws) => start + ws,
            None => text.len(),
        };
    }
    text[start..].trim().to_string()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte index of the `n`-th character, or `s.len()` if there are fewer.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
