//! Retrieval-augmented answer composition.
//!
//! [`RetrievalComposer::answer`] turns one user message into a
//! [`ConversationTurn`]:
//!
//! 1. Embed the query through the [`UpstreamPool`].
//! 2. Query the index (`top_k`), optionally filtered by category, and drop
//!    candidates below the similarity threshold.
//! 3. Assemble the surviving snippets into a prompt context within the
//!    character budget.
//! 4. Generate a reply with the context and the session's recent history.
//! 5. Score confidence, decide escalation, and hand the turn to the sink.
//!
//! Upstream failures never surface as errors. A failed query embedding
//! answers without knowledge; a failed generation answers with a fixed
//! apology. Both paths cap confidence at `no_match_ceiling`. Only blank
//! input and cancellation are errors.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use support_harness_core::embedding::Embedder;
use support_harness_core::index::{MetadataFilter, VectorIndex};
use support_harness_core::models::{
    Chunk, ConversationTurn, HistoryTurn, RetrievalContext, ScoredChunk,
};
use support_harness_core::score::{cap, combine_confidence, mean_similarity};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::conversation::ConversationSink;
use crate::error::{ComposeError, PoolError};
use crate::generation::{GenerationRequest, Generator};
use crate::upstream::UpstreamPool;

/// Reply used when the generator cannot be reached.
pub const APOLOGY: &str =
    "I apologize, but I'm experiencing technical difficulties. Please try again later.";

/// Per-message session information supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Generated when absent.
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    /// Prior turns, oldest first. Only the most recent `history_turns` are
    /// sent to the generator.
    pub history: Vec<HistoryTurn>,
    /// Explicit category filter. Takes precedence over a derived one.
    pub category: Option<String>,
}

pub struct RetrievalComposer {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    sink: Arc<dyn ConversationSink>,
    pool: UpstreamPool,
    settings: RetrievalConfig,
}

impl RetrievalComposer {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        sink: Arc<dyn ConversationSink>,
        pool: UpstreamPool,
        settings: RetrievalConfig,
    ) -> Self {
        Self {
            index,
            embedder,
            generator,
            sink,
            pool,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalConfig {
        &self.settings
    }

    /// Answer one user message.
    pub async fn answer(
        &self,
        query: &str,
        session: SessionContext,
        cancel: &CancellationToken,
    ) -> Result<ConversationTurn, ComposeError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ComposeError::Validation(
                "message must not be empty".to_string(),
            ));
        }
        let session_id = session
            .session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let retrieval = self
            .retrieve(query, session.category.as_deref(), cancel)
            .await?;
        let used = &retrieval.candidates[..retrieval.used];
        let knowledge_match = !used.is_empty();

        let skip = session
            .history
            .len()
            .saturating_sub(self.settings.history_turns);
        let request = GenerationRequest {
            query: query.to_string(),
            context: knowledge_match.then(|| retrieval.assembled_text.clone()),
            history: session.history[skip..].to_vec(),
        };

        let generator = &self.generator;
        let request_ref = &request;
        let (response, model_confidence, degraded) = match self
            .pool
            .call("generator", cancel, move || generator.generate(request_ref))
            .await
        {
            Ok(generation) => (
                generation.text,
                generation
                    .confidence
                    .unwrap_or(self.settings.model_confidence_prior),
                false,
            ),
            Err(PoolError::Cancelled) => return Err(ComposeError::Cancelled),
            Err(PoolError::Upstream(e)) => {
                tracing::warn!(session_id = %session_id, error = %e, "generation failed, replying with apology");
                (APOLOGY.to_string(), 0.0, true)
            }
        };

        let scores: Vec<f32> = used.iter().map(|c| c.score).collect();
        let mut confidence = combine_confidence(mean_similarity(&scores), model_confidence);
        if !knowledge_match || degraded {
            confidence = cap(confidence, self.settings.no_match_ceiling);
        }
        let escalate = confidence < self.settings.escalation_threshold;

        let turn = ConversationTurn {
            session_id,
            user_id: session.user_id,
            message: query.to_string(),
            response,
            timestamp: Utc::now(),
            confidence,
            knowledge_match,
            sources: used.iter().map(|c| c.chunk.id.clone()).collect(),
            escalate,
        };

        tracing::info!(
            session_id = %turn.session_id,
            candidates = retrieval.candidates.len(),
            used = used.len(),
            confidence = turn.confidence,
            escalate = turn.escalate,
            "answered message"
        );

        if let Err(e) = self.sink.record(&turn).await {
            tracing::warn!(session_id = %turn.session_id, error = %format!("{:#}", e), "failed to record conversation turn");
        }
        Ok(turn)
    }

    /// Embed `query`, search the index, and assemble the prompt context.
    ///
    /// A failed embedding yields an empty context rather than an error.
    pub async fn retrieve(
        &self,
        query: &str,
        category: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RetrievalContext, ComposeError> {
        let embedder = &self.embedder;
        let query_vector = match self
            .pool
            .call("embedder", cancel, move || embedder.embed(query))
            .await
        {
            Ok(vector) => vector,
            Err(PoolError::Cancelled) => return Err(ComposeError::Cancelled),
            Err(PoolError::Upstream(e)) => {
                tracing::warn!(error = %e, "query embedding failed, answering without knowledge");
                return Ok(RetrievalContext::default());
            }
        };

        let explicit = category.map(str::trim).filter(|c| !c.is_empty());
        let candidates = match explicit {
            Some(category) => self.search(&query_vector, Some(&MetadataFilter::category(category))),
            None => match self.derive_category(query) {
                Some(derived) => {
                    let filtered =
                        self.search(&query_vector, Some(&MetadataFilter::category(&derived)));
                    if filtered.is_empty() {
                        tracing::debug!(category = %derived, "derived category matched nothing, searching unfiltered");
                        self.search(&query_vector, None)
                    } else {
                        filtered
                    }
                }
                None => self.search(&query_vector, None),
            },
        };

        let (assembled_text, used) = assemble(&candidates, self.settings.context_budget);
        Ok(RetrievalContext {
            query_vector,
            candidates,
            assembled_text,
            used,
        })
    }

    /// Top-k query with the similarity threshold applied.
    fn search(&self, vector: &[f32], filter: Option<&MetadataFilter>) -> Vec<ScoredChunk> {
        match self.index.query(vector, self.settings.top_k, filter) {
            Ok(results) => results
                .into_iter()
                .filter(|c| c.score >= self.settings.min_similarity)
                .collect(),
            Err(e) => {
                tracing::error!(error = %e, "consistency: index query failed");
                Vec::new()
            }
        }
    }

    /// A known category named by one of the query's words.
    fn derive_category(&self, query: &str) -> Option<String> {
        let categories = self.index.categories();
        if categories.is_empty() {
            return None;
        }
        let words: BTreeSet<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        categories
            .into_iter()
            .find(|category| words.contains(&category.to_lowercase()))
    }
}

fn snippet(chunk: &Chunk) -> String {
    if chunk.metadata.title.is_empty() {
        chunk.text.clone()
    } else {
        format!("[{}]\n{}", chunk.metadata.title, chunk.text)
    }
}

/// Concatenate candidates, best first, while they fit in `budget` chars.
///
/// Returns the context text and how many leading candidates it contains.
/// A first candidate longer than the budget is truncated to fit; assembly
/// stops at the first later candidate that does not fit.
pub fn assemble(candidates: &[ScoredChunk], budget: usize) -> (String, usize) {
    const SEPARATOR: &str = "\n\n";

    let mut text = String::new();
    let mut len = 0;
    let mut used = 0;
    if budget == 0 {
        return (text, used);
    }

    for candidate in candidates {
        let entry = snippet(&candidate.chunk);
        let entry_len = entry.chars().count();
        let sep_len = if used == 0 { 0 } else { SEPARATOR.len() };

        if len + sep_len + entry_len <= budget {
            if used > 0 {
                text.push_str(SEPARATOR);
            }
            text.push_str(&entry);
            len += sep_len + entry_len;
            used += 1;
        } else {
            if used == 0 {
                text.extend(entry.chars().take(budget));
                used = 1;
            }
            break;
        }
    }
    (text, used)
}
