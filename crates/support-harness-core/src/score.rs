//! Answer confidence scoring.
//!
//! Confidence blends retrieval quality (the mean similarity of the snippets
//! placed in the prompt) with the generator's own confidence:
//!
//! ```text
//! confidence = clamp(w_sim × avg_similarity + w_model × model_confidence, 0, 1)
//! ```
//!
//! Both weights are 0.5. A non-finite input yields `0.0`.

/// Weight of the retrieval similarity term.
pub const SIMILARITY_WEIGHT: f64 = 0.5;
/// Weight of the model confidence term.
pub const MODEL_WEIGHT: f64 = 0.5;

/// Combine mean similarity and model confidence into a value in `[0, 1]`.
///
/// ```rust
/// use support_harness_core::score::combine_confidence;
///
/// assert!((combine_confidence(0.8, 0.5) - 0.65).abs() < 1e-9);
/// assert_eq!(combine_confidence(f64::NAN, 0.5), 0.0);
/// ```
pub fn combine_confidence(avg_similarity: f64, model_confidence: f64) -> f64 {
    let raw = SIMILARITY_WEIGHT * avg_similarity + MODEL_WEIGHT * model_confidence;
    if !raw.is_finite() {
        return 0.0;
    }
    raw.clamp(0.0, 1.0)
}

/// Arithmetic mean of `scores`, or `0.0` when empty.
pub fn mean_similarity(scores: &[f32]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().map(|&s| f64::from(s)).sum::<f64>() / scores.len() as f64
}

/// Cap a confidence value at `ceiling`. Used on the no-match and degraded
/// paths so the caller never sees high confidence without knowledge.
pub fn cap(confidence: f64, ceiling: f64) -> f64 {
    if !confidence.is_finite() {
        return 0.0;
    }
    confidence.min(ceiling).max(0.0)
}
