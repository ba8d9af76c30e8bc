//! Embedding providers.
//!
//! Concrete implementations of the core [`Embedder`] trait:
//!
//! - **[`HashEmbedder`]**: offline, deterministic feature hashing. No
//!   network, no model download. Good enough for development, tests, and
//!   small keyword-heavy FAQ sheets.
//! - **[`OpenAiEmbedder`]**: any OpenAI-compatible `POST {url}/embeddings`
//!   endpoint.
//!
//! Providers make exactly one attempt per call. Retry, backoff, concurrency
//! limits, and cancellation are applied by [`crate::upstream::UpstreamPool`].
//!
//! # Provider Selection
//!
//! ```rust
//! # use support_harness::config::EmbeddingConfig;
//! # use support_harness::embedding::create_embedder;
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.dims(), 256);
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use support_harness_core::embedding::Embedder;
use support_harness_core::error::UpstreamError;

use crate::config::EmbeddingConfig;

/// Dimensionality of [`HashEmbedder`] when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

const SERVICE: &str = "embedder";

/// Words too common in support questions to carry meaning.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "if", "in", "is", "it", "me", "my", "of", "on", "or", "the", "this", "that", "to",
    "was", "what", "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Text embedded for a chunk: its document title followed by the chunk text,
/// so that a title keyword matches every chunk of the document.
pub fn embed_input(title: &str, text: &str) -> String {
    if title.is_empty() {
        text.to_string()
    } else {
        format!("{}\n{}", title, text)
    }
}

pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAiEmbedder::from_config(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ Hash Embedder ============

/// Bag-of-words feature hashing into a fixed number of buckets.
///
/// Text is lowercased and split on non-alphanumeric characters; stopwords
/// are dropped and a plural `s` is stripped from words longer than three
/// characters. Each remaining token adds `1.0` to bucket
/// `sha256(token)[..8] mod dims`.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let digest = Sha256::digest(token.as_bytes());
            let mut prefix = [0u8; 8];
            prefix.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(prefix) % self.dims as u64) as usize;
            vector[bucket] += 1.0;
        }
        vector
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .map(|w| {
            if w.chars().count() > 3 && w.ends_with('s') && !w.ends_with("ss") {
                w[..w.len() - 1].to_string()
            } else {
                w
            }
        })
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        Ok(self.embed_sync(text))
    }
}

// ============ OpenAI-compatible Embedder ============

/// Calls `POST {url}/embeddings` with a bearer key.
///
/// The key is read from the environment variable named by
/// `embedding.api_key_env` when the embedder is built. A missing key does
/// not fail construction: every call then returns
/// [`UpstreamError::Unavailable`], which callers treat as a degraded path.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    api_key: Option<String>,
}

impl OpenAiEmbedder {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required"))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %config.api_key_env, "embedding API key not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model,
            dims,
            api_key,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::Unavailable {
                service: SERVICE.to_string(),
                message: "API key not configured".to_string(),
            })?;

        let body = serde_json::json!({
            "model": self.model,
            "input": [text],
        });

        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Status {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| transport_error(SERVICE, e))?;
        let vector = parse_embedding_response(&json)?;
        if vector.len() != self.dims {
            return Err(UpstreamError::InvalidResponse {
                service: SERVICE.to_string(),
                message: format!("expected {} dims, got {}", self.dims, vector.len()),
            });
        }
        Ok(vector)
    }
}

/// Map a reqwest failure onto the upstream taxonomy.
pub(crate) fn transport_error(service: &str, e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::Timeout {
            service: service.to_string(),
        }
    } else if e.is_decode() {
        UpstreamError::InvalidResponse {
            service: service.to_string(),
            message: e.to_string(),
        }
    } else {
        UpstreamError::Transport {
            service: service.to_string(),
            message: e.to_string(),
        }
    }
}

/// Extract `data[0].embedding` from an embeddings API response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>, UpstreamError> {
    let invalid = |message: &str| UpstreamError::InvalidResponse {
        service: SERVICE.to_string(),
        message: message.to_string(),
    };

    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| invalid("missing data[0].embedding"))?;

    embedding
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| invalid("non-numeric embedding component"))
        })
        .collect()
}
