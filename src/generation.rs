//! Answer generation capability.
//!
//! [`Generator`] is the opaque `generate(prompt context) -> (text,
//! confidence?)` capability used by the composer. Providers:
//!
//! - **[`OpenAiChatGenerator`]**: any OpenAI-compatible
//!   `POST {url}/chat/completions` endpoint (DeepSeek by default). Chat
//!   completions report no confidence, so the configured prior applies.
//! - **[`DisabledGenerator`]**: always unavailable. Every answer takes the
//!   degraded path; useful for exercising retrieval alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use support_harness_core::error::UpstreamError;
use support_harness_core::models::HistoryTurn;

use crate::config::GenerationConfig;
use crate::embedding::transport_error;

const SERVICE: &str = "generator";

/// Everything the generator sees for one user message.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub query: String,
    /// Assembled knowledge snippets. `None` when nothing matched.
    pub context: Option<String>,
    /// Most recent turns of the session, oldest first.
    pub history: Vec<HistoryTurn>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Self-reported confidence in `[0, 1]`, if the capability has one.
    pub confidence: Option<f64>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Make a single generation attempt.
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, UpstreamError>;
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiChatGenerator::from_config(config)?)),
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

/// Build the system message: assistant guidelines, the knowledge context
/// (or an explicit note that none matched), and recent history.
pub fn system_prompt(context: Option<&str>, history: &[HistoryTurn]) -> String {
    let mut prompt = String::from(
        "You are a customer support assistant. Answer in a friendly, professional and concise way.\n\
         \n\
         Guidelines:\n\
         1. Base factual answers on the knowledge base context below.\n\
         2. If the context does not answer the question, say so and offer to escalate to a human agent.\n\
         3. Ask a clarifying question when the request is ambiguous.\n\
         \n\
         Knowledge Base Context:\n",
    );
    match context {
        Some(context) if !context.trim().is_empty() => prompt.push_str(context),
        _ => prompt.push_str("(no knowledge base entry matched this question)"),
    }
    prompt.push_str("\n\nPrevious Conversation:\n");
    for turn in history {
        prompt.push_str(&format!(
            "User: {}\nAssistant: {}\n",
            turn.user, turn.assistant
        ));
    }
    prompt
}

// ============ OpenAI-compatible chat ============

pub struct OpenAiChatGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    api_key: Option<String>,
}

impl OpenAiChatGenerator {
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            tracing::warn!(env = %config.api_key_env, "generation API key not set");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_key,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": system_prompt(request.context.as_deref(), &request.history),
                },
                { "role": "user", "content": request.query },
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        })
    }
}

#[async_trait]
impl Generator for OpenAiChatGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::Unavailable {
                service: SERVICE.to_string(),
                message: "API key not configured".to_string(),
            })?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(api_key)
            .json(&self.request_body(request))
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
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<Generation, UpstreamError> {
    let text = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|choice| choice.pointer("/message/content"))
        .and_then(|content| content.as_str())
        .filter(|text| !text.trim().is_empty())
        .ok_or_else(|| UpstreamError::InvalidResponse {
            service: SERVICE.to_string(),
            message: "no completion in response".to_string(),
        })?;

    Ok(Generation {
        text: text.trim().to_string(),
        confidence: None,
    })
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, UpstreamError> {
        Err(UpstreamError::Unavailable {
            service: SERVICE.to_string(),
            message: "generation provider is disabled".to_string(),
        })
    }
}
