//! Conversation turn sinks.
//!
//! Every answered message produces one [`ConversationTurn`] that is handed
//! to a [`ConversationSink`]. Turns are write-only from this crate's point
//! of view. A sink failure is logged by the caller and never fails the
//! answer.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use support_harness_core::models::ConversationTurn;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::ConversationsConfig;

#[async_trait]
pub trait ConversationSink: Send + Sync {
    async fn record(&self, turn: &ConversationTurn) -> Result<()>;
}

pub fn create_sink(config: &ConversationsConfig) -> Result<Arc<dyn ConversationSink>> {
    match config.sink.as_str() {
        "log" => Ok(Arc::new(LogSink)),
        "jsonl" => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("conversations.path required for jsonl sink"))?;
            Ok(Arc::new(JsonlSink::new(path)))
        }
        other => bail!("Unknown conversation sink: {}", other),
    }
}

/// Emits each turn as a structured `tracing` event.
pub struct LogSink;

#[async_trait]
impl ConversationSink for LogSink {
    async fn record(&self, turn: &ConversationTurn) -> Result<()> {
        tracing::info!(
            target: "conversation",
            session_id = %turn.session_id,
            user_id = turn.user_id.as_deref().unwrap_or("anonymous"),
            confidence = turn.confidence,
            knowledge_match = turn.knowledge_match,
            escalate = turn.escalate,
            sources = ?turn.sources,
            "conversation turn"
        );
        Ok(())
    }
}

/// Appends each turn as one JSON line.
pub struct JsonlSink {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ConversationSink for JsonlSink {
    async fn record(&self, turn: &ConversationTurn) -> Result<()> {
        let mut line = serde_json::to_string(turn)?;
        line.push('\n');

        let _guard = self.write.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
