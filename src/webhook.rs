//! Signed webhook ingestion.
//!
//! [`WebhookIngestor::ingest`] processes one delivery:
//!
//! 1. Verify the `X-Signature-256` header (hex HMAC-SHA256 of the raw body,
//!    optionally prefixed `sha256=`) in constant time, before parsing.
//! 2. Parse `{type, data, event_id?}`. A `message` event must carry a
//!    non-blank `data.message`.
//! 3. Derive the idempotency key: `event_id` (or `id`), else
//!    `data.event_id`, else the SHA-256 of the raw body.
//! 4. Check-and-insert the key into the [`DedupCache`] in one step.
//! 5. Dispatch by [`EventKind`] to the [`EventHandler`].
//!
//! A failed dispatch forgets the key so the producer's retry is processed.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::compose::{RetrievalComposer, SessionContext};
use crate::config::WebhookConfig;
use crate::worker::SyncTrigger;

pub const SIGNATURE_HEADER: &str = "X-Signature-256";

type HmacSha256 = Hmac<Sha256>;

// ============ Events ============

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The knowledge source changed; run a synchronization pass.
    KbUpdate,
    /// A customer message to answer.
    Message,
    Unknown(String),
}

impl EventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "kb-update" | "kb_update" | "knowledge_base_update" => EventKind::KbUpdate,
            "message" => EventKind::Message,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::KbUpdate => "kb-update",
            EventKind::Message => "message",
            EventKind::Unknown(kind) => kind.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub kind: EventKind,
    /// The `data` object, or `null` when absent.
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub signature_valid: bool,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_kb_update(&self, event: &WebhookEvent) -> Result<()>;
    async fn on_message(&self, event: &WebhookEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestReason {
    Accepted,
    Duplicate,
    InvalidSignature,
    Malformed,
    /// Accepted and recorded, but no handler exists for the event type.
    Ignored,
    DispatchFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestResult {
    pub accepted: bool,
    pub reason: IngestReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

impl IngestResult {
    fn new(accepted: bool, reason: IngestReason, event_id: Option<String>) -> Self {
        Self {
            accepted,
            reason,
            event_id,
        }
    }

    fn rejected(reason: IngestReason) -> Self {
        Self::new(false, reason, None)
    }
}

// ============ Dedup ============

/// Bounded set of recently seen event ids.
///
/// Entries expire after `retention`; when more than `capacity` ids are
/// tracked the oldest are evicted first.
pub struct DedupCache {
    retention: Duration,
    capacity: usize,
    inner: Mutex<DedupInner>,
}

#[derive(Default)]
struct DedupInner {
    seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl DedupInner {
    /// Pop the oldest live entry. Entries forgotten or re-inserted since
    /// they were queued are skipped.
    fn pop_oldest(&mut self) -> bool {
        while let Some((at, id)) = self.order.pop_front() {
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
                return true;
            }
        }
        false
    }
}

impl DedupCache {
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            retention,
            capacity: capacity.max(1),
            inner: Mutex::new(DedupInner::default()),
        }
    }

    pub fn from_config(config: &WebhookConfig) -> Self {
        Self::new(Duration::from_secs(config.retention_secs), config.max_tracked)
    }

    fn lock(&self) -> MutexGuard<'_, DedupInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record `id` as seen at `now`. Returns `false` if it was already seen
    /// within the retention window.
    pub fn check_and_insert(&self, id: &str, now: Instant) -> bool {
        let mut inner = self.lock();

        while let Some((at, _)) = inner.order.front() {
            if now.saturating_duration_since(*at) < self.retention {
                break;
            }
            if let Some((at, id)) = inner.order.pop_front() {
                if inner.seen.get(&id) == Some(&at) {
                    inner.seen.remove(&id);
                }
            }
        }

        if let Some(at) = inner.seen.get(id) {
            if now.saturating_duration_since(*at) < self.retention {
                return false;
            }
        }

        while inner.seen.len() >= self.capacity {
            if !inner.pop_oldest() {
                break;
            }
        }
        inner.seen.insert(id.to_string(), now);
        inner.order.push_back((now, id.to_string()));
        true
    }

    /// Drop `id` so a later delivery is processed again.
    pub fn forget(&self, id: &str) {
        let mut inner = self.lock();
        if let Some(at) = inner.seen.remove(id) {
            inner.order.retain(|(queued_at, queued)| !(*queued_at == at && queued == id));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============ Ingestor ============

pub struct WebhookIngestor {
    secret: Vec<u8>,
    dedup: DedupCache,
    handler: Arc<dyn EventHandler>,
}

impl WebhookIngestor {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        dedup: DedupCache,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            bail!("webhook secret must not be empty");
        }
        Ok(Self {
            secret,
            dedup,
            handler,
        })
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Constant-time check of `header` against the body's HMAC.
    pub fn verify_signature(&self, body: &[u8], header: Option<&str>) -> bool {
        let Some(header) = header else {
            return false;
        };
        let hex_sig = header.trim();
        let hex_sig = hex_sig.strip_prefix("sha256=").unwrap_or(hex_sig);
        let Ok(expected) = hex::decode(hex_sig) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            return false;
        };
        mac.update(body);
        mac.verify_slice(&expected).is_ok()
    }

    pub async fn ingest(&self, body: &[u8], signature: Option<&str>) -> IngestResult {
        if !self.verify_signature(body, signature) {
            tracing::warn!(bytes = body.len(), "webhook rejected: invalid signature");
            return IngestResult::rejected(IngestReason::InvalidSignature);
        }

        let json: Value = match serde_json::from_slice(body) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "webhook rejected: malformed JSON");
                return IngestResult::rejected(IngestReason::Malformed);
            }
        };
        let Some(kind) = json.get("type").and_then(Value::as_str) else {
            tracing::warn!("webhook rejected: missing type");
            return IngestResult::rejected(IngestReason::Malformed);
        };

        let kind = EventKind::parse(kind);
        if kind == EventKind::Message && message_text(json.get("data")).is_none() {
            tracing::warn!("webhook rejected: message event has no data.message");
            return IngestResult::rejected(IngestReason::Malformed);
        }

        let event = WebhookEvent {
            event_id: event_id(&json, body),
            kind,
            payload: json.get("data").cloned().unwrap_or(Value::Null),
            received_at: Utc::now(),
            signature_valid: true,
        };
        let event_id = Some(event.event_id.clone());

        if !self.dedup.check_and_insert(&event.event_id, Instant::now()) {
            tracing::warn!(event_id = %event.event_id, kind = event.kind.as_str(), "duplicate webhook event");
            return IngestResult::new(false, IngestReason::Duplicate, event_id);
        }

        let dispatched = match &event.kind {
            EventKind::KbUpdate => self.handler.on_kb_update(&event).await,
            EventKind::Message => self.handler.on_message(&event).await,
            EventKind::Unknown(kind) => {
                tracing::info!(event_id = %event.event_id, kind = %kind, "ignoring webhook event of unknown type");
                return IngestResult::new(true, IngestReason::Ignored, event_id);
            }
        };

        match dispatched {
            Ok(()) => {
                tracing::info!(event_id = %event.event_id, kind = event.kind.as_str(), "webhook event accepted");
                IngestResult::new(true, IngestReason::Accepted, event_id)
            }
            Err(e) => {
                self.dedup.forget(&event.event_id);
                tracing::warn!(event_id = %event.event_id, error = %format!("{:#}", e), "webhook dispatch failed");
                IngestResult::new(false, IngestReason::DispatchFailed, event_id)
            }
        }
    }
}

/// Hex HMAC-SHA256 of `body`, formatted for the signature header.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).context("invalid HMAC key")?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn message_text(data: Option<&Value>) -> Option<&str> {
    data?
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
}

fn event_id(json: &Value, body: &[u8]) -> String {
    let id_of = |value: Option<&Value>| match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    id_of(json.get("event_id"))
        .or_else(|| id_of(json.get("id")))
        .or_else(|| id_of(json.pointer("/data/event_id")))
        .unwrap_or_else(|| hex::encode(Sha256::digest(body)))
}

// ============ Dispatch ============

/// Routes `kb-update` events to the sync worker and answers `message`
/// events in the background.
pub struct RoutingHandler {
    trigger: SyncTrigger,
    composer: Option<Arc<RetrievalComposer>>,
    cancel: CancellationToken,
}

impl RoutingHandler {
    pub fn new(
        trigger: SyncTrigger,
        composer: Option<Arc<RetrievalComposer>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            trigger,
            composer,
            cancel,
        }
    }
}

#[async_trait]
impl EventHandler for RoutingHandler {
    async fn on_kb_update(&self, event: &WebhookEvent) -> Result<()> {
        if !self.trigger.request() {
            bail!("sync worker is not running");
        }
        tracing::debug!(event_id = %event.event_id, "sync requested");
        Ok(())
    }

    async fn on_message(&self, event: &WebhookEvent) -> Result<()> {
        let text = message_text(Some(&event.payload))
            .context("message event has no data.message")?
            .to_string();

        let Some(composer) = self.composer.clone() else {
            tracing::info!(event_id = %event.event_id, "message event received, no composer configured");
            return Ok(());
        };
        let field = |name: &str| {
            event
                .payload
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let session = SessionContext {
            session_id: field("session_id"),
            user_id: field("user_id"),
            category: field("category"),
            history: Vec::new(),
        };
        let event_id = event.event_id.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            match composer.answer(&text, session, &cancel).await {
                Ok(turn) => {
                    tracing::info!(event_id = %event_id, session_id = %turn.session_id, "answered webhook message");
                }
                Err(e) => tracing::warn!(event_id = %event_id, error = %e, "webhook message not answered"),
            }
        });
        Ok(())
    }
}
