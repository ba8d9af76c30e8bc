//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/v1/chat` | Answer a customer message |
//! | `POST` | `/api/v1/webhook` | Signed webhook delivery (`X-Signature-256`) |
//! | `POST` | `/api/v1/knowledge-base/sync` | Run a synchronization pass now |
//! | `GET`  | `/health` | Health check (version, index size) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "message must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `invalid_signature` (401),
//! `sync_in_progress` (409), `source_unavailable` (502),
//! `unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so that browser chat
//! widgets can call the API directly.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use support_harness_core::models::HistoryTurn;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::compose::{RetrievalComposer, SessionContext};
use crate::config::Config;
use crate::error::{ComposeError, SyncError};
use crate::runtime::Runtime;
use crate::source::DocumentSource;
use crate::sync::{KnowledgeSynchronizer, SyncReport};
use crate::webhook::{
    DedupCache, IngestReason, IngestResult, RoutingHandler, WebhookIngestor, SIGNATURE_HEADER,
};
use crate::worker::SyncWorker;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub composer: Arc<RetrievalComposer>,
    pub synchronizer: Arc<KnowledgeSynchronizer>,
    pub source: Arc<dyn DocumentSource>,
    pub ingestor: Arc<WebhookIngestor>,
    /// Cancelled on shutdown; in-flight answers and passes observe it.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/chat", post(handle_chat))
        .route("/api/v1/webhook", post(handle_webhook))
        .route("/api/v1/knowledge-base/sync", post(handle_sync))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Serve `state` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Starts the support server.
///
/// Restores persisted state, optionally runs a startup pass, spawns the
/// background [`SyncWorker`], and serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let secret = config.webhook.secret()?;
    let runtime = Runtime::build(config).await?;
    runtime.synchronizer.restore().await?;

    let shutdown = CancellationToken::new();
    if config.sync.on_startup {
        match runtime
            .synchronizer
            .run(runtime.source.as_ref(), &shutdown)
            .await
        {
            Ok(report) => {
                tracing::info!(changes = report.changes(), "startup sync finished")
            }
            Err(e) => tracing::warn!(error = %e, "startup sync failed, serving restored state"),
        }
    }

    let (worker, trigger) = SyncWorker::spawn(
        runtime.synchronizer.clone(),
        runtime.source.clone(),
        config.sync.poll_interval(),
        shutdown.clone(),
    );
    let handler = Arc::new(RoutingHandler::new(
        trigger,
        Some(runtime.composer.clone()),
        shutdown.clone(),
    ));
    let ingestor = WebhookIngestor::new(secret, DedupCache::from_config(&config.webhook), handler)?;

    let state = AppState {
        composer: runtime.composer,
        synchronizer: runtime.synchronizer,
        source: runtime.source,
        ingestor: Arc::new(ingestor),
        shutdown: shutdown.clone(),
    };

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!(bind = %config.server.bind, "support server listening");

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C"),
        }
        signal.cancel();
    });

    serve(listener, state, shutdown.clone()).await?;
    shutdown.cancel();
    worker.join().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn unavailable(message: impl Into<String>) -> AppError {
    error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    documents: usize,
    chunks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        documents: state.synchronizer.state().len(),
        chunks: state.synchronizer.index().count(),
    })
}

// ============ POST /api/v1/chat ============

#[derive(Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

#[derive(Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub confidence: f64,
    pub knowledge_match: bool,
    pub escalate: bool,
    pub sources: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let session = SessionContext {
        session_id: req.session_id,
        user_id: req.user_id,
        history: req.history,
        category: req.category,
    };
    let cancel = state.shutdown.child_token();
    let turn = state
        .composer
        .answer(&req.message, session, &cancel)
        .await
        .map_err(|e| match e {
            ComposeError::Validation(message) => bad_request(message),
            ComposeError::Cancelled => unavailable("server is shutting down"),
        })?;

    Ok(Json(ChatResponse {
        response: turn.response,
        session_id: turn.session_id,
        confidence: turn.confidence,
        knowledge_match: turn.knowledge_match,
        escalate: turn.escalate,
        sources: turn.sources,
        timestamp: turn.timestamp,
    }))
}

// ============ POST /api/v1/webhook ============

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResult>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    let result = state.ingestor.ingest(&body, signature).await;

    match result.reason {
        IngestReason::InvalidSignature => Err(error(
            StatusCode::UNAUTHORIZED,
            "invalid_signature",
            "invalid signature",
        )),
        IngestReason::Malformed => Err(bad_request("malformed webhook payload")),
        IngestReason::DispatchFailed => Err(unavailable("event could not be dispatched, retry later")),
        IngestReason::Accepted | IngestReason::Duplicate | IngestReason::Ignored => {
            Ok(Json(result))
        }
    }
}

// ============ POST /api/v1/knowledge-base/sync ============

async fn handle_sync(State(state): State<AppState>) -> Result<Json<SyncReport>, AppError> {
    let cancel = state.shutdown.child_token();
    state
        .synchronizer
        .run(state.source.as_ref(), &cancel)
        .await
        .map(Json)
        .map_err(|e| match e {
            SyncError::InProgress => error(StatusCode::CONFLICT, "sync_in_progress", e.to_string()),
            SyncError::Fetch(_) => error(StatusCode::BAD_GATEWAY, "source_unavailable", e.to_string()),
            SyncError::Cancelled => unavailable("server is shutting down"),
            SyncError::Restore(_) => error(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()),
        })
}
