mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use support_harness::compose::RetrievalComposer;
use support_harness::conversation::JsonlSink;
use support_harness::state::MemoryStateStore;
use support_harness::webhook::{
    sign, DedupCache, EventHandler, IngestReason, RoutingHandler, WebhookEvent, WebhookIngestor,
};
use support_harness::worker::SyncWorker;
use support_harness_core::index::VectorIndex;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "whsec-integration";

#[derive(Default)]
struct CountingHandler {
    kb_updates: AtomicUsize,
    messages: AtomicUsize,
}

#[async_trait]
impl EventHandler for CountingHandler {
    async fn on_kb_update(&self, _event: &WebhookEvent) -> anyhow::Result<()> {
        self.kb_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_message(&self, _event: &WebhookEvent) -> anyhow::Result<()> {
        self.messages.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn ingestor(handler: Arc<dyn EventHandler>) -> WebhookIngestor {
    WebhookIngestor::new(SECRET, DedupCache::new(Duration::from_secs(3600), 1000), handler)
        .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_any_flipped_byte_invalidates_signature() {
    let handler = Arc::new(CountingHandler::default());
    let ingestor = ingestor(handler.clone());
    let body = br#"{"type":"kb-update","event_id":"evt-flip","data":{"sheet":"kb"}}"#.to_vec();
    let signature = sign(SECRET.as_bytes(), &body).unwrap();

    for i in 0..body.len() {
        let mut tampered = body.clone();
        tampered[i] ^= 0x01;
        let result = ingestor.ingest(&tampered, Some(&signature)).await;
        assert_eq!(result.reason, IngestReason::InvalidSignature, "byte {}", i);
        assert!(!result.accepted);
    }
    assert_eq!(handler.kb_updates.load(Ordering::SeqCst), 0);
    assert!(ingestor.dedup().is_empty());

    let result = ingestor.ingest(&body, Some(&signature)).await;
    assert_eq!(result.reason, IngestReason::Accepted);
}

#[tokio::test]
async fn test_same_event_is_dispatched_once() {
    let handler = Arc::new(CountingHandler::default());
    let ingestor = ingestor(handler.clone());
    let body = br#"{"type":"message","event_id":"evt-1","data":{"message":"hi"}}"#;
    let signature = sign(SECRET.as_bytes(), body).unwrap();

    let first = ingestor.ingest(body, Some(&signature)).await;
    let second = ingestor.ingest(body, Some(&signature)).await;
    assert_eq!(first.reason, IngestReason::Accepted);
    assert_eq!(second.reason, IngestReason::Duplicate);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_accept_exactly_one() {
    let handler = Arc::new(CountingHandler::default());
    let ingestor = Arc::new(ingestor(handler.clone()));
    let body = br#"{"type":"kb-update","id":"evt-race"}"#.to_vec();
    let signature = sign(SECRET.as_bytes(), &body).unwrap();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let ingestor = ingestor.clone();
            let body = body.clone();
            let signature = signature.clone();
            tokio::spawn(async move { ingestor.ingest(&body, Some(&signature)).await })
        })
        .collect();

    let mut accepted = 0;
    for task in tasks {
        let result = task.await.unwrap();
        match result.reason {
            IngestReason::Accepted => accepted += 1,
            IngestReason::Duplicate => {}
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(handler.kb_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_body_hash_is_the_fallback_idempotency_key() {
    let handler = Arc::new(CountingHandler::default());
    let ingestor = ingestor(handler.clone());
    let body = br#"{"type":"kb-update"}"#;
    let signature = sign(SECRET.as_bytes(), body).unwrap();

    assert_eq!(ingestor.ingest(body, Some(&signature)).await.reason, IngestReason::Accepted);
    assert_eq!(ingestor.ingest(body, Some(&signature)).await.reason, IngestReason::Duplicate);

    let other = br#"{"type": "kb-update"}"#;
    let signature = sign(SECRET.as_bytes(), other).unwrap();
    assert_eq!(ingestor.ingest(other, Some(&signature)).await.reason, IngestReason::Accepted);
}

#[tokio::test]
async fn test_kb_update_triggers_background_sync() {
    let index = Arc::new(CountingIndex::new());
    let sync = Arc::new(synchronizer(
        index.clone(),
        Arc::new(CountingEmbedder::new()),
        Arc::new(MemoryStateStore::new()),
    ));
    let source = Arc::new(StaticSource::new(vec![refunds_row()]));
    let cancel = CancellationToken::new();
    let (worker, trigger) = SyncWorker::spawn(sync, source.clone(), None, cancel.clone());
    let ingestor = ingestor(Arc::new(RoutingHandler::new(trigger, None, cancel.clone())));

    let body = br#"{"type":"knowledge_base_update","event_id":"kb-1"}"#;
    let result = ingestor
        .ingest(body, Some(&sign(SECRET.as_bytes(), body).unwrap()))
        .await;
    assert_eq!(result.reason, IngestReason::Accepted);
    wait_for(|| index.count() > 0).await;
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

    cancel.cancel();
    worker.join().await;
}

#[tokio::test]
async fn test_dispatch_failure_allows_retry() {
    let sync = Arc::new(synchronizer(
        Arc::new(CountingIndex::new()),
        Arc::new(CountingEmbedder::new()),
        Arc::new(MemoryStateStore::new()),
    ));
    let cancel = CancellationToken::new();
    let (worker, trigger) = SyncWorker::spawn(
        sync,
        Arc::new(StaticSource::new(vec![])),
        None,
        cancel.clone(),
    );
    cancel.cancel();
    worker.join().await;

    let ingestor = ingestor(Arc::new(RoutingHandler::new(
        trigger,
        None,
        CancellationToken::new(),
    )));
    let body = br#"{"type":"kb-update","event_id":"kb-2"}"#;
    let signature = sign(SECRET.as_bytes(), body).unwrap();

    let first = ingestor.ingest(body, Some(&signature)).await;
    assert_eq!(first.reason, IngestReason::DispatchFailed);
    assert!(!first.accepted);
    // Not remembered, so the retry is processed rather than deduplicated.
    let retry = ingestor.ingest(body, Some(&signature)).await;
    assert_eq!(retry.reason, IngestReason::DispatchFailed);
}

#[tokio::test]
async fn test_message_event_is_answered_and_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let turns = dir.path().join("turns.jsonl");

    let index = Arc::new(CountingIndex::new());
    let embedder = Arc::new(CountingEmbedder::new());
    let sync = Arc::new(synchronizer(
        index.clone(),
        embedder.clone(),
        Arc::new(MemoryStateStore::new()),
    ));
    sync.run(&StaticSource::new(vec![refunds_row()]), &CancellationToken::new())
        .await
        .unwrap();

    let composer = Arc::new(RetrievalComposer::new(
        index,
        embedder,
        Arc::new(FakeGenerator::confident(0.8)),
        Arc::new(JsonlSink::new(&turns)),
        fast_pool(),
        retrieval_config(),
    ));
    let cancel = CancellationToken::new();
    let (worker, trigger) =
        SyncWorker::spawn(sync, Arc::new(StaticSource::new(vec![])), None, cancel.clone());
    let ingestor = ingestor(Arc::new(RoutingHandler::new(
        trigger,
        Some(composer),
        cancel.clone(),
    )));

    let body = br#"{"type":"message","event_id":"m-1","data":{"message":"how long for a refund","session_id":"sess-7","user_id":"u-1"}}"#;
    let result = ingestor
        .ingest(body, Some(&sign(SECRET.as_bytes(), body).unwrap()))
        .await;
    assert_eq!(result.reason, IngestReason::Accepted);

    wait_for(|| {
        std::fs::read_to_string(&turns)
            .map(|c| c.ends_with('\n'))
            .unwrap_or(false)
    })
    .await;
    let line = std::fs::read_to_string(&turns).unwrap();
    let turn: serde_json::Value = serde_json::from_str(line.lines().next().unwrap()).unwrap();
    assert_eq!(turn["session_id"], "sess-7");
    assert_eq!(turn["user_id"], "u-1");
    assert_eq!(turn["knowledge_match"], true);

    let empty = br#"{"type":"message","event_id":"m-2","data":{}}"#;
    let signature = sign(SECRET.as_bytes(), empty).unwrap();
    for _ in 0..2 {
        let result = ingestor.ingest(empty, Some(&signature)).await;
        assert_eq!(result.reason, IngestReason::Malformed);
        assert!(!result.accepted);
    }
    assert_eq!(std::fs::read_to_string(&turns).unwrap().lines().count(), 1);

    cancel.cancel();
    worker.join().await;
}
