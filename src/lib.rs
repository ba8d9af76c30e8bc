//! # Support Harness
//!
//! The knowledge and event core of a customer-support chat assistant.
//!
//! A spreadsheet of support articles is kept in sync with an in-memory
//! vector index; customer messages are answered by retrieving the most
//! similar snippets and handing them to a language model; signed webhooks
//! trigger re-syncs and deliver messages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌─────────────┐
//! │ Spreadsheet  │──▶│ KnowledgeSynchron- │──▶│ VectorIndex │◀──┐
//! │ (source)     │   │ izer (diff+embed)  │   └─────────────┘   │
//! └──────────────┘   └─────────┬──────────┘                     │
//!        ▲                     ▼                       ┌────────┴─────────┐
//!        │               ┌──────────┐                  │ RetrievalComposer│◀── chat
//!        │               │  SQLite  │                  └────────┬─────────┘
//!  SyncWorker ◀──────────┴──────────┘                           ▼
//!        ▲                                              ConversationSink
//!        └──── WebhookIngestor ◀── signed webhook
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`source`] | Knowledge sources and row validation |
//! | [`sync`] | Incremental index synchronization |
//! | [`worker`] | Background sync on interval and trigger |
//! | [`compose`] | Retrieval-augmented answers |
//! | [`webhook`] | Signed webhook ingestion and dispatch |
//! | [`embedding`] | Embedding providers |
//! | [`generation`] | Answer generation providers |
//! | [`upstream`] | Bounded, retrying pool for upstream calls |
//! | [`state`] | Sync state and the `StateStore` trait |
//! | [`sqlite_state`] | SQLite-backed `StateStore` |
//! | [`conversation`] | Conversation turn sinks |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//!
//! Chunking, the vector index, data models and confidence scoring live in
//! the runtime-agnostic `support-harness-core` crate.

pub mod compose;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod migrate;
pub mod runtime;
pub mod server;
pub mod source;
pub mod sqlite_state;
pub mod state;
pub mod sync;
pub mod upstream;
pub mod webhook;
pub mod worker;
