//! # Support Harness Core
//!
//! Runtime-agnostic logic for Support Harness: data models, chunking, the
//! vector index, confidence scoring, and the [`embedding::Embedder`] trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Everything here is deterministic and can be exercised without network
//! access; the application crate wires it to real upstream services.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod index;
pub mod models;
pub mod score;
