//! SQLite-backed [`StateStore`].
//!
//! Uses the `sync_state` and `chunks` tables created by
//! [`crate::migrate::apply`]. Vectors are stored as little-endian `f32`
//! BLOBs and tags as a JSON array.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use support_harness_core::embedding::{blob_to_vec, vec_to_blob};
use support_harness_core::models::{Chunk, ChunkMetadata};

use crate::state::{StateStore, StoredDocument};

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self) -> Result<Vec<StoredDocument>> {
        let state_rows = sqlx::query("SELECT doc_id, content_hash FROM sync_state")
            .fetch_all(&self.pool)
            .await?;

        let mut docs: BTreeMap<String, StoredDocument> = state_rows
            .iter()
            .map(|row| {
                let doc_id: String = row.get("doc_id");
                let doc = StoredDocument {
                    doc_id: doc_id.clone(),
                    content_hash: row.get("content_hash"),
                    chunks: Vec::new(),
                };
                (doc_id, doc)
            })
            .collect();

        let chunk_rows = sqlx::query(
            "SELECT id, doc_id, position, title, category, tags_json, text, vector \
             FROM chunks ORDER BY doc_id, position",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in chunk_rows {
            let doc_id: String = row.get("doc_id");
            let id: String = row.get("id");
            // Orphans are left for reconciliation to report and drop.
            let Some(doc) = docs.get_mut(&doc_id) else {
                tracing::warn!(chunk_id = %id, doc_id = %doc_id, "persisted chunk without sync state");
                continue;
            };
            let tags_json: String = row.get("tags_json");
            let tags = serde_json::from_str(&tags_json)
                .with_context(|| format!("invalid tags_json for chunk {}", id))?;
            let position: i64 = row.get("position");
            let position = usize::try_from(position)
                .with_context(|| format!("invalid position {} for chunk {}", position, id))?;
            let vector: Vec<u8> = row.get("vector");
            doc.chunks.push(Chunk {
                id,
                source_doc_id: doc_id,
                text: row.get("text"),
                vector: blob_to_vec(&vector),
                metadata: ChunkMetadata {
                    title: row.get("title"),
                    category: row.get("category"),
                    tags,
                    position,
                },
            });
        }

        Ok(docs.into_values().collect())
    }

    async fn commit_document(&self, doc: &StoredDocument) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(&doc.doc_id)
            .execute(&mut *tx)
            .await?;

        for chunk in &doc.chunks {
            sqlx::query(
                "INSERT INTO chunks (id, doc_id, position, title, category, tags_json, text, vector) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&doc.doc_id)
            .bind(chunk.metadata.position as i64)
            .bind(&chunk.metadata.title)
            .bind(&chunk.metadata.category)
            .bind(serde_json::to_string(&chunk.metadata.tags)?)
            .bind(&chunk.text)
            .bind(vec_to_blob(&chunk.vector))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sync_state (doc_id, content_hash, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(doc_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc.doc_id)
        .bind(&doc.content_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn remove_document(&self, doc_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sync_state WHERE doc_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
