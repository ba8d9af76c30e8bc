//! Component wiring shared by the CLI commands and the HTTP server.

use std::sync::Arc;

use anyhow::Result;
use support_harness_core::index::{InMemoryIndex, VectorIndex};

use crate::compose::RetrievalComposer;
use crate::config::Config;
use crate::conversation::create_sink;
use crate::embedding::create_embedder;
use crate::generation::create_generator;
use crate::source::{create_source, DocumentSource};
use crate::sqlite_state::SqliteStateStore;
use crate::sync::KnowledgeSynchronizer;
use crate::upstream::UpstreamPool;
use crate::{db, migrate};

/// Every long-lived component, built once from [`Config`].
///
/// The synchronizer and composer share one index, one embedder and one
/// upstream pool, so the concurrency bound covers both.
pub struct Runtime {
    pub index: Arc<dyn VectorIndex>,
    pub synchronizer: Arc<KnowledgeSynchronizer>,
    pub composer: Arc<RetrievalComposer>,
    pub source: Arc<dyn DocumentSource>,
}

impl Runtime {
    /// Build components and migrate the database. The index starts empty;
    /// call [`KnowledgeSynchronizer::restore`] to load persisted chunks.
    pub async fn build(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        let store = Arc::new(SqliteStateStore::new(pool));

        let embedder = create_embedder(&config.embedding)?;
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryIndex::new(embedder.dims()));
        let upstream = UpstreamPool::from_config(&config.upstream);

        let synchronizer = Arc::new(KnowledgeSynchronizer::new(
            index.clone(),
            embedder.clone(),
            store,
            upstream.clone(),
            config.chunking.clone(),
        ));
        let composer = Arc::new(RetrievalComposer::new(
            index.clone(),
            embedder.clone(),
            create_generator(&config.generation)?,
            create_sink(&config.conversations)?,
            upstream,
            config.retrieval.clone(),
        ));

        tracing::debug!(
            embedder = embedder.model_name(),
            dims = embedder.dims(),
            source = config.source.kind.as_str(),
            "runtime built"
        );

        Ok(Self {
            index,
            synchronizer,
            composer,
            source: create_source(&config.source)?,
        })
    }
}
