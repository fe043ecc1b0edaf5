//! Persistence layer: one embedded SQLite database behind a cloneable
//! handle.
//!
//! Every mutating method commits before returning; batch mutations (chunk
//! replace, embedding batches) commit exactly once for the whole batch.
//! Storage failures are fatal for the calling operation; the caller decides
//! whether that fails the whole job or just the item.

mod chunks;
mod digests;
mod documents;
mod embeddings;
mod prompts;
mod usage;

pub use chunks::{DigestChunk, EmbeddingCounts, PendingChunk};
pub use digests::{DigestDetail, DigestSummary};
pub use documents::{DocumentForFetch, FetchStats, SavedDocument};
pub use embeddings::KnnHit;
pub use prompts::CustomPrompt;
pub use usage::{UsageBucket, UsagePeriod, UsageRecord, UsageStats};

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;
use crate::migrate;

/// Handle to the database. Cheap to clone; all methods live in the
/// submodules of this module.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    vector_enabled: bool,
}

impl Store {
    /// Open the database, load the vector extension if configured, and run
    /// migrations.
    pub async fn open(config: &Config) -> Result<Store> {
        let vector_enabled = config.db.vector_extension.is_some();
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool, vector_enabled).await?;
        Ok(Store {
            pool,
            vector_enabled,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Whether the sqlite-vec extension was loaded. When false, KNN queries
    /// and vector mirrors are unavailable and callers fall back to lexical
    /// behavior.
    pub fn vector_enabled(&self) -> bool {
        self.vector_enabled
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
