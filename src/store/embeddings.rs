//! Embedding persistence: atomic batch writes mirrored into the
//! per-dimension vector tables, orphan cleanup, and the raw KNN query.

use anyhow::{bail, Result};
use sqlx::Row;

use crate::migrate::{vec_table, SUPPORTED_DIMS};

use super::Store;

/// One KNN match: the embedding row id and its distance.
#[derive(Debug, Clone, Copy)]
pub struct KnnHit {
    pub embedding_id: i64,
    pub distance: f64,
}

impl Store {
    /// Insert a batch of chunk embeddings and mirror each vector into the
    /// matching per-dimension table, all in one transaction. Returns the
    /// number of rows written.
    pub async fn save_embeddings_batch(
        &self,
        rows: &[(i64, Vec<u8>)],
        dims: usize,
        provider: &str,
        model: &str,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let table = vec_table(dims);
        if self.vector_enabled && table.is_none() {
            bail!(
                "Unsupported embedding dimension {} (supported: {:?})",
                dims,
                SUPPORTED_DIMS
            );
        }

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for (chunk_id, blob) in rows {
            sqlx::query(
                r#"
                INSERT INTO embeddings (chunk_id, provider, model, dims, embedding)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id, provider, model) DO UPDATE SET
                    dims = excluded.dims,
                    embedding = excluded.embedding
                "#,
            )
            .bind(chunk_id)
            .bind(provider)
            .bind(model)
            .bind(dims as i64)
            .bind(blob.as_slice())
            .execute(&mut *tx)
            .await?;

            let embedding_id: i64 = sqlx::query_scalar(
                "SELECT id FROM embeddings WHERE chunk_id = ? AND provider = ? AND model = ?",
            )
            .bind(chunk_id)
            .bind(provider)
            .bind(model)
            .fetch_one(&mut *tx)
            .await?;

            if let (true, Some(table)) = (self.vector_enabled, table) {
                sqlx::query(&format!(
                    "DELETE FROM {} WHERE embedding_id = ?",
                    table
                ))
                .bind(embedding_id)
                .execute(&mut *tx)
                .await?;

                sqlx::query(&format!(
                    "INSERT INTO {} (embedding, embedding_id) VALUES (?, ?)",
                    table
                ))
                .bind(blob.as_slice())
                .bind(embedding_id)
                .execute(&mut *tx)
                .await?;
            }

            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Delete embeddings whose chunk no longer exists, removing their vector
    /// mirrors first. Returns the number of removed embedding rows.
    pub async fn cleanup_orphan_embeddings(&self) -> Result<u64> {
        let orphans = sqlx::query(
            r#"
            SELECT e.id, e.dims FROM embeddings e
            WHERE e.chunk_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.id = e.chunk_id)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if orphans.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for row in &orphans {
            let id: i64 = row.get("id");
            let dims: i64 = row.get("dims");

            if self.vector_enabled {
                if let Some(table) = vec_table(dims as usize) {
                    sqlx::query(&format!("DELETE FROM {} WHERE embedding_id = ?", table))
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
            sqlx::query("DELETE FROM embeddings WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(orphans.len() as u64)
    }

    /// Raw KNN over the vector table for `dims`. Returns `(embedding_id,
    /// distance)` pairs in ascending distance; metadata resolution happens
    /// per hit because the KNN table cannot join.
    pub async fn knn_chunks(&self, query_blob: &[u8], dims: usize, k: i64) -> Result<Vec<KnnHit>> {
        if !self.vector_enabled {
            bail!("Vector search unavailable: sqlite-vec extension not loaded");
        }
        let Some(table) = vec_table(dims) else {
            bail!(
                "Unsupported embedding dimension {} (supported: {:?})",
                dims,
                SUPPORTED_DIMS
            );
        };

        let rows = sqlx::query(&format!(
            "SELECT embedding_id, distance FROM {} WHERE embedding MATCH ? AND k = ? ORDER BY distance",
            table
        ))
        .bind(query_blob)
        .bind(k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| KnnHit {
                embedding_id: row.get("embedding_id"),
                distance: row.get("distance"),
            })
            .collect())
    }

    /// Count of vector rows for a dimension, for the §8 mirror invariant and
    /// the stats surface.
    pub async fn count_vector_rows(&self, dims: usize) -> Result<i64> {
        if !self.vector_enabled {
            return Ok(0);
        }
        let Some(table) = vec_table(dims) else {
            return Ok(0);
        };
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Document-level embeddings for the legacy search path.
    pub async fn get_document_embeddings(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<Vec<(i64, Vec<u8>)>> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, embedding FROM embeddings
            WHERE document_id IS NOT NULL AND provider = ? AND model = ?
            "#,
        )
        .bind(provider)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("document_id"), row.get("embedding")))
            .collect())
    }
}
