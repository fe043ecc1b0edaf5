//! Chunk persistence: replace-all saves, embedding work queues, and the
//! date-ranged reads the digest generator consumes.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::chunker::Chunk;
use crate::embedding::blob_to_vec;
use crate::models::StoredChunk;

use super::Store;

/// A chunk awaiting an embedding under some `(provider, model)`.
#[derive(Debug, Clone)]
pub struct PendingChunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_text: String,
    pub token_count: i64,
}

/// Embedding coverage for one `(provider, model)`.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCounts {
    pub total: i64,
    pub embedded: i64,
    pub pending: i64,
    pub orphaned: i64,
}

/// A chunk as consumed by the digest generator, optionally with its vector.
#[derive(Debug, Clone)]
pub struct DigestChunk {
    pub id: i64,
    pub document_id: i64,
    pub title: String,
    pub chunk_text: String,
    pub embedding: Option<Vec<f32>>,
}

impl Store {
    /// Replace all chunks of a document in a single transaction. Old chunk
    /// rows and their FTS entries are deleted first; embeddings of the
    /// removed chunks become orphans until the cleanup pass.
    pub async fn save_chunks(&self, document_id: i64, chunks: &[Chunk]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (document_id, chunk_index, chunk_text, char_start, char_end, token_count)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(document_id)
            .bind(chunk.index)
            .bind(&chunk.text)
            .bind(chunk.char_start)
            .bind(chunk.char_end)
            .bind(chunk.token_count)
            .execute(&mut *tx)
            .await?;

            let chunk_id: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
                .fetch_one(&mut *tx)
                .await?;

            sqlx::query(
                "INSERT INTO chunks_fts (chunk_id, document_id, chunk_text) VALUES (?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(document_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chunks.len() as u64)
    }

    pub async fn get_chunks(&self, document_id: i64) -> Result<Vec<StoredChunk>> {
        let rows =
            sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
                .bind(document_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(StoredChunk::from_row).collect())
    }

    pub async fn get_chunk(&self, chunk_id: i64) -> Result<Option<StoredChunk>> {
        let row = sqlx::query("SELECT * FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(StoredChunk::from_row))
    }

    /// Chunks with no embedding under `(provider, model)`, in id order past
    /// the cursor.
    pub async fn get_chunks_for_embedding(
        &self,
        cursor_chunk_id: Option<i64>,
        provider: &str,
        model: &str,
        limit: i64,
    ) -> Result<Vec<PendingChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.document_id, c.chunk_text, c.token_count
            FROM chunks c
            WHERE c.id > ?
              AND NOT EXISTS (
                SELECT 1 FROM embeddings e
                WHERE e.chunk_id = c.id AND e.provider = ? AND e.model = ?
              )
            ORDER BY c.id
            LIMIT ?
            "#,
        )
        .bind(cursor_chunk_id.unwrap_or(0))
        .bind(provider)
        .bind(model)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let text: String = row.get("chunk_text");
                let token_count: Option<i64> = row.get("token_count");
                PendingChunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    token_count: token_count.unwrap_or((text.len() / 4) as i64),
                    chunk_text: text,
                }
            })
            .collect())
    }

    /// Embedding coverage under `(provider, model)`. `pending` is clamped at
    /// zero so orphans never push it negative.
    pub async fn count_chunks_for_embedding(
        &self,
        provider: &str,
        model: &str,
    ) -> Result<EmbeddingCounts> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;

        let embedded: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM embeddings e
            WHERE e.provider = ? AND e.model = ?
              AND e.chunk_id IS NOT NULL
              AND EXISTS (SELECT 1 FROM chunks c WHERE c.id = e.chunk_id)
            "#,
        )
        .bind(provider)
        .bind(model)
        .fetch_one(&self.pool)
        .await?;

        let orphaned: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM embeddings e
            WHERE e.chunk_id IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.id = e.chunk_id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EmbeddingCounts {
            total,
            embedded,
            pending: (total - embedded).max(0),
            orphaned,
        })
    }

    /// The chunk texts immediately before and after `chunk_index` in the
    /// same document, for search context windows.
    pub async fn get_chunk_neighbors(
        &self,
        document_id: i64,
        chunk_index: i64,
    ) -> Result<(Option<String>, Option<String>)> {
        let before: Option<String> = sqlx::query_scalar(
            "SELECT chunk_text FROM chunks WHERE document_id = ? AND chunk_index = ?",
        )
        .bind(document_id)
        .bind(chunk_index - 1)
        .fetch_optional(&self.pool)
        .await?;

        let after: Option<String> = sqlx::query_scalar(
            "SELECT chunk_text FROM chunks WHERE document_id = ? AND chunk_index = ?",
        )
        .bind(document_id)
        .bind(chunk_index + 1)
        .fetch_optional(&self.pool)
        .await?;

        Ok((before, after))
    }

    /// Chunks whose document's effective date falls in the inclusive range,
    /// ordered by document-saved descending then chunk index. With
    /// `provider`/`model` set, only chunks embedded under that pair are
    /// returned and their vectors are deserialized from the stored blobs.
    pub async fn get_chunks_in_date_range(
        &self,
        date_from: &str,
        date_to: &str,
        limit: i64,
        vectors: Option<(&str, &str)>,
    ) -> Result<Vec<DigestChunk>> {
        let rows = match vectors {
            Some((provider, model)) => {
                sqlx::query(
                    r#"
                    SELECT c.id, c.document_id, c.chunk_text,
                           COALESCE(d.title, '') AS title,
                           e.embedding AS embedding
                    FROM chunks c
                    JOIN documents d ON d.id = c.document_id
                    JOIN embeddings e ON e.chunk_id = c.id AND e.provider = ? AND e.model = ?
                    WHERE date(COALESCE(d.saved_at,
                            (SELECT MIN(h.highlighted_at) FROM highlights h WHERE h.document_id = d.id)))
                          BETWEEN date(?) AND date(?)
                    ORDER BY d.saved_at DESC, c.chunk_index ASC
                    LIMIT ?
                    "#,
                )
                .bind(provider)
                .bind(model)
                .bind(date_from)
                .bind(date_to)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT c.id, c.document_id, c.chunk_text,
                           COALESCE(d.title, '') AS title,
                           NULL AS embedding
                    FROM chunks c
                    JOIN documents d ON d.id = c.document_id
                    WHERE date(COALESCE(d.saved_at,
                            (SELECT MIN(h.highlighted_at) FROM highlights h WHERE h.document_id = d.id)))
                          BETWEEN date(?) AND date(?)
                    ORDER BY d.saved_at DESC, c.chunk_index ASC
                    LIMIT ?
                    "#,
                )
                .bind(date_from)
                .bind(date_to)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Option<Vec<u8>> = row.get("embedding");
                DigestChunk {
                    id: row.get("id"),
                    document_id: row.get("document_id"),
                    title: row.get("title"),
                    chunk_text: row.get("chunk_text"),
                    embedding: blob.map(|b| blob_to_vec(&b)),
                }
            })
            .collect())
    }

    pub async fn count_chunks(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
