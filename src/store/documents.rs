//! Document and highlight persistence: dedup-aware saves, fetch bookkeeping,
//! and the FTS rebuild.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;

use crate::fetcher::FetchErrorKind;
use crate::models::{ArticleRecord, Document, FetchFailure, Highlight, HighlightRecord};
use crate::normalize::{canonical_url, normalize_category, text_hash16};

use super::Store;

/// Outcome of a document save: the row id plus whether the record landed on
/// an existing row found by canonical URL (a merge).
#[derive(Debug, Clone, Copy)]
pub struct SavedDocument {
    pub id: i64,
    pub merged: bool,
}

/// A document that still needs its full text fetched.
#[derive(Debug, Clone)]
pub struct DocumentForFetch {
    pub id: i64,
    pub url: Option<String>,
    pub title: String,
}

/// Counters for the fetch dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct FetchStats {
    pub total: i64,
    pub with_url: i64,
    pub with_fulltext: i64,
    pub failed: i64,
    pub pending: i64,
    pub without_chunks: i64,
    pub failures_by_type: HashMap<String, i64>,
}

impl Store {
    /// Save or update a document.
    ///
    /// Deduplication prefers a match by `(source, url_canonical)`; when that
    /// misses, the row is upserted by `(source, provider_id)`. Nullable
    /// fields only overwrite when the incoming value is non-null.
    pub async fn save_document(&self, record: &ArticleRecord) -> Result<SavedDocument> {
        let url_canonical = record.url.as_deref().map(canonical_url);
        let category = normalize_category(Some(&record.category), record.url.as_deref());
        // Only overwrite an existing category when the upstream record
        // actually carried one (or the linkedin URL rule fired).
        let category_update: Option<&str> =
            if record.category.trim().is_empty() && category == "article" {
                None
            } else {
                Some(category.as_str())
            };
        let now = Utc::now().to_rfc3339();

        if let Some(canonical) = &url_canonical {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT id FROM documents WHERE source = ? AND url_canonical = ?",
            )
            .bind(&record.source)
            .bind(canonical)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
                sqlx::query(
                    r#"
                    UPDATE documents SET
                        title = COALESCE(?, title),
                        author = COALESCE(?, author),
                        published_at = COALESCE(?, published_at),
                        saved_at = COALESCE(?, saved_at),
                        category = COALESCE(?, category),
                        word_count = COALESCE(?, word_count),
                        summary = COALESCE(?, summary),
                        fulltext = COALESCE(?, fulltext),
                        fulltext_html = COALESCE(?, fulltext_html),
                        raw_json = COALESCE(?, raw_json),
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(&record.title)
                .bind(&record.author)
                .bind(&record.published_at)
                .bind(&record.saved_at)
                .bind(category_update)
                .bind(record.word_count)
                .bind(&record.summary)
                .bind(&record.fulltext)
                .bind(&record.fulltext_html)
                .bind(&record.raw_json)
                .bind(&now)
                .bind(id)
                .execute(&self.pool)
                .await?;

                return Ok(SavedDocument { id, merged: true });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO documents (
                source, provider_id, url_original, url_canonical, title, author,
                published_at, saved_at, category, word_count, summary,
                fulltext, fulltext_html, raw_json, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source, provider_id) DO UPDATE SET
                url_original = COALESCE(excluded.url_original, url_original),
                url_canonical = COALESCE(excluded.url_canonical, url_canonical),
                title = COALESCE(excluded.title, title),
                author = COALESCE(excluded.author, author),
                published_at = COALESCE(excluded.published_at, published_at),
                saved_at = COALESCE(excluded.saved_at, saved_at),
                category = COALESCE(?, category),
                word_count = COALESCE(excluded.word_count, word_count),
                summary = COALESCE(excluded.summary, summary),
                fulltext = COALESCE(excluded.fulltext, fulltext),
                fulltext_html = COALESCE(excluded.fulltext_html, fulltext_html),
                raw_json = COALESCE(excluded.raw_json, raw_json),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.source)
        .bind(&record.provider_id)
        .bind(&record.url)
        .bind(&url_canonical)
        .bind(&record.title)
        .bind(&record.author)
        .bind(&record.published_at)
        .bind(&record.saved_at)
        .bind(&category)
        .bind(record.word_count)
        .bind(&record.summary)
        .bind(&record.fulltext)
        .bind(&record.fulltext_html)
        .bind(&record.raw_json)
        .bind(&now)
        .bind(&now)
        .bind(category_update)
        .execute(&self.pool)
        .await?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM documents WHERE source = ? AND provider_id = ?")
                .bind(&record.source)
                .bind(&record.provider_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(SavedDocument { id, merged: false })
    }

    /// Save a highlight, merging duplicate text within the document.
    /// Blank text is ignored. Returns the highlight id.
    pub async fn save_highlight(
        &self,
        document_id: i64,
        record: &HighlightRecord,
    ) -> Result<Option<i64>> {
        if record.text.trim().is_empty() {
            return Ok(None);
        }
        let hash = text_hash16(&record.text);

        sqlx::query(
            r#"
            INSERT INTO highlights (document_id, text, note, text_hash, highlighted_at, provider)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id, text_hash) DO UPDATE SET
                note = COALESCE(excluded.note, note),
                highlighted_at = COALESCE(excluded.highlighted_at, highlighted_at),
                provider = COALESCE(excluded.provider, provider)
            "#,
        )
        .bind(document_id)
        .bind(&record.text)
        .bind(&record.note)
        .bind(&hash)
        .bind(&record.highlighted_at)
        .bind(&record.provider)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar(
            "SELECT id FROM highlights WHERE document_id = ? AND text_hash = ?",
        )
        .bind(document_id)
        .bind(&hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(id))
    }

    /// Record fetched full text. Clears any fetch-failure row for the
    /// document so later jobs see it as resolved.
    pub async fn save_fulltext(&self, document_id: i64, fulltext: &str, source: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE documents SET
                fulltext = ?,
                word_count = COALESCE(word_count, ?),
                fetch_source = ?,
                fetched_at = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(fulltext)
        .bind(fulltext.split_whitespace().count() as i64)
        .bind(source)
        .bind(&now)
        .bind(&now)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM fetch_failures WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a fetch failure, bumping the retry counter on repeats.
    pub async fn save_fetch_failure(
        &self,
        document_id: i64,
        url: &str,
        kind: FetchErrorKind,
        message: Option<&str>,
        http_status: Option<u16>,
        job_id: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO fetch_failures (
                document_id, url, error_kind, error_message, http_status,
                retry_count, last_attempt_at, job_id
            ) VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                url = excluded.url,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                http_status = excluded.http_status,
                retry_count = retry_count + 1,
                last_attempt_at = excluded.last_attempt_at,
                job_id = excluded.job_id
            "#,
        )
        .bind(document_id)
        .bind(url)
        .bind(kind.as_str())
        .bind(message)
        .bind(http_status.map(|s| s as i64))
        .bind(&now)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Clear failures of retriable kinds so their documents are offered to
    /// the next fetch job. Returns the number of cleared rows.
    pub async fn clear_retriable_failures(&self) -> Result<u64> {
        let kinds: Vec<String> = FetchErrorKind::ALL
            .iter()
            .filter(|k| k.retriable())
            .map(|k| k.as_str().to_string())
            .collect();

        let placeholders = vec!["?"; kinds.len()].join(", ");
        let sql = format!(
            "DELETE FROM fetch_failures WHERE error_kind IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql);
        for kind in &kinds {
            query = query.bind(kind);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Documents needing full text, in id order past the cursor. Documents
    /// with a fetch-failure row are excluded until it is cleared.
    pub async fn get_documents_for_fetch(
        &self,
        cursor_doc_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<DocumentForFetch>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.url_original, d.title
            FROM documents d
            WHERE d.fulltext IS NULL
              AND d.id > ?
              AND NOT EXISTS (SELECT 1 FROM fetch_failures f WHERE f.document_id = d.id)
            ORDER BY d.id
            LIMIT ?
            "#,
        )
        .bind(cursor_doc_id.unwrap_or(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| DocumentForFetch {
                id: row.get("id"),
                url: row.get("url_original"),
                title: row
                    .get::<Option<String>, _>("title")
                    .unwrap_or_else(|| "(untitled)".to_string()),
            })
            .collect())
    }

    /// Count of documents a fresh fetch job would visit.
    pub async fn count_documents_for_fetch(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM documents d
            WHERE d.fulltext IS NULL
              AND NOT EXISTS (SELECT 1 FROM fetch_failures f WHERE f.document_id = d.id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Documents that have full text but no chunks yet, in id order past the
    /// cursor.
    pub async fn get_documents_for_chunking(
        &self,
        cursor_doc_id: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT d.* FROM documents d
            WHERE d.fulltext IS NOT NULL
              AND d.id > ?
              AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id)
            ORDER BY d.id
            LIMIT ?
            "#,
        )
        .bind(cursor_doc_id.unwrap_or(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Document::from_row).collect())
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Document::from_row))
    }

    pub async fn get_highlights(&self, document_id: i64) -> Result<Vec<Highlight>> {
        let rows = sqlx::query(
            "SELECT * FROM highlights WHERE document_id = ? ORDER BY highlighted_at, id",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Highlight::from_row).collect())
    }

    pub async fn get_fetch_failure(&self, document_id: i64) -> Result<Option<FetchFailure>> {
        let row = sqlx::query("SELECT * FROM fetch_failures WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(FetchFailure::from_row))
    }

    pub async fn fetch_stats(&self) -> Result<FetchStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let with_url: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE url_original IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let with_fulltext: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE fulltext IS NOT NULL")
                .fetch_one(&self.pool)
                .await?;
        let failed: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM fetch_failures")
            .fetch_one(&self.pool)
            .await?;
        let pending = self.count_documents_for_fetch().await?;
        let without_chunks: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM documents d
            WHERE d.fulltext IS NOT NULL
              AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let mut failures_by_type = HashMap::new();
        let rows = sqlx::query(
            "SELECT error_kind, COUNT(*) AS n FROM fetch_failures GROUP BY error_kind",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            failures_by_type.insert(row.get::<String, _>("error_kind"), row.get::<i64, _>("n"));
        }

        Ok(FetchStats {
            total,
            with_url,
            with_fulltext,
            failed,
            pending,
            without_chunks,
            failures_by_type,
        })
    }

    /// Truncate and repopulate the document FTS index from the documents
    /// table, then optimize it. Returns the number of indexed documents.
    pub async fn rebuild_fts(&self) -> Result<i64> {
        sqlx::query("INSERT INTO documents_fts(documents_fts) VALUES('rebuild')")
            .execute(&self.pool)
            .await?;
        sqlx::query("INSERT INTO documents_fts(documents_fts) VALUES('optimize')")
            .execute(&self.pool)
            .await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    pub async fn count_highlights(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM highlights")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}
