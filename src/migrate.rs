//! Database schema migrations.
//!
//! Creates all entity tables, the FTS5 indexes, and the per-dimension vector
//! tables, and ensures idempotent execution: migrations only add missing
//! tables and columns, never drop. Vector tables are created only when the
//! sqlite-vec extension was loaded at connection open.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

/// Embedding dimensions with a dedicated vector index table.
pub const SUPPORTED_DIMS: [usize; 4] = [768, 1024, 1536, 3072];

/// Name of the vector table for a dimension, if supported.
pub fn vec_table(dims: usize) -> Option<&'static str> {
    match dims {
        768 => Some("chunk_vec_768"),
        1024 => Some("chunk_vec_1024"),
        1536 => Some("chunk_vec_1536"),
        3072 => Some("chunk_vec_3072"),
        _ => None,
    }
}

pub async fn run_migrations(pool: &SqlitePool, vector_enabled: bool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            url_original TEXT,
            url_canonical TEXT,
            title TEXT,
            author TEXT,
            published_at TEXT,
            saved_at TEXT,
            category TEXT NOT NULL DEFAULT 'article',
            word_count INTEGER,
            summary TEXT,
            fulltext TEXT,
            fulltext_html TEXT,
            fetch_source TEXT,
            fetched_at TEXT,
            raw_json TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(source, provider_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS highlights (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            text TEXT NOT NULL,
            note TEXT,
            text_hash TEXT NOT NULL,
            highlighted_at TEXT,
            provider TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(document_id, text_hash),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            chunk_text TEXT NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            token_count INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Exactly one of document_id / chunk_id is set per row. Chunk rows can
    // outlive their chunk (orphans) until the cleanup pass runs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embeddings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER,
            chunk_id INTEGER,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(chunk_id, provider, model),
            UNIQUE(document_id, provider, model)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_failures (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id INTEGER NOT NULL UNIQUE,
            url TEXT NOT NULL,
            error_kind TEXT NOT NULL,
            error_message TEXT,
            http_status INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TEXT NOT NULL DEFAULT (datetime('now')),
            job_id TEXT,
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            reader_cursor TEXT,
            export_cursor TEXT,
            reader_done INTEGER NOT NULL DEFAULT 0,
            export_done INTEGER NOT NULL DEFAULT 0,
            items_imported INTEGER NOT NULL DEFAULT 0,
            items_merged INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            items_total INTEGER,
            started_at TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fetch_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            cursor_doc_id INTEGER,
            items_processed INTEGER NOT NULL DEFAULT 0,
            items_succeeded INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            items_skipped INTEGER NOT NULL DEFAULT 0,
            items_total INTEGER,
            started_at TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embed_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            cursor_chunk_id INTEGER,
            items_processed INTEGER NOT NULL DEFAULT 0,
            items_succeeded INTEGER NOT NULL DEFAULT 0,
            items_failed INTEGER NOT NULL DEFAULT 0,
            items_total INTEGER,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            provider TEXT NOT NULL DEFAULT 'openai',
            model TEXT NOT NULL DEFAULT 'text-embedding-3-small',
            started_at TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_jobs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            phase TEXT NOT NULL DEFAULT 'idle',
            import_job_id TEXT,
            embed_job_id TEXT,
            docs_imported INTEGER NOT NULL DEFAULT 0,
            docs_merged INTEGER NOT NULL DEFAULT 0,
            chunks_created INTEGER NOT NULL DEFAULT 0,
            chunks_embedded INTEGER NOT NULL DEFAULT 0,
            chunks_total INTEGER NOT NULL DEFAULT 0,
            tokens_used INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            last_activity TEXT NOT NULL,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generated_digests (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            date_from TEXT NOT NULL,
            date_to TEXT NOT NULL,
            time_range_days INTEGER NOT NULL,
            strategy TEXT NOT NULL,
            model_id TEXT NOT NULL,
            summary_text TEXT NOT NULL,
            topics_json TEXT NOT NULL,
            highlights_json TEXT,
            docs_analyzed INTEGER NOT NULL DEFAULT 0,
            chunks_analyzed INTEGER NOT NULL DEFAULT 0,
            tokens_input INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS digest_topics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            digest_id INTEGER NOT NULL,
            topic_index INTEGER NOT NULL,
            topic_name TEXT NOT NULL,
            summary TEXT,
            key_points_json TEXT,
            chunk_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (digest_id) REFERENCES generated_digests(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS digest_citations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            digest_id INTEGER NOT NULL,
            topic_index INTEGER NOT NULL,
            chunk_id INTEGER NOT NULL,
            document_id INTEGER NOT NULL,
            excerpt TEXT,
            FOREIGN KEY (digest_id) REFERENCES generated_digests(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS api_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            operation TEXT NOT NULL,
            tokens_input INTEGER NOT NULL DEFAULT 0,
            tokens_output INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            latency_ms INTEGER,
            success INTEGER NOT NULL DEFAULT 1,
            error_message TEXT,
            metadata_json TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS custom_prompts (
            key TEXT PRIMARY KEY,
            template TEXT NOT NULL,
            temperature REAL NOT NULL,
            max_tokens INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Columns added after the initial schema shipped.
    add_column_if_missing(pool, "documents", "fulltext_html", "TEXT").await?;
    add_column_if_missing(pool, "documents", "fetch_source", "TEXT").await?;
    add_column_if_missing(pool, "documents", "fetched_at", "TEXT").await?;
    add_column_if_missing(pool, "documents", "category", "TEXT NOT NULL DEFAULT 'article'").await?;
    add_column_if_missing(pool, "documents", "word_count", "INTEGER").await?;
    add_column_if_missing(pool, "fetch_failures", "job_id", "TEXT").await?;

    // FTS5 virtual tables (not idempotent natively, check first).
    let docs_fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !docs_fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                title, author, fulltext, summary,
                content='documents',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    let chunks_fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !chunks_fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                chunk_text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Per-dimension vector tables, only with the extension loaded.
    if vector_enabled {
        for dims in SUPPORTED_DIMS {
            let table = vec_table(dims).unwrap();
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
            )
            .bind(table)
            .fetch_one(pool)
            .await?;

            if !exists {
                sqlx::query(&format!(
                    "CREATE VIRTUAL TABLE {} USING vec0(embedding float[{}], embedding_id integer)",
                    table, dims
                ))
                .execute(pool)
                .await?;
            }
        }
    }

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_url_canonical ON documents(source, url_canonical)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_saved_at ON documents(saved_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_highlights_document_id ON highlights(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id, provider, model)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_api_usage_created_at ON api_usage(created_at)")
        .execute(pool)
        .await?;

    backfill_from_raw_json(pool).await?;

    Ok(())
}

/// Add a column to a table unless it already exists.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<()> {
    let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
        .fetch_all(pool)
        .await?;

    let present = rows
        .iter()
        .any(|row| row.get::<String, _>("name") == column);

    if !present {
        sqlx::query(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table, column, decl
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Re-derive `category` and `word_count` from the archived upstream payload
/// for rows that predate those columns.
async fn backfill_from_raw_json(pool: &SqlitePool) -> Result<()> {
    let rows = sqlx::query(
        r#"
        SELECT id, url_original, raw_json FROM documents
        WHERE raw_json IS NOT NULL AND (category = '' OR word_count IS NULL)
        "#,
    )
    .fetch_all(pool)
    .await?;

    for row in rows {
        let id: i64 = row.get("id");
        let url: Option<String> = row.get("url_original");
        let raw: String = row.get("raw_json");

        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            continue;
        };

        let category = crate::normalize::normalize_category(
            value.get("category").and_then(|v| v.as_str()),
            url.as_deref(),
        );
        let word_count = value.get("word_count").and_then(|v| v.as_i64());

        sqlx::query(
            "UPDATE documents SET category = ?, word_count = COALESCE(word_count, ?) WHERE id = ?",
        )
        .bind(&category)
        .bind(word_count)
        .bind(id)
        .execute(pool)
        .await?;
    }

    Ok(())
}
