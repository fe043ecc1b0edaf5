//! Core data models used throughout Clippings.
//!
//! These types represent the documents, highlights, chunks, and fetch
//! failures that flow through the ingestion and retrieval pipeline.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Normalized record produced by the reading-service client before
/// persistence. Phase 1 (document endpoint) records carry no highlights;
/// phase 2 (export endpoint) books usually do.
#[derive(Debug, Clone, Default)]
pub struct ArticleRecord {
    pub source: String,
    pub provider_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub saved_at: Option<String>,
    pub category: String,
    pub word_count: Option<i64>,
    pub summary: Option<String>,
    pub fulltext: Option<String>,
    pub fulltext_html: Option<String>,
    pub raw_json: Option<String>,
    pub highlights: Vec<HighlightRecord>,
}

/// A highlight attached to an incoming article record.
#[derive(Debug, Clone, Default)]
pub struct HighlightRecord {
    pub text: String,
    pub note: Option<String>,
    pub highlighted_at: Option<String>,
    pub provider: Option<String>,
}

/// A document row as stored.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub source: String,
    pub provider_id: String,
    pub url_original: Option<String>,
    pub url_canonical: Option<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub saved_at: Option<String>,
    pub category: String,
    pub word_count: Option<i64>,
    pub summary: Option<String>,
    pub fulltext: Option<String>,
    pub fulltext_html: Option<String>,
    pub fetch_source: Option<String>,
    pub fetched_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Document {
    pub fn from_row(row: &SqliteRow) -> Self {
        Document {
            id: row.get("id"),
            source: row.get("source"),
            provider_id: row.get("provider_id"),
            url_original: row.get("url_original"),
            url_canonical: row.get("url_canonical"),
            title: row.get("title"),
            author: row.get("author"),
            published_at: row.get("published_at"),
            saved_at: row.get("saved_at"),
            category: row.get("category"),
            word_count: row.get("word_count"),
            summary: row.get("summary"),
            fulltext: row.get("fulltext"),
            fulltext_html: row.get("fulltext_html"),
            fetch_source: row.get("fetch_source"),
            fetched_at: row.get("fetched_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

/// A highlight row as stored. Duplicate text within one document merges into
/// a single row via `text_hash`.
#[derive(Debug, Clone, Serialize)]
pub struct Highlight {
    pub id: i64,
    pub document_id: i64,
    pub text: String,
    pub note: Option<String>,
    pub text_hash: String,
    pub highlighted_at: Option<String>,
    pub provider: Option<String>,
    pub created_at: String,
}

impl Highlight {
    pub fn from_row(row: &SqliteRow) -> Self {
        Highlight {
            id: row.get("id"),
            document_id: row.get("document_id"),
            text: row.get("text"),
            note: row.get("note"),
            text_hash: row.get("text_hash"),
            highlighted_at: row.get("highlighted_at"),
            provider: row.get("provider"),
            created_at: row.get("created_at"),
        }
    }
}

/// A chunk row as stored, position-anchored into its document's full text.
#[derive(Debug, Clone, Serialize)]
pub struct StoredChunk {
    pub id: i64,
    pub document_id: i64,
    pub chunk_index: i64,
    pub chunk_text: String,
    pub char_start: i64,
    pub char_end: i64,
    pub token_count: Option<i64>,
}

impl StoredChunk {
    pub fn from_row(row: &SqliteRow) -> Self {
        StoredChunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            chunk_text: row.get("chunk_text"),
            char_start: row.get("char_start"),
            char_end: row.get("char_end"),
            token_count: row.get("token_count"),
        }
    }
}

/// A fetch failure row. At most one per document; a document with a failure
/// row is not offered to new fetch jobs until the row is cleared.
#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub document_id: i64,
    pub url: String,
    pub error_kind: String,
    pub error_message: Option<String>,
    pub http_status: Option<i64>,
    pub retry_count: i64,
    pub last_attempt_at: String,
    pub job_id: Option<String>,
}

impl FetchFailure {
    pub fn from_row(row: &SqliteRow) -> Self {
        FetchFailure {
            document_id: row.get("document_id"),
            url: row.get("url"),
            error_kind: row.get("error_kind"),
            error_message: row.get("error_message"),
            http_status: row.get("http_status"),
            retry_count: row.get("retry_count"),
            last_attempt_at: row.get("last_attempt_at"),
            job_id: row.get("job_id"),
        }
    }
}
