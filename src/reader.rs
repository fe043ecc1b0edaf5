//! Reading-service client.
//!
//! Streams two overlapping upstream endpoints: the **document endpoint**
//! (per-document metadata, optional embedded HTML, opaque page cursor) and
//! the **export endpoint** (books carrying embedded highlight lists and a
//! sub-source tag). Records are parsed leniently out of `serde_json::Value`
//! and the full upstream payload is preserved in `raw_json` so later
//! migrations can backfill attributes.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::models::{ArticleRecord, HighlightRecord};
use crate::normalize::normalize_category;

/// Source tag for rows originating from the document endpoint.
pub const SOURCE_READER: &str = "reader";

const MAX_RETRIES: u32 = 5;
const INITIAL_DELAY: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("reading service auth failed: {0}")]
    Auth(String),
    #[error("reading service rate limited after {0} attempts")]
    RateLimited(u32),
    #[error("reading service error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected reading service response: {0}")]
    Protocol(String),
}

/// One page from the document endpoint.
#[derive(Debug)]
pub struct DocumentPage {
    pub records: Vec<ArticleRecord>,
    pub next_cursor: Option<String>,
    /// Total count reported by the endpoint, present on the first page.
    pub count: Option<i64>,
}

/// One page from the export endpoint.
#[derive(Debug)]
pub struct ExportPage {
    pub books: Vec<ArticleRecord>,
    pub next_cursor: Option<String>,
    pub count: Option<i64>,
}

/// Client for the reading-service HTTP API.
pub struct ReaderClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ReaderClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ReaderError> {
        if token.is_empty() {
            return Err(ReaderError::Auth("API token is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(ReaderClient {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Probe the token. `Ok(true)` on a valid token, `Auth` error otherwise.
    pub async fn validate_token(&self) -> Result<bool, ReaderError> {
        let response = self
            .http
            .get(format!("{}/v2/auth/", self.base_url))
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;

        match response.status().as_u16() {
            204 => Ok(true),
            401 => Err(ReaderError::Auth("invalid API token".to_string())),
            status => Err(ReaderError::Protocol(format!(
                "unexpected status {} from auth endpoint",
                status
            ))),
        }
    }

    /// GET with the shared retry wrapper: 401 is terminal, 429 sleeps out
    /// `Retry-After` (or exponential backoff) and retries, other failures
    /// propagate.
    async fn get_with_retry(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<Value, ReaderError> {
        let mut delay = INITIAL_DELAY;

        for _attempt in 0..MAX_RETRIES {
            let response = self
                .http
                .get(format!("{}{}", self.base_url, path))
                .header("Authorization", format!("Token {}", self.token))
                .query(params)
                .send()
                .await?;

            let status = response.status();

            if status.as_u16() == 401 {
                return Err(ReaderError::Auth("invalid API token".to_string()));
            }

            if status.as_u16() == 429 {
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);

                let wait = retry_after.unwrap_or(delay);
                tracing::warn!(wait_s = wait.as_secs(), "reading service rate limit");
                tokio::time::sleep(wait).await;
                delay = (delay * 2).min(MAX_BACKOFF);
                continue;
            }

            if !status.is_success() {
                return Err(ReaderError::Protocol(format!(
                    "status {} from {}",
                    status, path
                )));
            }

            return Ok(response.json::<Value>().await?);
        }

        Err(ReaderError::RateLimited(MAX_RETRIES))
    }

    /// Fetch one page of the document endpoint. Records with a `parent_id`
    /// are highlights of other documents and are skipped here.
    pub async fn fetch_document_page(
        &self,
        cursor: Option<&str>,
        updated_after: Option<&str>,
    ) -> Result<DocumentPage, ReaderError> {
        let mut params: Vec<(&str, String)> = vec![("withHtmlContent", "true".to_string())];
        if let Some(cursor) = cursor {
            params.push(("pageCursor", cursor.to_string()));
        }
        if let Some(updated_after) = updated_after {
            params.push(("updatedAfter", updated_after.to_string()));
        }

        let data = self.get_with_retry("/v3/list/", &params).await?;
        let results = data
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ReaderError::Protocol("missing results array".to_string()))?;

        let records = results
            .iter()
            .filter(|doc| str_field(doc, "parent_id").is_none())
            .map(parse_document_record)
            .collect();

        Ok(DocumentPage {
            records,
            next_cursor: str_field(&data, "nextPageCursor"),
            count: data.get("count").and_then(|v| v.as_i64()),
        })
    }

    /// Fetch one page of the export endpoint: books with embedded
    /// highlights.
    pub async fn fetch_export_page(
        &self,
        cursor: Option<&str>,
        updated_after: Option<&str>,
    ) -> Result<ExportPage, ReaderError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(cursor) = cursor {
            params.push(("pageCursor", cursor.to_string()));
        }
        if let Some(updated_after) = updated_after {
            params.push(("updatedAfter", updated_after.to_string()));
        }

        let data = self.get_with_retry("/v2/export/", &params).await?;
        let results = data
            .get("results")
            .and_then(|r| r.as_array())
            .ok_or_else(|| ReaderError::Protocol("missing results array".to_string()))?;

        let books = results.iter().map(parse_export_book).collect();

        Ok(ExportPage {
            books,
            next_cursor: str_field(&data, "nextPageCursor"),
            count: data.get("count").and_then(|v| v.as_i64()),
        })
    }
}

// ============ Lenient payload parsing ============

fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn i64_field(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(|v| v.as_i64())
}

/// Parse a document-endpoint record into an [`ArticleRecord`].
pub fn parse_document_record(doc: &Value) -> ArticleRecord {
    let url = str_field(doc, "source_url").or_else(|| str_field(doc, "url"));
    let category = normalize_category(str_field(doc, "category").as_deref(), url.as_deref());

    ArticleRecord {
        source: SOURCE_READER.to_string(),
        provider_id: str_field(doc, "id").unwrap_or_default(),
        title: str_field(doc, "title"),
        author: str_field(doc, "author"),
        published_at: str_field(doc, "published_date"),
        saved_at: str_field(doc, "saved_at").or_else(|| str_field(doc, "created_at")),
        category,
        word_count: i64_field(doc, "word_count"),
        summary: str_field(doc, "summary"),
        fulltext: None,
        fulltext_html: str_field(doc, "html_content"),
        raw_json: Some(doc.to_string()),
        highlights: Vec::new(),
        url,
    }
}

/// Parse an export-endpoint book, including its embedded highlights. The
/// book's secondary `source` tag (the sub-service it was collected from) is
/// carried on each highlight.
pub fn parse_export_book(book: &Value) -> ArticleRecord {
    let url = str_field(book, "source_url").or_else(|| str_field(book, "unique_url"));
    let category = normalize_category(str_field(book, "category").as_deref(), url.as_deref());
    let sub_source = str_field(book, "source");

    let highlights = book
        .get("highlights")
        .and_then(|h| h.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|h| {
                    let text = str_field(h, "text")?;
                    Some(HighlightRecord {
                        text,
                        note: str_field(h, "note"),
                        highlighted_at: str_field(h, "highlighted_at"),
                        provider: sub_source.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ArticleRecord {
        source: SOURCE_READER.to_string(),
        provider_id: str_field(book, "user_book_id").unwrap_or_default(),
        title: str_field(book, "title"),
        author: str_field(book, "author"),
        published_at: None,
        saved_at: str_field(book, "last_highlight_at"),
        category,
        word_count: None,
        summary: str_field(book, "book_tags_summary").or_else(|| str_field(book, "summary")),
        fulltext: None,
        fulltext_html: None,
        raw_json: Some(book.to_string()),
        highlights,
        url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_document_record() {
        let doc = json!({
            "id": "r1",
            "url": "https://Example.com/a/?utm=1",
            "title": "A",
            "author": "Someone",
            "category": "article",
            "word_count": 42,
            "html_content": "<p>Hello.</p>",
            "published_date": "2025-06-01T00:00:00Z",
            "saved_at": "2025-06-02T00:00:00Z"
        });
        let record = parse_document_record(&doc);
        assert_eq!(record.source, SOURCE_READER);
        assert_eq!(record.provider_id, "r1");
        assert_eq!(record.url.as_deref(), Some("https://Example.com/a/?utm=1"));
        assert_eq!(record.word_count, Some(42));
        assert_eq!(record.fulltext_html.as_deref(), Some("<p>Hello.</p>"));
        assert!(record.raw_json.is_some());
        assert!(record.highlights.is_empty());
    }

    #[test]
    fn test_parse_document_record_numeric_id() {
        let doc = json!({"id": 12345, "title": "Numeric"});
        let record = parse_document_record(&doc);
        assert_eq!(record.provider_id, "12345");
    }

    #[test]
    fn test_parse_export_book_with_highlights() {
        let book = json!({
            "user_book_id": "e9",
            "source_url": "http://www.example.com/a",
            "title": "A",
            "category": "articles",
            "source": "snipd",
            "highlights": [
                {"id": "h1", "text": "Hello.", "note": "nice"},
                {"id": "h2", "text": ""}
            ]
        });
        let record = parse_export_book(&book);
        assert_eq!(record.provider_id, "e9");
        assert_eq!(record.category, "article");
        assert_eq!(record.highlights.len(), 1);
        assert_eq!(record.highlights[0].text, "Hello.");
        assert_eq!(record.highlights[0].provider.as_deref(), Some("snipd"));
    }

    #[test]
    fn test_export_book_linkedin_category() {
        let book = json!({
            "user_book_id": "b1",
            "source_url": "https://linkedin.com/posts/abc",
            "category": "articles"
        });
        let record = parse_export_book(&book);
        assert_eq!(record.category, "linkedin");
    }
}
