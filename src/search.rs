//! Retrieval: lexical full-text search, chunk-level vector KNN with context
//! windows, and the unified library read path.
//!
//! Semantic results resolve metadata per KNN hit (the vector table cannot
//! join) and over-fetch 2x so category filtering can skip hits without
//! starving the result list. When the KNN path is unavailable the library
//! search falls back to the legacy document-level scan, and failing that to
//! lexical.

use anyhow::Result;
use serde::Serialize;
use sqlx::Row;

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, create_provider, vec_to_blob};
use crate::store::{Store, UsageRecord};

/// Search mode of the unified library endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Lexical,
    Semantic,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "fts" | "lexical" | "keyword" => Some(SearchMode::Lexical),
            "semantic" => Some(SearchMode::Semantic),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    pub fn parse(s: &str) -> SortDir {
        if s.eq_ignore_ascii_case("asc") {
            SortDir::Asc
        } else {
            SortDir::Desc
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        }
    }
}

/// Sort keys of the library endpoint. `saved_at` always means the
/// effective date, so highlight-only documents order chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    SavedAt,
    Title,
    Author,
    WordCount,
    Relevance,
}

impl SortKey {
    pub fn parse(s: &str) -> SortKey {
        match s {
            "title" => SortKey::Title,
            "author" => SortKey::Author,
            "word_count" => SortKey::WordCount,
            "relevance" => SortKey::Relevance,
            _ => SortKey::SavedAt,
        }
    }
}

/// Parameters of the unified library search.
#[derive(Debug, Clone)]
pub struct LibraryParams {
    pub query: String,
    pub mode: SearchMode,
    pub search_fulltext: bool,
    pub highlights_only: bool,
    pub categories: Vec<String>,
    pub sort_by: SortKey,
    pub sort_dir: SortDir,
    pub limit: i64,
}

impl Default for LibraryParams {
    fn default() -> Self {
        LibraryParams {
            query: String::new(),
            mode: SearchMode::Lexical,
            search_fulltext: true,
            highlights_only: false,
            categories: Vec::new(),
            sort_by: SortKey::SavedAt,
            sort_dir: SortDir::Desc,
            limit: 50,
        }
    }
}

/// One library search result. Chunk fields are present only on semantic
/// hits.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryResult {
    pub id: i64,
    pub title: Option<String>,
    pub author: Option<String>,
    pub url: Option<String>,
    pub saved_at: Option<String>,
    pub category: String,
    pub word_count: Option<i64>,
    pub highlight_count: i64,
    pub distance: Option<f64>,
    pub chunk_id: Option<i64>,
    pub chunk_text: Option<String>,
    pub char_start: Option<i64>,
    pub char_end: Option<i64>,
    pub context_before: Option<String>,
    pub context_after: Option<String>,
}

/// The unified library read path: empty queries list recents, lexical runs
/// the FTS match, semantic defers to chunk-level vector search.
pub async fn library_search(
    store: &Store,
    config: &Config,
    params: &LibraryParams,
) -> Result<Vec<LibraryResult>> {
    if params.query.trim().is_empty() {
        return list_recent(store, params).await;
    }

    match params.mode {
        SearchMode::Lexical => lexical_search(store, params).await,
        SearchMode::Semantic => {
            // Highlight-only documents carry no embeddings, so excluding
            // full text leaves nothing to search semantically.
            if !params.search_fulltext {
                return Ok(Vec::new());
            }
            match semantic_search_chunks(
                store,
                config,
                &params.query,
                &params.categories,
                params.limit,
            )
            .await
            {
                Ok(mut results) => {
                    // Distance-ascending is the native order; any other
                    // sort key reorders here.
                    if params.sort_by != SortKey::Relevance {
                        apply_sort(&mut results, params.sort_by, params.sort_dir);
                    }
                    Ok(results)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "vector search failed, falling back to lexical");
                    lexical_search(store, params).await
                }
            }
        }
    }
}

const EFFECTIVE_DATE_SQL: &str = "COALESCE(d.saved_at, (SELECT MIN(h.highlighted_at) FROM highlights h WHERE h.document_id = d.id))";

fn category_filter_sql(categories: &[String]) -> String {
    if categories.is_empty() {
        return String::new();
    }
    let placeholders = vec!["?"; categories.len()].join(", ");
    format!(" AND d.category IN ({})", placeholders)
}

fn sort_sql(sort_by: SortKey, sort_dir: SortDir) -> String {
    let column = match sort_by {
        SortKey::Title => "d.title",
        SortKey::Author => "d.author",
        SortKey::WordCount => "d.word_count",
        SortKey::SavedAt | SortKey::Relevance => "effective_date",
    };
    format!("ORDER BY {} IS NULL, {} {}", column, column, sort_dir.sql())
}

async fn list_recent(store: &Store, params: &LibraryParams) -> Result<Vec<LibraryResult>> {
    let highlights_filter = if params.highlights_only {
        " AND EXISTS (SELECT 1 FROM highlights h WHERE h.document_id = d.id)"
    } else {
        ""
    };

    let sql = format!(
        r#"
        SELECT d.id, d.title, d.author, d.url_original, d.category, d.word_count,
               {} AS effective_date,
               (SELECT COUNT(*) FROM highlights h WHERE h.document_id = d.id) AS highlight_count
        FROM documents d
        WHERE 1=1{}{}
        {}
        LIMIT ?
        "#,
        EFFECTIVE_DATE_SQL,
        highlights_filter,
        category_filter_sql(&params.categories),
        sort_sql(params.sort_by, params.sort_dir),
    );

    let mut query = sqlx::query(&sql);
    for category in &params.categories {
        query = query.bind(category);
    }
    query = query.bind(params.limit);

    let rows = query.fetch_all(store.pool()).await?;
    Ok(rows.iter().map(document_result).collect())
}

async fn lexical_search(store: &Store, params: &LibraryParams) -> Result<Vec<LibraryResult>> {
    // Column-filtered FTS query when full text is excluded from matching.
    let match_expr = if params.search_fulltext {
        params.query.clone()
    } else {
        format!("{{title author summary}} : {}", params.query)
    };

    let highlights_filter = if params.highlights_only {
        " AND EXISTS (SELECT 1 FROM highlights h WHERE h.document_id = d.id)"
    } else {
        ""
    };

    let order = if params.sort_by == SortKey::SavedAt && params.sort_dir == SortDir::Desc {
        // Match rank is the default order for lexical queries.
        "ORDER BY rank".to_string()
    } else {
        sort_sql(params.sort_by, params.sort_dir)
    };

    let sql = format!(
        r#"
        SELECT d.id, d.title, d.author, d.url_original, d.category, d.word_count,
               {} AS effective_date,
               (SELECT COUNT(*) FROM highlights h WHERE h.document_id = d.id) AS highlight_count
        FROM documents_fts
        JOIN documents d ON d.id = documents_fts.rowid
        WHERE documents_fts MATCH ?{}{}
        {}
        LIMIT ?
        "#,
        EFFECTIVE_DATE_SQL,
        highlights_filter,
        category_filter_sql(&params.categories),
        order,
    );

    let mut query = sqlx::query(&sql).bind(&match_expr);
    for category in &params.categories {
        query = query.bind(category);
    }
    query = query.bind(params.limit);

    let rows = query.fetch_all(store.pool()).await?;
    Ok(rows.iter().map(document_result).collect())
}

fn document_result(row: &sqlx::sqlite::SqliteRow) -> LibraryResult {
    LibraryResult {
        id: row.get("id"),
        title: row.get("title"),
        author: row.get("author"),
        url: row.get("url_original"),
        saved_at: row.get("effective_date"),
        category: row.get("category"),
        word_count: row.get("word_count"),
        highlight_count: row.get("highlight_count"),
        distance: None,
        chunk_id: None,
        chunk_text: None,
        char_start: None,
        char_end: None,
        context_before: None,
        context_after: None,
    }
}

/// Chunk-level semantic search with context windows.
///
/// Embeds the query, runs KNN over the matching per-dimension table
/// (over-fetching 2x for filter headroom), resolves each hit's chunk and
/// document, and attaches the neighboring chunk texts. Without the vector
/// extension, falls back to a brute-force scan over document-level
/// embeddings.
pub async fn semantic_search_chunks(
    store: &Store,
    config: &Config,
    query: &str,
    categories: &[String],
    limit: i64,
) -> Result<Vec<LibraryResult>> {
    let provider = create_provider(&config.embedding.provider, Some(&config.embedding.model))
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let started = std::time::Instant::now();
    let query_vec = provider
        .embed_single(query)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let query_tokens = (query.len() / 4) as i64;
    let _ = store
        .record_usage(&UsageRecord {
            provider: provider.name().to_string(),
            model: provider.model_id().to_string(),
            operation: "embed_query".to_string(),
            tokens_input: query_tokens,
            tokens_output: 0,
            cost_usd: provider.estimate_cost(query_tokens.max(0) as u64),
            latency_ms: Some(started.elapsed().as_millis() as i64),
            success: true,
            error_message: None,
            metadata_json: None,
        })
        .await;

    if !store.vector_enabled() {
        return semantic_search_documents(store, &query_vec, provider.name(), provider.model_id(), limit).await;
    }

    let blob = vec_to_blob(&query_vec);
    let hits = store
        .knn_chunks(&blob, provider.dimensions(), limit * 2)
        .await?;

    let mut results = Vec::new();
    for hit in hits {
        if results.len() as i64 >= limit {
            break;
        }

        let row = sqlx::query(&format!(
            r#"
            SELECT c.id AS chunk_id, c.document_id, c.chunk_text, c.char_start, c.char_end,
                   c.chunk_index,
                   d.title, d.author, d.url_original, d.category, d.word_count,
                   {} AS effective_date,
                   (SELECT COUNT(*) FROM highlights h WHERE h.document_id = d.id) AS highlight_count
            FROM embeddings e
            JOIN chunks c ON c.id = e.chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE e.id = ?
            "#,
            EFFECTIVE_DATE_SQL
        ))
        .bind(hit.embedding_id)
        .fetch_optional(store.pool())
        .await?;

        let Some(row) = row else {
            // Orphaned vector row; skipped until cleanup runs.
            continue;
        };

        let category: String = row.get("category");
        if !categories.is_empty() && !categories.contains(&category) {
            continue;
        }

        let document_id: i64 = row.get("document_id");
        let chunk_index: i64 = row.get("chunk_index");
        let (context_before, context_after) =
            store.get_chunk_neighbors(document_id, chunk_index).await?;

        results.push(LibraryResult {
            id: document_id,
            title: row.get("title"),
            author: row.get("author"),
            url: row.get("url_original"),
            saved_at: row.get("effective_date"),
            category,
            word_count: row.get("word_count"),
            highlight_count: row.get("highlight_count"),
            distance: Some(hit.distance),
            chunk_id: Some(row.get("chunk_id")),
            chunk_text: Some(row.get("chunk_text")),
            char_start: Some(row.get("char_start")),
            char_end: Some(row.get("char_end")),
            context_before,
            context_after,
        });
    }

    Ok(results)
}

/// Legacy document-level semantic search: brute-force cosine over stored
/// document embeddings. Returns documents only, no chunk anchors.
pub async fn semantic_search_documents(
    store: &Store,
    query_vec: &[f32],
    provider: &str,
    model: &str,
    limit: i64,
) -> Result<Vec<LibraryResult>> {
    let embeddings = store.get_document_embeddings(provider, model).await?;

    let mut scored: Vec<(i64, f64)> = embeddings
        .iter()
        .map(|(document_id, blob)| {
            let vec = blob_to_vec(blob);
            let similarity = cosine_similarity(query_vec, &vec) as f64;
            (*document_id, 1.0 - similarity)
        })
        .collect();

    scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit as usize);

    let mut results = Vec::new();
    for (document_id, distance) in scored {
        let row = sqlx::query(&format!(
            r#"
            SELECT d.id, d.title, d.author, d.url_original, d.category, d.word_count,
                   {} AS effective_date,
                   (SELECT COUNT(*) FROM highlights h WHERE h.document_id = d.id) AS highlight_count
            FROM documents d WHERE d.id = ?
            "#,
            EFFECTIVE_DATE_SQL
        ))
        .bind(document_id)
        .fetch_optional(store.pool())
        .await?;

        if let Some(row) = row {
            let mut result = document_result(&row);
            result.distance = Some(distance);
            results.push(result);
        }
    }

    Ok(results)
}

/// Reorder vector results by a non-distance sort key, nulls last in either
/// direction.
fn apply_sort(results: &mut [LibraryResult], sort_by: SortKey, sort_dir: SortDir) {
    results.sort_by(|a, b| match sort_by {
        SortKey::Title => cmp_option(&a.title, &b.title, sort_dir),
        SortKey::Author => cmp_option(&a.author, &b.author, sort_dir),
        SortKey::WordCount => cmp_option(&a.word_count, &b.word_count, sort_dir),
        SortKey::SavedAt => cmp_option(&a.saved_at, &b.saved_at, sort_dir),
        SortKey::Relevance => a
            .distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal),
    });
}

/// None sorts after Some regardless of direction.
fn cmp_option<T: Ord>(a: &Option<T>, b: &Option<T>, dir: SortDir) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match dir {
            SortDir::Asc => a.cmp(b),
            SortDir::Desc => b.cmp(a),
        },
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!(SearchMode::parse("fts"), Some(SearchMode::Lexical));
        assert_eq!(SearchMode::parse("lexical"), Some(SearchMode::Lexical));
        assert_eq!(SearchMode::parse("semantic"), Some(SearchMode::Semantic));
        assert_eq!(SearchMode::parse("hybrid"), None);
    }

    #[test]
    fn test_category_filter_sql() {
        assert_eq!(category_filter_sql(&[]), "");
        assert_eq!(
            category_filter_sql(&["article".to_string(), "tweet".to_string()]),
            " AND d.category IN (?, ?)"
        );
    }

    fn result_with(title: Option<&str>, word_count: Option<i64>) -> LibraryResult {
        LibraryResult {
            id: 0,
            title: title.map(String::from),
            author: None,
            url: None,
            saved_at: None,
            category: "article".to_string(),
            word_count,
            highlight_count: 0,
            distance: None,
            chunk_id: None,
            chunk_text: None,
            char_start: None,
            char_end: None,
            context_before: None,
            context_after: None,
        }
    }

    #[test]
    fn test_apply_sort_nulls_last() {
        let mut results = vec![
            result_with(None, None),
            result_with(Some("beta"), None),
            result_with(Some("alpha"), None),
        ];
        apply_sort(&mut results, SortKey::Title, SortDir::Asc);
        assert_eq!(results[0].title.as_deref(), Some("alpha"));
        assert_eq!(results[1].title.as_deref(), Some("beta"));
        assert!(results[2].title.is_none());
    }

    #[test]
    fn test_apply_sort_desc_keeps_nulls_last() {
        let mut results = vec![
            result_with(Some("a"), Some(10)),
            result_with(Some("b"), None),
            result_with(Some("c"), Some(500)),
        ];
        apply_sort(&mut results, SortKey::WordCount, SortDir::Desc);
        assert_eq!(results[0].word_count, Some(500));
        assert_eq!(results[1].word_count, Some(10));
        assert_eq!(results[2].word_count, None);
    }
}
