//! End-to-end tests over a temporary database.
//!
//! These drive the library directly: import dedup and merge, chunk
//! replace-all semantics, embedding bookkeeping with orphans, fetch-failure
//! gating, lexical search, the usage ledger, prompt overrides, and the job
//! registry lifecycle. The sqlite-vec extension is not loaded here, so the
//! store runs in lexical-only mode and vector mirrors are skipped.

use tempfile::TempDir;

use clippings::chunker::chunk_document;
use clippings::config::Config;
use clippings::fetcher::FetchErrorKind;
use clippings::jobs::import::{persist_record, ImportJob};
use clippings::jobs::{JobRecord, JobRegistry, JobStatus};
use clippings::models::{ArticleRecord, HighlightRecord};
use clippings::normalize::text_hash16;
use clippings::prompts;
use clippings::search::{library_search, LibraryParams, SearchMode, SortDir, SortKey};
use clippings::store::{Store, UsagePeriod, UsageRecord};

async fn open_store() -> (TempDir, Store, Config) {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.db.path = tmp.path().join("clippings.sqlite");
    config.db.vector_extension = None;
    let store = Store::open(&config).await.unwrap();
    (tmp, store, config)
}

fn reader_record(provider_id: &str, url: &str, title: &str) -> ArticleRecord {
    ArticleRecord {
        source: "reader".to_string(),
        provider_id: provider_id.to_string(),
        url: Some(url.to_string()),
        title: Some(title.to_string()),
        category: "article".to_string(),
        raw_json: Some("{}".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_import_dedup_and_merge() {
    let (_tmp, store, _config) = open_store().await;

    // Scenario: the document endpoint yields one record.
    let record = reader_record("r1", "https://Example.com/a/?utm=1", "A");
    let merged = persist_record(&store, &record).await.unwrap();
    assert!(!merged);

    let doc = store.get_document(1).await.unwrap().unwrap();
    assert_eq!(doc.source, "reader");
    assert_eq!(doc.provider_id, "r1");
    assert_eq!(doc.url_canonical.as_deref(), Some("https://example.com/a"));

    // Later the export endpoint yields a book for the same URL with one
    // highlight: no new document row, one merged highlight.
    let book = ArticleRecord {
        provider_id: "e9".to_string(),
        url: Some("http://www.example.com/a".to_string()),
        highlights: vec![HighlightRecord {
            text: "Hello.".to_string(),
            note: None,
            highlighted_at: Some("2025-06-01T10:00:00Z".to_string()),
            provider: Some("snipd".to_string()),
        }],
        ..reader_record("e9", "http://www.example.com/a", "A")
    };
    let merged = persist_record(&store, &book).await.unwrap();
    assert!(merged);

    assert_eq!(store.count_documents().await.unwrap(), 1);

    let highlights = store.get_highlights(doc.id).await.unwrap();
    assert_eq!(highlights.len(), 1);
    assert_eq!(highlights[0].text_hash, text_hash16("Hello."));
    assert_eq!(highlights[0].provider.as_deref(), Some("snipd"));
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let (_tmp, store, _config) = open_store().await;

    let record = ArticleRecord {
        highlights: vec![HighlightRecord {
            text: "  Same   highlight.  ".to_string(),
            ..Default::default()
        }],
        ..reader_record("r2", "https://example.com/b", "B")
    };

    persist_record(&store, &record).await.unwrap();
    persist_record(&store, &record).await.unwrap();

    assert_eq!(store.count_documents().await.unwrap(), 1);
    assert_eq!(store.count_highlights().await.unwrap(), 1);

    // Whitespace variants of the same text merge into the existing row.
    let variant = HighlightRecord {
        text: "Same highlight.".to_string(),
        ..Default::default()
    };
    store.save_highlight(1, &variant).await.unwrap();
    assert_eq!(store.count_highlights().await.unwrap(), 1);
}

#[tokio::test]
async fn test_coalesce_keeps_existing_values() {
    let (_tmp, store, _config) = open_store().await;

    let mut record = reader_record("r3", "https://example.com/c", "Original title");
    record.author = Some("An Author".to_string());
    persist_record(&store, &record).await.unwrap();

    // A later record with null author must not erase the stored one.
    let update = ArticleRecord {
        author: None,
        summary: Some("now with a summary".to_string()),
        ..reader_record("r3", "https://example.com/c", "Original title")
    };
    persist_record(&store, &update).await.unwrap();

    let doc = store.get_document(1).await.unwrap().unwrap();
    assert_eq!(doc.author.as_deref(), Some("An Author"));
    assert_eq!(doc.summary.as_deref(), Some("now with a summary"));
}

#[tokio::test]
async fn test_chunks_replace_all_and_position_invariants() {
    let (_tmp, store, _config) = open_store().await;

    let record = reader_record("r4", "https://example.com/d", "Chunky");
    persist_record(&store, &record).await.unwrap();

    let fulltext = "A sentence that carries some weight in this paragraph. "
        .repeat(40)
        .trim()
        .to_string();
    store
        .save_fulltext(1, &fulltext, "readability")
        .await
        .unwrap();

    let chunks = chunk_document(&fulltext, "Chunky");
    assert!(chunks.len() >= 2);
    store.save_chunks(1, &chunks).await.unwrap();

    let stored = store.get_chunks(1).await.unwrap();
    assert_eq!(stored.len(), chunks.len());

    let combined_len = ("Chunky".len() + 2 + fulltext.len()) as i64;
    assert_eq!(stored[0].char_start, 0);
    for (i, chunk) in stored.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert!(chunk.char_start < chunk.char_end);
        assert!(chunk.char_end <= combined_len);
        if i > 0 {
            // Overlap: each chunk starts before its predecessor ends.
            assert!(chunk.char_start <= stored[i - 1].char_end);
        }
    }

    // Saving again replaces the whole set, never appends.
    store.save_chunks(1, &chunks).await.unwrap();
    assert_eq!(store.count_chunks().await.unwrap(), chunks.len() as i64);
}

#[tokio::test]
async fn test_embedding_counts_orphans_and_cleanup() {
    let (_tmp, store, _config) = open_store().await;

    let record = reader_record("r5", "https://example.com/e", "Embed");
    persist_record(&store, &record).await.unwrap();

    let fulltext = "Plenty of words fill this paragraph with usable content here. "
        .repeat(30)
        .trim()
        .to_string();
    store
        .save_fulltext(1, &fulltext, "readability")
        .await
        .unwrap();
    let chunks = chunk_document(&fulltext, "Embed");
    store.save_chunks(1, &chunks).await.unwrap();

    let counts = store
        .count_chunks_for_embedding("openai", "text-embedding-3-small")
        .await
        .unwrap();
    assert_eq!(counts.total, chunks.len() as i64);
    assert_eq!(counts.embedded, 0);
    assert_eq!(counts.pending, counts.total);
    assert_eq!(counts.orphaned, 0);

    // Embed everything.
    let pending = store
        .get_chunks_for_embedding(None, "openai", "text-embedding-3-small", 1000)
        .await
        .unwrap();
    assert_eq!(pending.len(), chunks.len());

    let rows: Vec<(i64, Vec<u8>)> = pending
        .iter()
        .map(|c| (c.id, vec![0u8; 1536 * 4]))
        .collect();
    let written = store
        .save_embeddings_batch(&rows, 1536, "openai", "text-embedding-3-small")
        .await
        .unwrap();
    assert_eq!(written, chunks.len() as u64);

    let counts = store
        .count_chunks_for_embedding("openai", "text-embedding-3-small")
        .await
        .unwrap();
    assert_eq!(counts.embedded, counts.total);
    assert_eq!(counts.pending, 0);

    // Re-running the embed selection is a no-op.
    let pending = store
        .get_chunks_for_embedding(None, "openai", "text-embedding-3-small", 1000)
        .await
        .unwrap();
    assert!(pending.is_empty());

    // Re-chunking replaces chunk rows; the old embeddings become orphans and
    // pending never goes negative.
    store.save_chunks(1, &chunks).await.unwrap();
    let counts = store
        .count_chunks_for_embedding("openai", "text-embedding-3-small")
        .await
        .unwrap();
    assert_eq!(counts.orphaned, chunks.len() as i64);
    assert_eq!(counts.embedded, 0);
    assert_eq!(counts.pending, counts.total);
    assert!(counts.pending >= 0);

    let removed = store.cleanup_orphan_embeddings().await.unwrap();
    assert_eq!(removed, chunks.len() as u64);
    let counts = store
        .count_chunks_for_embedding("openai", "text-embedding-3-small")
        .await
        .unwrap();
    assert_eq!(counts.orphaned, 0);
}

#[tokio::test]
async fn test_fetch_failure_gates_documents() {
    let (_tmp, store, _config) = open_store().await;

    persist_record(&store, &reader_record("r6", "https://example.com/f", "F"))
        .await
        .unwrap();
    persist_record(&store, &reader_record("r7", "https://example.com/g", "G"))
        .await
        .unwrap();

    let docs = store.get_documents_for_fetch(None, 10).await.unwrap();
    assert_eq!(docs.len(), 2);

    // Paywall is not retriable; timeout is.
    store
        .save_fetch_failure(
            1,
            "https://example.com/f",
            FetchErrorKind::Paywall,
            Some("subscription"),
            None,
            None,
        )
        .await
        .unwrap();
    store
        .save_fetch_failure(
            2,
            "https://example.com/g",
            FetchErrorKind::Timeout,
            Some("timed out"),
            None,
            None,
        )
        .await
        .unwrap();

    let docs = store.get_documents_for_fetch(None, 10).await.unwrap();
    assert!(docs.is_empty());

    let stats = store.fetch_stats().await.unwrap();
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.failures_by_type["paywall"], 1);
    assert_eq!(stats.failures_by_type["timeout"], 1);

    let cleared = store.clear_retriable_failures().await.unwrap();
    assert_eq!(cleared, 1);

    let docs = store.get_documents_for_fetch(None, 10).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, 2);

    // A repeated failure bumps the retry counter.
    store
        .save_fetch_failure(
            2,
            "https://example.com/g",
            FetchErrorKind::Timeout,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    store
        .save_fetch_failure(
            2,
            "https://example.com/g",
            FetchErrorKind::Timeout,
            None,
            None,
            None,
        )
        .await
        .unwrap();
    let failure = store.get_fetch_failure(2).await.unwrap().unwrap();
    assert_eq!(failure.retry_count, 1);
}

#[tokio::test]
async fn test_save_fulltext_clears_failure() {
    let (_tmp, store, _config) = open_store().await;

    persist_record(&store, &reader_record("r8", "https://example.com/h", "H"))
        .await
        .unwrap();
    store
        .save_fetch_failure(
            1,
            "https://example.com/h",
            FetchErrorKind::Http5xx,
            None,
            Some(503),
            None,
        )
        .await
        .unwrap();

    store
        .save_fulltext(1, "Recovered text body that is long enough.", "readability")
        .await
        .unwrap();

    assert!(store.get_fetch_failure(1).await.unwrap().is_none());
    let doc = store.get_document(1).await.unwrap().unwrap();
    assert_eq!(doc.fetch_source.as_deref(), Some("readability"));
    assert!(doc.fetched_at.is_some());
    assert!(doc.word_count.unwrap() > 0);
}

#[tokio::test]
async fn test_library_lexical_and_recents() {
    let (_tmp, store, config) = open_store().await;

    let mut rust_doc = reader_record("r9", "https://example.com/rust", "Rust ownership deep dive");
    rust_doc.saved_at = Some("2025-07-01T08:00:00Z".to_string());
    persist_record(&store, &rust_doc).await.unwrap();

    // Highlight-only document: no saved_at, position comes from the
    // earliest highlight.
    let highlight_doc = ArticleRecord {
        saved_at: None,
        highlights: vec![HighlightRecord {
            text: "Memory safety matters.".to_string(),
            highlighted_at: Some("2025-07-10T09:00:00Z".to_string()),
            ..Default::default()
        }],
        ..reader_record("r10", "https://example.com/notes", "Notebook")
    };
    persist_record(&store, &highlight_doc).await.unwrap();

    store.rebuild_fts().await.unwrap();

    let results = library_search(
        &store,
        &config,
        &LibraryParams {
            query: "ownership".to_string(),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].title.as_deref(), Some("Rust ownership deep dive"));

    // Empty query lists recents; the highlight-only document sorts by its
    // highlight date, which is newer.
    let recents = library_search(&store, &config, &LibraryParams::default())
        .await
        .unwrap();
    assert_eq!(recents.len(), 2);
    assert_eq!(recents[0].title.as_deref(), Some("Notebook"));
    assert_eq!(recents[0].saved_at.as_deref(), Some("2025-07-10T09:00:00Z"));
    assert_eq!(recents[0].highlight_count, 1);

    // Highlights-only filter drops the document without highlights.
    let filtered = library_search(
        &store,
        &config,
        &LibraryParams {
            highlights_only: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].title.as_deref(), Some("Notebook"));

    // Semantic search over a lexical-only store must not error out of the
    // unified path; it falls back and returns lexical hits.
    let semantic = library_search(
        &store,
        &config,
        &LibraryParams {
            query: "ownership".to_string(),
            mode: SearchMode::Semantic,
            sort_by: SortKey::Relevance,
            sort_dir: SortDir::Desc,
            ..Default::default()
        },
    )
    .await;
    assert!(semantic.is_ok());
}

#[tokio::test]
async fn test_usage_ledger_aggregation() {
    let (_tmp, store, _config) = open_store().await;

    store
        .record_usage(&UsageRecord {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            operation: "embed_batch".to_string(),
            tokens_input: 1000,
            cost_usd: 0.00002,
            latency_ms: Some(120),
            success: true,
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .record_usage(&UsageRecord {
            provider: "openai".to_string(),
            model: "gpt-4.1-mini".to_string(),
            operation: "chat".to_string(),
            tokens_input: 500,
            tokens_output: 200,
            cost_usd: 0.00052,
            latency_ms: Some(800),
            success: true,
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .record_usage(&UsageRecord {
            provider: "ollama".to_string(),
            model: "nomic-embed-text".to_string(),
            operation: "embed_batch".to_string(),
            success: false,
            error_message: Some("unreachable".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let stats = store.usage_stats(UsagePeriod::All).await.unwrap();
    assert_eq!(stats.requests, 3);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.tokens_in, 1500);
    assert_eq!(stats.tokens_out, 200);
    assert!((stats.total_cost - 0.00054).abs() < 1e-9);
    assert_eq!(stats.by_provider["openai"].requests, 2);
    assert_eq!(stats.by_operation["embed_batch"].requests, 2);
    assert_eq!(stats.by_operation["chat"].tokens_out, 200);

    // Rows written just now land inside the daily window too.
    let today = store.usage_stats(UsagePeriod::Today).await.unwrap();
    assert_eq!(today.requests, 3);
    assert_eq!(store.count_calls_today("embed_batch").await.unwrap(), 2);
}

#[tokio::test]
async fn test_prompt_override_merge_and_reset() {
    let (_tmp, store, _config) = open_store().await;

    let default = prompts::get_prompt(&store, "digest_summary")
        .await
        .unwrap()
        .unwrap();
    assert!(!default.is_custom);

    let saved = prompts::save_prompt(&store, "digest_summary", "Custom {topics_joined}", 0.9, 400)
        .await
        .unwrap();
    assert!(saved);

    let custom = prompts::get_prompt(&store, "digest_summary")
        .await
        .unwrap()
        .unwrap();
    assert!(custom.is_custom);
    assert_eq!(custom.template, "Custom {topics_joined}");
    assert_eq!(custom.temperature, 0.9);
    assert_eq!(custom.max_tokens, 400);
    // The variable list stays the default even for custom bodies.
    assert_eq!(custom.variables, default.variables);

    assert!(prompts::reset_prompt(&store, "digest_summary")
        .await
        .unwrap());
    let back = prompts::get_prompt(&store, "digest_summary")
        .await
        .unwrap()
        .unwrap();
    assert!(!back.is_custom);
    assert_eq!(back.template, default.template);

    assert!(!prompts::save_prompt(&store, "bogus", "x", 0.1, 10)
        .await
        .unwrap());

    let all = prompts::list_prompts(&store).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_job_registry_lifecycle_and_rehydration() {
    let (_tmp, store, _config) = open_store().await;
    let registry: JobRegistry<ImportJob> = JobRegistry::open(store.pool().clone()).await.unwrap();

    let job = ImportJob::new();
    let job_id = job.id.clone();
    registry.insert(job).await.unwrap();

    // Pause only applies to running jobs.
    assert!(registry.pause(&job_id).await.unwrap().is_none());

    let mut job = registry.get(&job_id).await.unwrap();
    job.set_status(JobStatus::Running);
    job.reader_cursor = Some("cursor-42".to_string());
    registry.update(&mut job).await.unwrap();

    assert_eq!(registry.get_running().await.unwrap().id, job_id);

    let paused = registry.pause(&job_id).await.unwrap().unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(registry.get_resumable().await.unwrap().id, job_id);

    // Resume puts the job back to pending with the cursor intact.
    let resumed = registry.resume(&job_id).await.unwrap().unwrap();
    assert_eq!(resumed.status, JobStatus::Pending);
    assert_eq!(resumed.reader_cursor.as_deref(), Some("cursor-42"));

    // A fresh registry over the same pool rehydrates non-completed jobs.
    let reloaded: JobRegistry<ImportJob> = JobRegistry::open(store.pool().clone()).await.unwrap();
    let job = reloaded.get(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.reader_cursor.as_deref(), Some("cursor-42"));

    // Cancel is allowed from any non-terminal state and is terminal.
    let cancelled = reloaded.cancel(&job_id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(reloaded.cancel(&job_id).await.unwrap().is_none());

    assert!(reloaded.delete(&job_id).await.unwrap());
    assert!(reloaded.get(&job_id).await.is_none());
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let (_tmp, store, _config) = open_store().await;

    assert!(store.get_setting("last_sync_at").await.unwrap().is_none());
    store
        .set_setting("last_sync_at", "2025-07-01T00:00:00Z")
        .await
        .unwrap();
    store
        .set_setting("last_sync_at", "2025-08-01T00:00:00Z")
        .await
        .unwrap();
    assert_eq!(
        store.get_setting("last_sync_at").await.unwrap().as_deref(),
        Some("2025-08-01T00:00:00Z")
    );
}
