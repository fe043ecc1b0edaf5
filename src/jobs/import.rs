//! Import job: streams the two upstream endpoints into the store.
//!
//! Phase 1 walks the document endpoint; phase 2 walks the export endpoint
//! and merges books into documents already known by canonical URL. Each
//! phase persists its own resume cursor after every page, so a paused or
//! failed job re-enters exactly where it stopped.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::ArticleRecord;
use crate::reader::ReaderClient;
use crate::store::Store;

use super::{EventKind, JobEvent, JobRecord, JobRegistry, JobStatus};

/// Tracks state of a streaming import.
#[derive(Debug, Clone)]
pub struct ImportJob {
    pub id: String,
    pub status: JobStatus,
    pub reader_cursor: Option<String>,
    pub export_cursor: Option<String>,
    pub reader_done: bool,
    pub export_done: bool,
    pub items_imported: i64,
    pub items_merged: i64,
    pub items_failed: i64,
    pub items_total: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error: Option<String>,
}

impl ImportJob {
    pub fn new() -> Self {
        let now = Utc::now();
        ImportJob {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            reader_cursor: None,
            export_cursor: None,
            reader_done: false,
            export_done: false,
            items_imported: 0,
            items_merged: 0,
            items_failed: 0,
            items_total: None,
            started_at: now,
            last_activity: now,
            error: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "status": self.status.as_str(),
            "reader_cursor": self.reader_cursor,
            "export_cursor": self.export_cursor,
            "reader_done": self.reader_done,
            "export_done": self.export_done,
            "items_imported": self.items_imported,
            "items_merged": self.items_merged,
            "items_failed": self.items_failed,
            "items_total": self.items_total,
            "started_at": self.started_at.to_rfc3339(),
            "last_activity": self.last_activity.to_rfc3339(),
            "error": self.error,
        })
    }
}

impl Default for ImportJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobRecord for ImportJob {
    const TABLE: &'static str = "import_jobs";

    fn id(&self) -> &str {
        &self.id
    }
    fn status(&self) -> JobStatus {
        self.status
    }
    fn set_status(&mut self, status: JobStatus) {
        self.status = status;
    }
    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
    fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }
    fn set_error(&mut self, error: Option<String>) {
        self.error = error;
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        Ok(ImportJob {
            id: row.get("id"),
            status: JobStatus::parse(&row.get::<String, _>("status")),
            reader_cursor: row.get("reader_cursor"),
            export_cursor: row.get("export_cursor"),
            reader_done: row.get::<i64, _>("reader_done") != 0,
            export_done: row.get::<i64, _>("export_done") != 0,
            items_imported: row.get("items_imported"),
            items_merged: row.get("items_merged"),
            items_failed: row.get("items_failed"),
            items_total: row.get("items_total"),
            started_at: parse_ts(&row.get::<String, _>("started_at")),
            last_activity: parse_ts(&row.get::<String, _>("last_activity")),
            error: row.get("error"),
        })
    }

    async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO import_jobs (
                id, status, reader_cursor, export_cursor, reader_done, export_done,
                items_imported, items_merged, items_failed, items_total,
                started_at, last_activity, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                reader_cursor = excluded.reader_cursor,
                export_cursor = excluded.export_cursor,
                reader_done = excluded.reader_done,
                export_done = excluded.export_done,
                items_imported = excluded.items_imported,
                items_merged = excluded.items_merged,
                items_failed = excluded.items_failed,
                items_total = excluded.items_total,
                last_activity = excluded.last_activity,
                error = excluded.error
            "#,
        )
        .bind(&self.id)
        .bind(self.status.as_str())
        .bind(&self.reader_cursor)
        .bind(&self.export_cursor)
        .bind(self.reader_done as i64)
        .bind(self.export_done as i64)
        .bind(self.items_imported)
        .bind(self.items_merged)
        .bind(self.items_failed)
        .bind(self.items_total)
        .bind(self.started_at.to_rfc3339())
        .bind(self.last_activity.to_rfc3339())
        .bind(&self.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

enum Control {
    Continue,
    Pause,
    Cancel,
}

async fn check_control(registry: &JobRegistry<ImportJob>, job_id: &str) -> Control {
    match registry.get(job_id).await.map(|j| j.status) {
        Some(JobStatus::Paused) => Control::Pause,
        Some(JobStatus::Cancelled) | None => Control::Cancel,
        _ => Control::Continue,
    }
}

/// Run an import job, emitting events into `tx`. Honors cooperative pause
/// (emits `paused` and returns) and cancel (returns silently) at page and
/// item boundaries.
pub async fn run_import_job(
    store: Store,
    client: ReaderClient,
    registry: Arc<JobRegistry<ImportJob>>,
    job_id: String,
    updated_after: Option<String>,
    tx: mpsc::Sender<JobEvent>,
) {
    let Some(mut job) = registry.get(&job_id).await else {
        return;
    };

    job.status = JobStatus::Running;
    if registry.update(&mut job).await.is_err() {
        return;
    }

    let _ = tx
        .send(JobEvent::job(
            EventKind::Started,
            &job.id,
            json!({"items_total": job.items_total}),
        ))
        .await;

    match run_phases(&store, &client, &registry, &mut job, updated_after, &tx).await {
        Ok(true) => {
            if let Err(e) = store.rebuild_fts().await {
                tracing::warn!(error = %e, "FTS rebuild after import failed");
            }
            job.status = JobStatus::Completed;
            let _ = registry.update(&mut job).await;
            let _ = tx
                .send(JobEvent::job(EventKind::Completed, &job.id, job.to_json()))
                .await;
        }
        Ok(false) => {}
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "import job failed");
            job.status = JobStatus::Failed;
            job.error = Some(e.to_string());
            let _ = registry.update(&mut job).await;
            let _ = tx
                .send(JobEvent::job(
                    EventKind::Failed,
                    &job.id,
                    json!({"error": e.to_string()}),
                ))
                .await;
        }
    }
}

/// Both import phases. Returns `Ok(true)` when the job ran to completion,
/// `Ok(false)` when it stopped for pause/cancel.
async fn run_phases(
    store: &Store,
    client: &ReaderClient,
    registry: &JobRegistry<ImportJob>,
    job: &mut ImportJob,
    updated_after: Option<String>,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<bool> {
    // Phase 1: document endpoint.
    if !job.reader_done {
        let mut first_page = job.reader_cursor.is_none();
        loop {
            match check_control(registry, &job.id).await {
                Control::Pause => {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Paused, &job.id, job.to_json()))
                        .await;
                    return Ok(false);
                }
                Control::Cancel => return Ok(false),
                Control::Continue => {}
            }

            let page = client
                .fetch_document_page(job.reader_cursor.as_deref(), updated_after.as_deref())
                .await?;

            if first_page {
                if let Some(count) = page.count {
                    job.items_total = Some(count);
                }
                first_page = false;
            }

            for record in &page.records {
                match check_control(registry, &job.id).await {
                    Control::Pause => {
                        registry.update(job).await?;
                        let _ = tx
                            .send(JobEvent::job(EventKind::Paused, &job.id, job.to_json()))
                            .await;
                        return Ok(false);
                    }
                    Control::Cancel => return Ok(false),
                    Control::Continue => {}
                }

                match persist_record(store, record).await {
                    Ok(_) => {
                        job.items_imported += 1;
                        let _ = tx
                            .send(JobEvent::job(
                                EventKind::ItemSuccess,
                                &job.id,
                                json!({
                                    "provider_id": record.provider_id,
                                    "title": record.title,
                                    "url": record.url,
                                    "author": record.author,
                                    "published_at": record.published_at,
                                    "saved_at": record.saved_at,
                                    "summary": record.summary,
                                    "word_count": record.word_count,
                                }),
                            ))
                            .await;
                    }
                    Err(e) => {
                        job.items_failed += 1;
                        let _ = tx
                            .send(JobEvent::job(
                                EventKind::ItemError,
                                &job.id,
                                json!({
                                    "provider_id": record.provider_id,
                                    "title": record.title,
                                    "message": e.to_string(),
                                }),
                            ))
                            .await;
                    }
                }

                if (job.items_imported + job.items_merged + job.items_failed) % 10 == 0 {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Progress, &job.id, job.to_json()))
                        .await;
                }
            }

            job.reader_cursor = page.next_cursor.clone();
            if page.next_cursor.is_none() {
                job.reader_done = true;
            }
            registry.update(job).await?;

            if job.reader_done {
                break;
            }
        }
    }

    // Phase 2: export endpoint. Books whose canonical URL already exists
    // merge their highlights into the known document.
    if !job.export_done {
        loop {
            match check_control(registry, &job.id).await {
                Control::Pause => {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Paused, &job.id, job.to_json()))
                        .await;
                    return Ok(false);
                }
                Control::Cancel => return Ok(false),
                Control::Continue => {}
            }

            let page = client
                .fetch_export_page(job.export_cursor.as_deref(), updated_after.as_deref())
                .await?;

            for book in &page.books {
                match persist_record(store, book).await {
                    Ok(merged) => {
                        if merged {
                            job.items_merged += 1;
                        } else {
                            job.items_imported += 1;
                        }
                        let _ = tx
                            .send(JobEvent::job(
                                EventKind::ItemSuccess,
                                &job.id,
                                json!({
                                    "provider_id": book.provider_id,
                                    "title": book.title,
                                    "url": book.url,
                                    "merged": merged,
                                    "highlights": book.highlights.len(),
                                }),
                            ))
                            .await;
                    }
                    Err(e) => {
                        job.items_failed += 1;
                        let _ = tx
                            .send(JobEvent::job(
                                EventKind::ItemError,
                                &job.id,
                                json!({
                                    "provider_id": book.provider_id,
                                    "title": book.title,
                                    "message": e.to_string(),
                                }),
                            ))
                            .await;
                    }
                }

                if (job.items_imported + job.items_merged + job.items_failed) % 10 == 0 {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Progress, &job.id, job.to_json()))
                        .await;
                }
            }

            job.export_cursor = page.next_cursor.clone();
            if page.next_cursor.is_none() {
                job.export_done = true;
            }
            registry.update(job).await?;

            if job.export_done {
                break;
            }
        }
    }

    Ok(true)
}

/// Persist one record and its highlights. Returns whether the document
/// merged into an existing row by canonical URL.
pub async fn persist_record(store: &Store, record: &ArticleRecord) -> Result<bool> {
    let saved = store.save_document(record).await?;
    for highlight in &record.highlights {
        store.save_highlight(saved.id, highlight).await?;
    }
    Ok(saved.merged)
}
