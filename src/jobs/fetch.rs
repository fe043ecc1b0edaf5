//! Fetch job: fills in missing full text, one document at a time, under the
//! per-domain rate limiter.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fetcher::ContentFetcher;
use crate::rate_limit::DomainRateLimiter;
use crate::store::Store;

use super::import::parse_ts;
use super::{EventKind, JobEvent, JobRecord, JobRegistry, JobStatus};

const BATCH_SIZE: i64 = 10;

/// Tracks state of a fulltext fetch job.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub id: String,
    pub status: JobStatus,
    pub cursor_doc_id: Option<i64>,
    pub items_processed: i64,
    pub items_succeeded: i64,
    pub items_failed: i64,
    pub items_skipped: i64,
    pub items_total: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error: Option<String>,
}

impl FetchJob {
    pub fn new(items_total: Option<i64>) -> Self {
        let now = Utc::now();
        FetchJob {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            cursor_doc_id: None,
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
            items_skipped: 0,
            items_total,
            started_at: now,
            last_activity: now,
            error: None,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        match self.items_total {
            Some(total) if total > 0 => self.items_processed as f64 / total as f64 * 100.0,
            _ => 0.0,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "status": self.status.as_str(),
            "cursor_doc_id": self.cursor_doc_id,
            "items_processed": self.items_processed,
            "items_succeeded": self.items_succeeded,
            "items_failed": self.items_failed,
            "items_skipped": self.items_skipped,
            "items_total": self.items_total,
            "progress_percent": (self.progress_percent() * 10.0).round() / 10.0,
            "started_at": self.started_at.to_rfc3339(),
            "last_activity": self.last_activity.to_rfc3339(),
            "error": self.error,
        })
    }
}

#[async_trait::async_trait]
impl JobRecord for FetchJob {
    const TABLE: &'static str = "fetch_jobs";

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
        Ok(FetchJob {
            id: row.get("id"),
            status: JobStatus::parse(&row.get::<String, _>("status")),
            cursor_doc_id: row.get("cursor_doc_id"),
            items_processed: row.get("items_processed"),
            items_succeeded: row.get("items_succeeded"),
            items_failed: row.get("items_failed"),
            items_skipped: row.get("items_skipped"),
            items_total: row.get("items_total"),
            started_at: parse_ts(&row.get::<String, _>("started_at")),
            last_activity: parse_ts(&row.get::<String, _>("last_activity")),
            error: row.get("error"),
        })
    }

    async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_jobs (
                id, status, cursor_doc_id, items_processed, items_succeeded,
                items_failed, items_skipped, items_total, started_at, last_activity, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                cursor_doc_id = excluded.cursor_doc_id,
                items_processed = excluded.items_processed,
                items_succeeded = excluded.items_succeeded,
                items_failed = excluded.items_failed,
                items_skipped = excluded.items_skipped,
                items_total = excluded.items_total,
                last_activity = excluded.last_activity,
                error = excluded.error
            "#,
        )
        .bind(&self.id)
        .bind(self.status.as_str())
        .bind(self.cursor_doc_id)
        .bind(self.items_processed)
        .bind(self.items_succeeded)
        .bind(self.items_failed)
        .bind(self.items_skipped)
        .bind(self.items_total)
        .bind(self.started_at.to_rfc3339())
        .bind(self.last_activity.to_rfc3339())
        .bind(&self.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Run a fetch job, emitting events into `tx`. Pause and cancel are honored
/// at batch and item boundaries; item failures never fail the job.
pub async fn run_fetch_job(
    store: Store,
    registry: Arc<JobRegistry<FetchJob>>,
    job_id: String,
    tx: mpsc::Sender<JobEvent>,
) {
    let Some(mut job) = registry.get(&job_id).await else {
        return;
    };

    let fetcher = match ContentFetcher::new() {
        Ok(f) => f,
        Err(e) => {
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
            return;
        }
    };
    let rate_limiter = DomainRateLimiter::new();

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

    if let Err(e) = run_loop(&store, &fetcher, &rate_limiter, &registry, &mut job, &tx).await {
        tracing::error!(job_id = %job.id, error = %e, "fetch job failed");
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

async fn run_loop(
    store: &Store,
    fetcher: &ContentFetcher,
    rate_limiter: &DomainRateLimiter,
    registry: &JobRegistry<FetchJob>,
    job: &mut FetchJob,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<()> {
    loop {
        match registry.get(&job.id).await.map(|j| j.status) {
            Some(JobStatus::Paused) => {
                let _ = tx
                    .send(JobEvent::job(EventKind::Paused, &job.id, job.to_json()))
                    .await;
                return Ok(());
            }
            Some(JobStatus::Cancelled) | None => {
                let _ = tx
                    .send(JobEvent::job(EventKind::Cancelled, &job.id, job.to_json()))
                    .await;
                return Ok(());
            }
            _ => {}
        }

        let docs = store
            .get_documents_for_fetch(job.cursor_doc_id, BATCH_SIZE)
            .await?;

        if docs.is_empty() {
            job.status = JobStatus::Completed;
            registry.update(job).await?;
            let _ = tx
                .send(JobEvent::job(EventKind::Completed, &job.id, job.to_json()))
                .await;
            return Ok(());
        }

        for doc in docs {
            job.cursor_doc_id = Some(doc.id);
            let title_short: String = doc.title.chars().take(50).collect();

            let Some(url) = doc.url else {
                job.items_skipped += 1;
                job.items_processed += 1;
                registry.update(job).await?;
                let _ = tx
                    .send(JobEvent::job(
                        EventKind::ItemSkipped,
                        &job.id,
                        json!({"doc_id": doc.id, "title": title_short, "reason": "no_url"}),
                    ))
                    .await;
                continue;
            };

            rate_limiter.wait_for(&url).await;

            let outcome = fetcher.fetch(&url).await;

            if outcome.success {
                let fulltext = outcome.fulltext.unwrap_or_default();
                store.save_fulltext(doc.id, &fulltext, "readability").await?;
                rate_limiter.record_success(&url).await;

                job.items_succeeded += 1;
                job.items_processed += 1;
                registry.update(job).await?;

                let _ = tx
                    .send(JobEvent::job(
                        EventKind::ItemSuccess,
                        &job.id,
                        json!({
                            "doc_id": doc.id,
                            "title": title_short,
                            "char_count": outcome.char_count,
                        }),
                    ))
                    .await;
            } else {
                let kind = outcome
                    .error_kind
                    .unwrap_or(crate::fetcher::FetchErrorKind::ExtractionFailed);
                store
                    .save_fetch_failure(
                        doc.id,
                        &url,
                        kind,
                        outcome.error_message.as_deref(),
                        outcome.http_status,
                        Some(&job.id),
                    )
                    .await?;

                if kind.retriable() {
                    rate_limiter.record_failure(&url).await;
                }

                job.items_failed += 1;
                job.items_processed += 1;
                registry.update(job).await?;

                let _ = tx
                    .send(JobEvent::job(
                        EventKind::ItemFailed,
                        &job.id,
                        json!({
                            "doc_id": doc.id,
                            "title": title_short,
                            "error_type": kind.as_str(),
                            "error_message": outcome.error_message,
                            "retriable": kind.retriable(),
                        }),
                    ))
                    .await;
            }

            if job.items_processed % 5 == 0 {
                let _ = tx
                    .send(JobEvent::job(EventKind::Progress, &job.id, job.to_json()))
                    .await;
            }

            match registry.get(&job.id).await.map(|j| j.status) {
                Some(JobStatus::Paused) => {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Paused, &job.id, job.to_json()))
                        .await;
                    return Ok(());
                }
                Some(JobStatus::Cancelled) | None => {
                    let _ = tx
                        .send(JobEvent::job(EventKind::Cancelled, &job.id, job.to_json()))
                        .await;
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}
