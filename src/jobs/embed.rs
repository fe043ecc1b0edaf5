//! Embed job: walks chunks lacking an embedding under `(provider, model)`
//! in cursor order, embeds them in batches, and persists each batch
//! atomically with one usage row.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::embedding::{create_provider, vec_to_blob, EmbeddingProvider};
use crate::store::{Store, UsageRecord};

use super::import::parse_ts;
use super::{EventKind, JobEvent, JobRecord, JobRegistry, JobStatus};

/// Tracks state of an embedding job.
#[derive(Debug, Clone)]
pub struct EmbedJob {
    pub id: String,
    pub status: JobStatus,
    pub cursor_chunk_id: Option<i64>,
    pub items_processed: i64,
    pub items_succeeded: i64,
    pub items_failed: i64,
    pub items_total: Option<i64>,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub provider: String,
    pub model: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error: Option<String>,
}

impl EmbedJob {
    pub fn new(items_total: Option<i64>, provider: &str, model: &str) -> Self {
        let now = Utc::now();
        EmbedJob {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            cursor_chunk_id: None,
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
            items_total,
            tokens_used: 0,
            cost_usd: 0.0,
            provider: provider.to_string(),
            model: model.to_string(),
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
            "cursor_chunk_id": self.cursor_chunk_id,
            "items_processed": self.items_processed,
            "items_succeeded": self.items_succeeded,
            "items_failed": self.items_failed,
            "items_total": self.items_total,
            "progress_percent": (self.progress_percent() * 10.0).round() / 10.0,
            "tokens_used": self.tokens_used,
            "cost_usd": (self.cost_usd * 1e6).round() / 1e6,
            "provider": self.provider,
            "model": self.model,
            "started_at": self.started_at.to_rfc3339(),
            "last_activity": self.last_activity.to_rfc3339(),
            "error": self.error,
        })
    }
}

#[async_trait::async_trait]
impl JobRecord for EmbedJob {
    const TABLE: &'static str = "embed_jobs";

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
        Ok(EmbedJob {
            id: row.get("id"),
            status: JobStatus::parse(&row.get::<String, _>("status")),
            cursor_chunk_id: row.get("cursor_chunk_id"),
            items_processed: row.get("items_processed"),
            items_succeeded: row.get("items_succeeded"),
            items_failed: row.get("items_failed"),
            items_total: row.get("items_total"),
            tokens_used: row.get("tokens_used"),
            cost_usd: row.get("cost_usd"),
            provider: row.get("provider"),
            model: row.get("model"),
            started_at: parse_ts(&row.get::<String, _>("started_at")),
            last_activity: parse_ts(&row.get::<String, _>("last_activity")),
            error: row.get("error"),
        })
    }

    async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embed_jobs (
                id, status, cursor_chunk_id, items_processed, items_succeeded,
                items_failed, items_total, tokens_used, cost_usd, provider, model,
                started_at, last_activity, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                cursor_chunk_id = excluded.cursor_chunk_id,
                items_processed = excluded.items_processed,
                items_succeeded = excluded.items_succeeded,
                items_failed = excluded.items_failed,
                items_total = excluded.items_total,
                tokens_used = excluded.tokens_used,
                cost_usd = excluded.cost_usd,
                last_activity = excluded.last_activity,
                error = excluded.error
            "#,
        )
        .bind(&self.id)
        .bind(self.status.as_str())
        .bind(self.cursor_chunk_id)
        .bind(self.items_processed)
        .bind(self.items_succeeded)
        .bind(self.items_failed)
        .bind(self.items_total)
        .bind(self.tokens_used)
        .bind(self.cost_usd)
        .bind(&self.provider)
        .bind(&self.model)
        .bind(self.started_at.to_rfc3339())
        .bind(self.last_activity.to_rfc3339())
        .bind(&self.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// Run an embedding job. Non-retriable provider errors fail the job;
/// retriable ones skip the batch and continue with the next.
pub async fn run_embed_job(
    store: Store,
    registry: Arc<JobRegistry<EmbedJob>>,
    job_id: String,
    batch_size: usize,
    tx: mpsc::Sender<JobEvent>,
) {
    let Some(mut job) = registry.get(&job_id).await else {
        return;
    };

    let provider = match create_provider(&job.provider, Some(&job.model)) {
        Ok(p) => p,
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

    job.status = JobStatus::Running;
    if registry.update(&mut job).await.is_err() {
        return;
    }

    let _ = tx
        .send(JobEvent::job(
            EventKind::Started,
            &job.id,
            json!({
                "items_total": job.items_total,
                "provider": job.provider,
                "model": job.model,
            }),
        ))
        .await;

    if let Err(e) = run_loop(&store, provider.as_ref(), &registry, &mut job, batch_size, &tx).await
    {
        tracing::error!(job_id = %job.id, error = %e, "embed job failed");
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
    provider: &dyn EmbeddingProvider,
    registry: &JobRegistry<EmbedJob>,
    job: &mut EmbedJob,
    batch_size: usize,
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

        let chunks = store
            .get_chunks_for_embedding(
                job.cursor_chunk_id,
                &job.provider,
                &job.model,
                batch_size as i64,
            )
            .await?;

        if chunks.is_empty() {
            job.status = JobStatus::Completed;
            registry.update(job).await?;
            let _ = tx
                .send(JobEvent::job(EventKind::Completed, &job.id, job.to_json()))
                .await;
            return Ok(());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.chunk_text.clone()).collect();
        let batch_tokens: i64 = texts.iter().map(|t| (t.len() / 4) as i64).sum();
        let last_chunk_id = chunks.last().map(|c| c.id);
        let started = std::time::Instant::now();

        match provider.embed(&texts).await {
            Ok(vectors) => {
                let rows: Vec<(i64, Vec<u8>)> = chunks
                    .iter()
                    .zip(vectors.iter())
                    .map(|(chunk, vector)| (chunk.id, vec_to_blob(vector)))
                    .collect();

                let saved = store
                    .save_embeddings_batch(
                        &rows,
                        provider.dimensions(),
                        &job.provider,
                        &job.model,
                    )
                    .await?;

                let batch_cost = provider.estimate_cost(batch_tokens.max(0) as u64);

                store
                    .record_usage(&UsageRecord {
                        provider: job.provider.clone(),
                        model: job.model.clone(),
                        operation: "embed_batch".to_string(),
                        tokens_input: batch_tokens,
                        tokens_output: 0,
                        cost_usd: batch_cost,
                        latency_ms: Some(started.elapsed().as_millis() as i64),
                        success: true,
                        error_message: None,
                        metadata_json: Some(json!({"batch_size": chunks.len()}).to_string()),
                    })
                    .await?;

                job.cursor_chunk_id = last_chunk_id;
                job.items_processed += chunks.len() as i64;
                job.items_succeeded += saved as i64;
                job.tokens_used += batch_tokens;
                job.cost_usd += batch_cost;
                registry.update(job).await?;

                let _ = tx
                    .send(JobEvent::job(
                        EventKind::BatchComplete,
                        &job.id,
                        json!({
                            "batch_size": chunks.len(),
                            "batch_tokens": batch_tokens,
                            "items_processed": job.items_processed,
                            "items_succeeded": job.items_succeeded,
                            "items_total": job.items_total,
                            "tokens_used": job.tokens_used,
                            "cost_usd": (job.cost_usd * 1e6).round() / 1e6,
                            "progress_percent": (job.progress_percent() * 10.0).round() / 10.0,
                        }),
                    ))
                    .await;
            }
            Err(e) => {
                store
                    .record_usage(&UsageRecord {
                        provider: job.provider.clone(),
                        model: job.model.clone(),
                        operation: "embed_batch".to_string(),
                        tokens_input: 0,
                        tokens_output: 0,
                        cost_usd: 0.0,
                        latency_ms: Some(started.elapsed().as_millis() as i64),
                        success: false,
                        error_message: Some(e.to_string()),
                        metadata_json: Some(json!({"batch_size": chunks.len()}).to_string()),
                    })
                    .await?;

                if !e.retriable() {
                    job.status = JobStatus::Failed;
                    job.error = Some(e.to_string());
                    registry.update(job).await?;
                    let _ = tx
                        .send(JobEvent::job(
                            EventKind::Failed,
                            &job.id,
                            json!({"error": e.to_string()}),
                        ))
                        .await;
                    return Ok(());
                }

                // The provider already retried internally; move on to the
                // next batch and leave these chunks for a later run.
                tracing::warn!(job_id = %job.id, error = %e, "embedding batch failed, continuing");
                job.cursor_chunk_id = last_chunk_id;
                job.items_failed += chunks.len() as i64;
                job.items_processed += chunks.len() as i64;
                registry.update(job).await?;
            }
        }
    }
}
