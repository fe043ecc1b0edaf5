//! Pipeline job: IMPORT → CHUNK → EMBED → INDEX in one orchestrated run.
//!
//! Import and embed phases run as child jobs whose events are proxied
//! upward as phase events; chunking and indexing run inline. A heartbeat
//! ticks every two seconds during long child stretches so an SSE client can
//! tell "still working" from "stalled". Control status is checked before
//! and inside every phase; `last_sync_at` is persisted only at the very end
//! so the next import runs incrementally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chunker::chunk_with_params;
use crate::config::Config;
use crate::embedding::model_info;
use crate::reader::ReaderClient;
use crate::store::Store;

use super::embed::{run_embed_job, EmbedJob};
use super::import::{parse_ts, run_import_job, ImportJob};
use super::{EventKind, JobEvent, JobRecord, JobRegistry, JobStatus};

pub const LAST_SYNC_KEY: &str = "last_sync_at";

const CHUNK_BATCH_SIZE: i64 = 50;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Phases of the sync pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Import,
    Chunk,
    Embed,
    Index,
    Done,
}

impl PipelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelinePhase::Idle => "idle",
            PipelinePhase::Import => "import",
            PipelinePhase::Chunk => "chunk",
            PipelinePhase::Embed => "embed",
            PipelinePhase::Index => "index",
            PipelinePhase::Done => "done",
        }
    }

    pub fn parse(s: &str) -> PipelinePhase {
        match s {
            "import" => PipelinePhase::Import,
            "chunk" => PipelinePhase::Chunk,
            "embed" => PipelinePhase::Embed,
            "index" => PipelinePhase::Index,
            "done" => PipelinePhase::Done,
            _ => PipelinePhase::Idle,
        }
    }
}

/// Tracks state of a pipeline job, aggregating its child jobs' counters.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    pub id: String,
    pub status: JobStatus,
    pub phase: PipelinePhase,
    pub import_job_id: Option<String>,
    pub embed_job_id: Option<String>,
    pub docs_imported: i64,
    pub docs_merged: i64,
    pub chunks_created: i64,
    pub chunks_embedded: i64,
    pub chunks_total: i64,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub error: Option<String>,
}

impl PipelineJob {
    pub fn new() -> Self {
        let now = Utc::now();
        PipelineJob {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            phase: PipelinePhase::Idle,
            import_job_id: None,
            embed_job_id: None,
            docs_imported: 0,
            docs_merged: 0,
            chunks_created: 0,
            chunks_embedded: 0,
            chunks_total: 0,
            tokens_used: 0,
            cost_usd: 0.0,
            started_at: now,
            last_activity: now,
            error: None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "status": self.status.as_str(),
            "phase": self.phase.as_str(),
            "import_job_id": self.import_job_id,
            "embed_job_id": self.embed_job_id,
            "docs_imported": self.docs_imported,
            "docs_merged": self.docs_merged,
            "chunks_created": self.chunks_created,
            "chunks_embedded": self.chunks_embedded,
            "chunks_total": self.chunks_total,
            "tokens_used": self.tokens_used,
            "cost_usd": (self.cost_usd * 1e6).round() / 1e6,
            "started_at": self.started_at.to_rfc3339(),
            "last_activity": self.last_activity.to_rfc3339(),
            "error": self.error,
        })
    }
}

impl Default for PipelineJob {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl JobRecord for PipelineJob {
    const TABLE: &'static str = "pipeline_jobs";

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
        Ok(PipelineJob {
            id: row.get("id"),
            status: JobStatus::parse(&row.get::<String, _>("status")),
            phase: PipelinePhase::parse(&row.get::<String, _>("phase")),
            import_job_id: row.get("import_job_id"),
            embed_job_id: row.get("embed_job_id"),
            docs_imported: row.get("docs_imported"),
            docs_merged: row.get("docs_merged"),
            chunks_created: row.get("chunks_created"),
            chunks_embedded: row.get("chunks_embedded"),
            chunks_total: row.get("chunks_total"),
            tokens_used: row.get("tokens_used"),
            cost_usd: row.get("cost_usd"),
            started_at: parse_ts(&row.get::<String, _>("started_at")),
            last_activity: parse_ts(&row.get::<String, _>("last_activity")),
            error: row.get("error"),
        })
    }

    async fn persist(&self, pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_jobs (
                id, status, phase, import_job_id, embed_job_id,
                docs_imported, docs_merged, chunks_created, chunks_embedded, chunks_total,
                tokens_used, cost_usd, started_at, last_activity, error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                phase = excluded.phase,
                import_job_id = excluded.import_job_id,
                embed_job_id = excluded.embed_job_id,
                docs_imported = excluded.docs_imported,
                docs_merged = excluded.docs_merged,
                chunks_created = excluded.chunks_created,
                chunks_embedded = excluded.chunks_embedded,
                chunks_total = excluded.chunks_total,
                tokens_used = excluded.tokens_used,
                cost_usd = excluded.cost_usd,
                last_activity = excluded.last_activity,
                error = excluded.error
            "#,
        )
        .bind(&self.id)
        .bind(self.status.as_str())
        .bind(self.phase.as_str())
        .bind(&self.import_job_id)
        .bind(&self.embed_job_id)
        .bind(self.docs_imported)
        .bind(self.docs_merged)
        .bind(self.chunks_created)
        .bind(self.chunks_embedded)
        .bind(self.chunks_total)
        .bind(self.tokens_used)
        .bind(self.cost_usd)
        .bind(self.started_at.to_rfc3339())
        .bind(self.last_activity.to_rfc3339())
        .bind(&self.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// The registries a pipeline run touches.
#[derive(Clone)]
pub struct PipelineContext {
    pub pipeline_jobs: Arc<JobRegistry<PipelineJob>>,
    pub import_jobs: Arc<JobRegistry<ImportJob>>,
    pub embed_jobs: Arc<JobRegistry<EmbedJob>>,
}

enum PhaseStop {
    Paused,
    Cancelled,
}

/// Run the full sync pipeline, emitting phase-scoped events into `tx`.
pub async fn run_pipeline(
    store: Store,
    config: Arc<Config>,
    ctx: PipelineContext,
    job_id: String,
    skip_import: bool,
    tx: mpsc::Sender<JobEvent>,
) {
    let Some(mut job) = ctx.pipeline_jobs.get(&job_id).await else {
        return;
    };

    job.status = JobStatus::Running;
    if ctx.pipeline_jobs.update(&mut job).await.is_err() {
        return;
    }

    match run_phases(&store, &config, &ctx, &mut job, skip_import, &tx).await {
        Ok(None) => {
            job.phase = PipelinePhase::Done;
            job.status = JobStatus::Completed;
            let _ = ctx.pipeline_jobs.update(&mut job).await;

            // Persisted last so a failed run re-imports its window.
            let _ = store
                .set_setting(LAST_SYNC_KEY, &job.started_at.to_rfc3339())
                .await;

            let _ = tx
                .send(JobEvent::phase(
                    EventKind::PipelineComplete,
                    PipelinePhase::Done.as_str(),
                    json!({
                        "summary": {
                            "docs_imported": job.docs_imported,
                            "docs_merged": job.docs_merged,
                            "chunks_created": job.chunks_created,
                            "chunks_embedded": job.chunks_embedded,
                            "tokens_used": job.tokens_used,
                            "cost_usd": (job.cost_usd * 1e6).round() / 1e6,
                        },
                        "job": job.to_json(),
                    }),
                ))
                .await;
        }
        Ok(Some(PhaseStop::Paused)) => {
            let _ = tx
                .send(JobEvent::phase(
                    EventKind::PipelinePaused,
                    job.phase.as_str(),
                    job.to_json(),
                ))
                .await;
        }
        Ok(Some(PhaseStop::Cancelled)) => {
            let _ = tx
                .send(JobEvent::phase(
                    EventKind::PipelineCancelled,
                    job.phase.as_str(),
                    job.to_json(),
                ))
                .await;
        }
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "pipeline failed");
            job.status = JobStatus::Failed;
            job.error = Some(e.to_string());
            let _ = ctx.pipeline_jobs.update(&mut job).await;
            let _ = tx
                .send(JobEvent::phase(
                    EventKind::PipelineFailed,
                    job.phase.as_str(),
                    json!({"error": e.to_string(), "job": job.to_json()}),
                ))
                .await;
        }
    }
}

async fn control(ctx: &PipelineContext, job_id: &str) -> Option<PhaseStop> {
    match ctx.pipeline_jobs.get(job_id).await.map(|j| j.status) {
        Some(JobStatus::Paused) => Some(PhaseStop::Paused),
        Some(JobStatus::Cancelled) | None => Some(PhaseStop::Cancelled),
        _ => None,
    }
}

async fn run_phases(
    store: &Store,
    config: &Config,
    ctx: &PipelineContext,
    job: &mut PipelineJob,
    skip_import: bool,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<Option<PhaseStop>> {
    // ========== PHASE 1: IMPORT ==========
    if !skip_import {
        job.phase = PipelinePhase::Import;
        ctx.pipeline_jobs.update(job).await?;

        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseStart,
                PipelinePhase::Import.as_str(),
                json!({"message": "Starting import from reading service"}),
            ))
            .await;

        let updated_after = store.get_setting(LAST_SYNC_KEY).await?;

        let import_job = ImportJob::new();
        let import_job_id = import_job.id.clone();
        ctx.import_jobs.insert(import_job).await?;
        job.import_job_id = Some(import_job_id.clone());
        ctx.pipeline_jobs.update(job).await?;

        if let Some(stop) =
            drive_import(store, config, ctx, job, &import_job_id, updated_after, tx).await?
        {
            return Ok(Some(stop));
        }

        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseComplete,
                PipelinePhase::Import.as_str(),
                json!({
                    "docs_imported": job.docs_imported,
                    "docs_merged": job.docs_merged,
                }),
            ))
            .await;
    }

    // ========== PHASE 2: CHUNK ==========
    job.phase = PipelinePhase::Chunk;
    ctx.pipeline_jobs.update(job).await?;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseStart,
            PipelinePhase::Chunk.as_str(),
            json!({"message": "Creating chunks for new documents"}),
        ))
        .await;

    let mut chunk_cursor: Option<i64> = None;
    loop {
        if let Some(stop) = control(ctx, &job.id).await {
            return Ok(Some(stop));
        }

        let docs = store
            .get_documents_for_chunking(chunk_cursor, CHUNK_BATCH_SIZE)
            .await?;
        if docs.is_empty() {
            break;
        }

        for doc in &docs {
            chunk_cursor = Some(doc.id);
            let Some(fulltext) = &doc.fulltext else {
                continue;
            };
            let chunks = chunk_with_params(
                fulltext,
                doc.title.as_deref().unwrap_or(""),
                config.chunking.chunk_size,
                config.chunking.chunk_overlap,
                config.chunking.min_chunk_size,
            );
            if chunks.is_empty() {
                tracing::debug!(doc_id = doc.id, "full text below minimum chunk size");
                continue;
            }
            store.save_chunks(doc.id, &chunks).await?;
            job.chunks_created += chunks.len() as i64;
        }

        ctx.pipeline_jobs.update(job).await?;
        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseProgress,
                PipelinePhase::Chunk.as_str(),
                json!({"chunks_created": job.chunks_created}),
            ))
            .await;
    }

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            PipelinePhase::Chunk.as_str(),
            json!({"chunks_created": job.chunks_created}),
        ))
        .await;

    // ========== PHASE 3: EMBED ==========
    job.phase = PipelinePhase::Embed;
    ctx.pipeline_jobs.update(job).await?;

    let provider = &config.embedding.provider;
    let model = &config.embedding.model;
    let counts = store.count_chunks_for_embedding(provider, model).await?;

    if counts.pending == 0 {
        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseComplete,
                PipelinePhase::Embed.as_str(),
                json!({"chunks_embedded": 0, "message": "No new chunks to embed"}),
            ))
            .await;
    } else {
        let est_tokens = counts.pending * 200;
        let cost_per_1m = model_info(provider, model)
            .map(|m| m.cost_per_1m_tokens)
            .unwrap_or(0.0);
        let est_cost = est_tokens as f64 * cost_per_1m / 1_000_000.0;

        if config.limits.require_cost_confirm {
            let _ = tx
                .send(JobEvent::phase(
                    EventKind::CostConfirm,
                    PipelinePhase::Embed.as_str(),
                    json!({
                        "pending_chunks": counts.pending,
                        "estimated_tokens": est_tokens,
                        "estimated_cost_usd": (est_cost * 1e4).round() / 1e4,
                    }),
                ))
                .await;
        }

        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseStart,
                PipelinePhase::Embed.as_str(),
                json!({
                    "message": format!("Generating embeddings for {} chunks", counts.pending),
                    "pending_chunks": counts.pending,
                    "estimated_cost_usd": (est_cost * 1e4).round() / 1e4,
                }),
            ))
            .await;

        job.chunks_total = counts.pending;
        ctx.pipeline_jobs.update(job).await?;

        let embed_job = EmbedJob::new(Some(counts.pending), provider, model);
        let embed_job_id = embed_job.id.clone();
        ctx.embed_jobs.insert(embed_job).await?;
        job.embed_job_id = Some(embed_job_id.clone());
        ctx.pipeline_jobs.update(job).await?;

        if let Some(stop) = drive_embed(store, config, ctx, job, &embed_job_id, tx).await? {
            return Ok(Some(stop));
        }

        let _ = tx
            .send(JobEvent::phase(
                EventKind::PhaseComplete,
                PipelinePhase::Embed.as_str(),
                json!({
                    "chunks_embedded": job.chunks_embedded,
                    "tokens_used": job.tokens_used,
                    "cost_usd": (job.cost_usd * 1e4).round() / 1e4,
                }),
            ))
            .await;
    }

    // ========== PHASE 4: INDEX ==========
    if let Some(stop) = control(ctx, &job.id).await {
        return Ok(Some(stop));
    }

    job.phase = PipelinePhase::Index;
    ctx.pipeline_jobs.update(job).await?;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseStart,
            PipelinePhase::Index.as_str(),
            json!({"message": "Refreshing search index"}),
        ))
        .await;

    let indexed = store.rebuild_fts().await?;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            PipelinePhase::Index.as_str(),
            json!({"indexed_documents": indexed}),
        ))
        .await;

    Ok(None)
}

/// Drive the child import job, proxying its events as import-phase events.
async fn drive_import(
    store: &Store,
    config: &Config,
    ctx: &PipelineContext,
    job: &mut PipelineJob,
    import_job_id: &str,
    updated_after: Option<String>,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<Option<PhaseStop>> {
    let token = config
        .reading_service_token()
        .ok_or_else(|| anyhow!("READWISE_TOKEN not set"))?;
    let client = ReaderClient::new(&config.reading_service.base_url, &token)
        .map_err(|e| anyhow!(e.to_string()))?;

    let (child_tx, mut child_rx) = mpsc::channel::<JobEvent>(64);

    let handle = tokio::spawn(run_import_job(
        store.clone(),
        client,
        ctx.import_jobs.clone(),
        import_job_id.to_string(),
        updated_after,
        child_tx,
    ));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failed: Option<String> = None;

    loop {
        tokio::select! {
            event = child_rx.recv() => {
                let Some(event) = event else { break };

                if let Some(stop) = control(ctx, &job.id).await {
                    match stop {
                        PhaseStop::Paused => { let _ = ctx.import_jobs.pause(import_job_id).await; }
                        PhaseStop::Cancelled => { let _ = ctx.import_jobs.cancel(import_job_id).await; }
                    }
                    drop(child_rx);
                    let _ = handle.await;
                    return Ok(Some(stop));
                }

                match event.kind {
                    EventKind::Progress | EventKind::ItemSuccess => {
                        if let Some(import_job) = ctx.import_jobs.get(import_job_id).await {
                            job.docs_imported = import_job.items_imported;
                            job.docs_merged = import_job.items_merged;
                        }
                        if event.kind == EventKind::Progress {
                            ctx.pipeline_jobs.update(job).await?;
                            let _ = tx.send(JobEvent::phase(
                                EventKind::PhaseProgress,
                                PipelinePhase::Import.as_str(),
                                json!({
                                    "docs_imported": job.docs_imported,
                                    "docs_merged": job.docs_merged,
                                }),
                            )).await;
                        }
                    }
                    EventKind::ItemError => {
                        tracing::warn!(data = %event.data, "import item error");
                    }
                    EventKind::Failed => {
                        failed = Some(
                            event.data.get("error")
                                .and_then(|v| v.as_str())
                                .unwrap_or("import failed")
                                .to_string(),
                        );
                    }
                    EventKind::Paused => {
                        // Child observed a pause on its own registry.
                        drop(child_rx);
                        let _ = handle.await;
                        return Ok(Some(PhaseStop::Paused));
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let _ = tx.send(JobEvent::phase(
                    EventKind::Heartbeat,
                    PipelinePhase::Import.as_str(),
                    json!({"docs_imported": job.docs_imported, "docs_merged": job.docs_merged}),
                )).await;
            }
        }
    }

    let _ = handle.await;

    if let Some(import_job) = ctx.import_jobs.get(import_job_id).await {
        job.docs_imported = import_job.items_imported;
        job.docs_merged = import_job.items_merged;
        ctx.pipeline_jobs.update(job).await?;
    }

    if let Some(error) = failed {
        return Err(anyhow!(error));
    }
    Ok(None)
}

/// Drive the child embed job, proxying its batch events upward.
async fn drive_embed(
    store: &Store,
    config: &Config,
    ctx: &PipelineContext,
    job: &mut PipelineJob,
    embed_job_id: &str,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<Option<PhaseStop>> {
    let (child_tx, mut child_rx) = mpsc::channel::<JobEvent>(64);

    let handle = tokio::spawn(run_embed_job(
        store.clone(),
        ctx.embed_jobs.clone(),
        embed_job_id.to_string(),
        config.embedding.batch_size,
        child_tx,
    ));

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut failed: Option<String> = None;

    loop {
        tokio::select! {
            event = child_rx.recv() => {
                let Some(event) = event else { break };

                if let Some(stop) = control(ctx, &job.id).await {
                    match stop {
                        PhaseStop::Paused => { let _ = ctx.embed_jobs.pause(embed_job_id).await; }
                        PhaseStop::Cancelled => { let _ = ctx.embed_jobs.cancel(embed_job_id).await; }
                    }
                    drop(child_rx);
                    let _ = handle.await;
                    return Ok(Some(stop));
                }

                match event.kind {
                    EventKind::BatchComplete => {
                        if let Some(embed_job) = ctx.embed_jobs.get(embed_job_id).await {
                            job.chunks_embedded = embed_job.items_succeeded;
                            job.tokens_used = embed_job.tokens_used;
                            job.cost_usd = embed_job.cost_usd;
                            let progress = embed_job.progress_percent();
                            ctx.pipeline_jobs.update(job).await?;
                            let _ = tx.send(JobEvent::phase(
                                EventKind::PhaseProgress,
                                PipelinePhase::Embed.as_str(),
                                json!({
                                    "chunks_embedded": job.chunks_embedded,
                                    "chunks_total": job.chunks_total,
                                    "tokens_used": job.tokens_used,
                                    "cost_usd": (job.cost_usd * 1e4).round() / 1e4,
                                    "progress_percent": (progress * 10.0).round() / 10.0,
                                }),
                            )).await;
                        }
                    }
                    EventKind::Failed => {
                        failed = Some(
                            event.data.get("error")
                                .and_then(|v| v.as_str())
                                .unwrap_or("embedding failed")
                                .to_string(),
                        );
                    }
                    EventKind::Paused => {
                        drop(child_rx);
                        let _ = handle.await;
                        return Ok(Some(PhaseStop::Paused));
                    }
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                let _ = tx.send(JobEvent::phase(
                    EventKind::Heartbeat,
                    PipelinePhase::Embed.as_str(),
                    json!({"chunks_embedded": job.chunks_embedded, "chunks_total": job.chunks_total}),
                )).await;
            }
        }
    }

    let _ = handle.await;

    if let Some(embed_job) = ctx.embed_jobs.get(embed_job_id).await {
        job.chunks_embedded = embed_job.items_succeeded;
        job.tokens_used = embed_job.tokens_used;
        job.cost_usd = embed_job.cost_usd;
        ctx.pipeline_jobs.update(job).await?;
    }

    if let Some(error) = failed {
        return Err(anyhow!(error));
    }
    Ok(None)
}
