//! Digest generator: FETCH → CLUSTER → SUMMARIZE → COMPILE.
//!
//! Pulls chunks from a date window, groups them into topics (k-means over
//! embeddings or a single LLM clustering call), composes an overall summary
//! with highlights, and persists the digest with citations back to the
//! source chunks. Every LLM call adds to the job's token totals and lands
//! in the usage ledger.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::clustering::{cluster_chunks, strip_code_fences, ClusteringResult, DEFAULT_NUM_CLUSTERS};
use crate::llm::{ChatMessage, ChatProvider};
use crate::prompts::{self, KEY_DIGEST_SUMMARY};
use crate::store::{DigestChunk, Store, UsageRecord};

use crate::jobs::{EventKind, JobEvent, JobStatus};

/// Citation excerpts keep this many leading chars of the chunk.
const EXCERPT_LEN: usize = 200;
/// At most this many chunks feed one digest window.
const FETCH_LIMIT: i64 = 2000;

/// Phases of digest generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestPhase {
    Idle,
    Fetch,
    Cluster,
    Summarize,
    Compile,
    Done,
}

impl DigestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestPhase::Idle => "idle",
            DigestPhase::Fetch => "fetch",
            DigestPhase::Cluster => "cluster",
            DigestPhase::Summarize => "summarize",
            DigestPhase::Compile => "compile",
            DigestPhase::Done => "done",
        }
    }
}

/// Tracks state of a digest generation run. Digest jobs are ephemeral:
/// they live in memory only, unlike the four persisted job kinds.
#[derive(Debug, Clone)]
pub struct DigestJob {
    pub id: String,
    pub status: JobStatus,
    pub phase: DigestPhase,
    pub strategy: String,
    pub model: String,
    pub days: i64,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub docs_found: i64,
    pub chunks_found: i64,
    pub topics_created: i64,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub cost_usd: f64,
    pub digest_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl DigestJob {
    pub fn new(strategy: &str, model: &str, days: i64) -> Self {
        DigestJob {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Pending,
            phase: DigestPhase::Idle,
            strategy: strategy.to_string(),
            model: model.to_string(),
            days,
            date_from: None,
            date_to: None,
            docs_found: 0,
            chunks_found: 0,
            topics_created: 0,
            tokens_input: 0,
            tokens_output: 0,
            cost_usd: 0.0,
            digest_id: None,
            started_at: Utc::now(),
            error: None,
        }
    }

    fn add_tokens(&mut self, tokens_input: i64, tokens_output: i64, cost: f64) {
        self.tokens_input += tokens_input;
        self.tokens_output += tokens_output;
        self.cost_usd += cost;
    }

    pub fn total_tokens(&self) -> i64 {
        self.tokens_input + self.tokens_output
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "status": self.status.as_str(),
            "phase": self.phase.as_str(),
            "strategy": self.strategy,
            "model": self.model,
            "days": self.days,
            "date_from": self.date_from.map(|d| d.to_rfc3339()),
            "date_to": self.date_to.map(|d| d.to_rfc3339()),
            "docs_found": self.docs_found,
            "chunks_found": self.chunks_found,
            "topics_created": self.topics_created,
            "tokens_input": self.tokens_input,
            "tokens_output": self.tokens_output,
            "cost_usd": (self.cost_usd * 1e6).round() / 1e6,
            "digest_id": self.digest_id,
            "started_at": self.started_at.to_rfc3339(),
            "error": self.error,
        })
    }
}

/// In-memory store for digest jobs.
pub struct DigestJobStore {
    jobs: Mutex<HashMap<String, DigestJob>>,
}

impl DigestJobStore {
    pub fn new() -> Self {
        DigestJobStore {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, job: DigestJob) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    pub async fn get(&self, job_id: &str) -> Option<DigestJob> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn update(&self, job: &DigestJob) {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
    }

    pub async fn get_running(&self) -> Option<DigestJob> {
        self.jobs
            .lock()
            .await
            .values()
            .find(|j| j.status == JobStatus::Running)
            .cloned()
    }

    pub async fn list_all(&self) -> Vec<DigestJob> {
        let mut jobs: Vec<DigestJob> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.started_at));
        jobs
    }
}

impl Default for DigestJobStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the digest pipeline, emitting phase events into `tx`.
pub async fn run_digest(
    store: Store,
    llm: Box<dyn ChatProvider>,
    digest_jobs: Arc<DigestJobStore>,
    job_id: String,
    embed_provider: String,
    embed_model: String,
    tx: mpsc::Sender<JobEvent>,
) {
    let Some(mut job) = digest_jobs.get(&job_id).await else {
        return;
    };

    let date_to = Utc::now();
    let date_from = date_to - Duration::days(job.days);
    job.date_from = Some(date_from);
    job.date_to = Some(date_to);
    job.status = JobStatus::Running;
    digest_jobs.update(&job).await;

    match run_phases(
        &store,
        llm.as_ref(),
        &digest_jobs,
        &mut job,
        &embed_provider,
        &embed_model,
        &tx,
    )
    .await
    {
        Ok(()) => {}
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "digest pipeline failed");
            job.status = JobStatus::Failed;
            job.error = Some(e.to_string());
            digest_jobs.update(&job).await;
            let _ = tx
                .send(JobEvent::phase(
                    EventKind::DigestFailed,
                    job.phase.as_str(),
                    json!({"error": e.to_string()}),
                ))
                .await;
        }
    }
}

async fn run_phases(
    store: &Store,
    llm: &dyn ChatProvider,
    digest_jobs: &DigestJobStore,
    job: &mut DigestJob,
    embed_provider: &str,
    embed_model: &str,
    tx: &mpsc::Sender<JobEvent>,
) -> Result<()> {
    // Phase 1: FETCH
    job.phase = DigestPhase::Fetch;
    digest_jobs.update(job).await;

    let date_from = job.date_from.map(|d| d.format("%Y-%m-%d").to_string());
    let date_to = job.date_to.map(|d| d.format("%Y-%m-%d").to_string());
    let date_from = date_from.as_deref().unwrap_or_default();
    let date_to = date_to.as_deref().unwrap_or_default();

    let vectors = if job.strategy == "hybrid" {
        Some((embed_provider, embed_model))
    } else {
        None
    };
    let chunks = store
        .get_chunks_in_date_range(date_from, date_to, FETCH_LIMIT, vectors)
        .await?;

    let doc_count = {
        let mut ids: Vec<i64> = chunks.iter().map(|c| c.document_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len() as i64
    };

    job.chunks_found = chunks.len() as i64;
    job.docs_found = doc_count;
    digest_jobs.update(job).await;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            DigestPhase::Fetch.as_str(),
            json!({"chunks_found": chunks.len(), "docs_found": doc_count}),
        ))
        .await;

    if chunks.is_empty() {
        job.status = JobStatus::Completed;
        job.phase = DigestPhase::Done;
        job.error = Some("No chunks found in the date range".to_string());
        digest_jobs.update(job).await;
        let _ = tx
            .send(JobEvent::phase(
                EventKind::DigestComplete,
                DigestPhase::Done.as_str(),
                json!({"message": "Nothing to analyze"}),
            ))
            .await;
        return Ok(());
    }

    // Phase 2: CLUSTER
    job.phase = DigestPhase::Cluster;
    digest_jobs.update(job).await;

    tracing::info!(chunks = chunks.len(), strategy = %job.strategy, "clustering for digest");

    let clustering =
        cluster_chunks(store, llm, &chunks, &job.strategy, DEFAULT_NUM_CLUSTERS).await?;

    job.add_tokens(
        clustering.tokens_input,
        clustering.tokens_output,
        clustering.cost_usd,
    );
    job.topics_created = clustering.clusters.len() as i64;
    digest_jobs.update(job).await;

    record_chat_usage(store, llm, "digest_cluster", &clustering).await;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            DigestPhase::Cluster.as_str(),
            json!({
                "topics_created": clustering.clusters.len(),
                "strategy": clustering.strategy,
            }),
        ))
        .await;

    // Phase 3: SUMMARIZE
    job.phase = DigestPhase::Summarize;
    digest_jobs.update(job).await;

    let (summary, highlights) = summarize(store, llm, job, &clustering).await?;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            DigestPhase::Summarize.as_str(),
            json!({
                "summary_length": summary.len(),
                "highlights_count": highlights.len(),
            }),
        ))
        .await;

    // Phase 4: COMPILE
    job.phase = DigestPhase::Compile;
    digest_jobs.update(job).await;

    let digest_id = compile(store, job, &chunks, &clustering, &summary, &highlights).await?;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::PhaseComplete,
            DigestPhase::Compile.as_str(),
            json!({"digest_id": digest_id}),
        ))
        .await;

    job.status = JobStatus::Completed;
    job.phase = DigestPhase::Done;
    job.digest_id = Some(digest_id);
    digest_jobs.update(job).await;

    let _ = tx
        .send(JobEvent::phase(
            EventKind::DigestComplete,
            DigestPhase::Done.as_str(),
            json!({
                "digest_id": digest_id,
                "topics_count": clustering.clusters.len(),
                "total_cost_usd": (job.cost_usd * 1e6).round() / 1e6,
                "total_tokens": job.total_tokens(),
            }),
        ))
        .await;

    Ok(())
}

/// Overall summary + highlights from the clustered topics. A parse failure
/// falls back to the raw content as the summary.
async fn summarize(
    store: &Store,
    llm: &dyn ChatProvider,
    job: &mut DigestJob,
    clustering: &ClusteringResult,
) -> Result<(String, Vec<String>)> {
    let prompt = prompts::get_prompt(store, KEY_DIGEST_SUMMARY)
        .await?
        .ok_or_else(|| anyhow::anyhow!("prompt '{}' not found", KEY_DIGEST_SUMMARY))?;

    let topics_text: Vec<String> = clustering
        .clusters
        .iter()
        .map(|cluster| {
            let mut block = format!(
                "**{}** ({} chunks)",
                cluster.topic_name,
                cluster.chunk_ids.len()
            );
            if !cluster.summary.is_empty() {
                block.push('\n');
                block.push_str(&cluster.summary);
            }
            if !cluster.key_points.is_empty() {
                block.push_str("\n- ");
                block.push_str(&cluster.key_points.join("\n- "));
            }
            block
        })
        .collect();
    let topics_joined = topics_text.join("\n\n");

    let rendered = prompt.render(&[("topics_joined", topics_joined.as_str())]);
    let started = std::time::Instant::now();

    let response = llm
        .chat(
            &[ChatMessage::user(rendered)],
            prompt.temperature,
            Some(prompt.max_tokens),
        )
        .await;

    let response = match response {
        Ok(response) => {
            let cost = llm.estimate_cost(response.tokens_input, response.tokens_output);
            job.add_tokens(response.tokens_input, response.tokens_output, cost);
            let _ = store
                .record_usage(&UsageRecord {
                    provider: llm.name().to_string(),
                    model: llm.model_id().to_string(),
                    operation: "chat".to_string(),
                    tokens_input: response.tokens_input,
                    tokens_output: response.tokens_output,
                    cost_usd: cost,
                    latency_ms: Some(started.elapsed().as_millis() as i64),
                    success: true,
                    error_message: None,
                    metadata_json: Some(json!({"purpose": "digest_summary"}).to_string()),
                })
                .await;
            response
        }
        Err(e) => {
            let _ = store
                .record_usage(&UsageRecord {
                    provider: llm.name().to_string(),
                    model: llm.model_id().to_string(),
                    operation: "chat".to_string(),
                    success: false,
                    latency_ms: Some(started.elapsed().as_millis() as i64),
                    error_message: Some(e.to_string()),
                    ..Default::default()
                })
                .await;
            return Err(e.into());
        }
    };

    let content = strip_code_fences(&response.content);
    match serde_json::from_str::<serde_json::Value>(content) {
        Ok(data) => {
            let summary = data
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let highlights = data
                .get("highlights")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            Ok((summary, highlights))
        }
        Err(_) => {
            tracing::warn!("failed to parse summary response, using raw content");
            let summary = crate::embedding::truncate_chars(content, 500).to_string();
            Ok((summary, Vec::new()))
        }
    }
}

/// Write the digest row with topics, highlights, and one citation per
/// `(topic, chunk)` pair.
async fn compile(
    store: &Store,
    job: &DigestJob,
    chunks: &[DigestChunk],
    clustering: &ClusteringResult,
    summary: &str,
    highlights: &[String],
) -> Result<i64> {
    let date_from = job
        .date_from
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let date_to = job
        .date_to
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_default();
    let name = format!("Digest {} to {}", date_from, date_to);

    let highlights_json = if highlights.is_empty() {
        None
    } else {
        Some(serde_json::to_string(highlights)?)
    };

    let text_by_chunk: HashMap<i64, &str> = chunks
        .iter()
        .map(|c| (c.id, c.chunk_text.as_str()))
        .collect();

    let excerpts: Vec<(i64, i64, String)> = clustering
        .clusters
        .iter()
        .flat_map(|cluster| {
            cluster.chunk_ids.iter().map(|&chunk_id| {
                let excerpt = text_by_chunk
                    .get(&chunk_id)
                    .map(|t| crate::embedding::truncate_chars(t, EXCERPT_LEN).to_string())
                    .unwrap_or_default();
                (cluster.topic_index, chunk_id, excerpt)
            })
        })
        .collect();

    let digest_id = store
        .save_generated_digest(
            &name,
            job.days,
            &date_from,
            &date_to,
            &job.strategy,
            &job.model,
            summary,
            &clustering.clusters,
            highlights_json.as_deref(),
            job.docs_found,
            job.chunks_found,
            job.tokens_input,
            job.tokens_output,
            job.cost_usd,
            &excerpts,
        )
        .await?;

    tracing::info!(
        digest_id,
        docs = job.docs_found,
        chunks = job.chunks_found,
        cost_usd = job.cost_usd,
        "saved digest"
    );

    Ok(digest_id)
}

async fn record_chat_usage(
    store: &Store,
    llm: &dyn ChatProvider,
    purpose: &str,
    clustering: &ClusteringResult,
) {
    if clustering.tokens_input == 0 && clustering.tokens_output == 0 {
        return;
    }
    let _ = store
        .record_usage(&UsageRecord {
            provider: llm.name().to_string(),
            model: llm.model_id().to_string(),
            operation: "chat".to_string(),
            tokens_input: clustering.tokens_input,
            tokens_output: clustering.tokens_output,
            cost_usd: clustering.cost_usd,
            latency_ms: None,
            success: true,
            error_message: None,
            metadata_json: Some(json!({"purpose": purpose, "strategy": clustering.strategy}).to_string()),
        })
        .await;
}

/// Project scope and cost for a digest without generating it.
pub async fn estimate_digest(store: &Store, days: i64, model: &str) -> Result<serde_json::Value> {
    let date_to = Utc::now();
    let date_from = date_to - Duration::days(days);
    let date_from_str = date_from.format("%Y-%m-%d").to_string();
    let date_to_str = date_to.format("%Y-%m-%d").to_string();

    let chunks = store
        .get_chunks_in_date_range(&date_from_str, &date_to_str, FETCH_LIMIT, None)
        .await?;

    let mut doc_ids: Vec<i64> = chunks.iter().map(|c| c.document_id).collect();
    doc_ids.sort_unstable();
    doc_ids.dedup();

    let mut estimate = crate::llm::estimate_digest_cost(chunks.len() as i64, model);
    if let Some(object) = estimate.as_object_mut() {
        object.insert("days".to_string(), json!(days));
        object.insert("date_from".to_string(), json!(date_from_str));
        object.insert("date_to".to_string(), json!(date_to_str));
        object.insert("docs_count".to_string(), json!(doc_ids.len()));
    }
    Ok(estimate)
}
