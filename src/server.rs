//! HTTP API server.
//!
//! JSON endpoints for search, documents, stats, prompts, and settings, plus
//! the job surface: `POST .../start` creates a job, `GET .../{id}/stream`
//! attaches an SSE stream and (for pending jobs) launches the runner, and
//! `POST .../{id}/pause|resume|cancel` drive the lifecycle. Only one job per
//! kind runs at a time; starting a second returns the running job's id.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "unknown mode" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::digest::{estimate_digest, run_digest, DigestJob, DigestJobStore};
use crate::embedding;
use crate::jobs::embed::{run_embed_job, EmbedJob};
use crate::jobs::fetch::{run_fetch_job, FetchJob};
use crate::jobs::import::{run_import_job, ImportJob};
use crate::jobs::pipeline::{run_pipeline, PipelineContext, PipelineJob, LAST_SYNC_KEY};
use crate::jobs::{JobEvent, JobRegistry, JobStatus};
use crate::llm;
use crate::prompts;
use crate::reader::ReaderClient;
use crate::search::{library_search, LibraryParams, SearchMode, SortDir, SortKey};
use crate::store::{Store, UsagePeriod};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub config: Arc<Config>,
    pub import_jobs: Arc<JobRegistry<ImportJob>>,
    pub fetch_jobs: Arc<JobRegistry<FetchJob>>,
    pub embed_jobs: Arc<JobRegistry<EmbedJob>>,
    pub pipeline_jobs: Arc<JobRegistry<PipelineJob>>,
    pub digest_jobs: Arc<DigestJobStore>,
}

impl AppState {
    pub async fn new(store: Store, config: Arc<Config>) -> anyhow::Result<AppState> {
        let pool = store.pool().clone();
        Ok(AppState {
            store,
            config,
            import_jobs: Arc::new(JobRegistry::open(pool.clone()).await?),
            fetch_jobs: Arc::new(JobRegistry::open(pool.clone()).await?),
            embed_jobs: Arc::new(JobRegistry::open(pool.clone()).await?),
            pipeline_jobs: Arc::new(JobRegistry::open(pool).await?),
            digest_jobs: Arc::new(DigestJobStore::new()),
        })
    }
}

/// Start the HTTP server on the configured bind address.
pub async fn run_server(store: Store, config: Arc<Config>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState::new(store, config).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/library", get(handle_library))
        .route("/documents/{id}", get(handle_document))
        .route("/readwise/import/start", post(handle_import_start))
        .route("/readwise/import/jobs", get(handle_import_jobs))
        .route("/readwise/import/resumable", get(handle_import_resumable))
        .route("/readwise/import/{id}/stream", get(handle_import_stream))
        .route("/readwise/import/{id}/pause", post(handle_import_pause))
        .route("/readwise/import/{id}/resume", post(handle_import_resume))
        .route("/readwise/import/{id}/cancel", post(handle_import_cancel))
        .route("/api/fetch/start", post(handle_fetch_start))
        .route("/api/fetch/stats", get(handle_fetch_stats))
        .route("/api/fetch/retry-failed", post(handle_fetch_retry_failed))
        .route("/api/fetch/{id}/stream", get(handle_fetch_stream))
        .route("/api/fetch/{id}/pause", post(handle_fetch_pause))
        .route("/api/fetch/{id}/resume", post(handle_fetch_resume))
        .route("/api/fetch/{id}/cancel", post(handle_fetch_cancel))
        .route("/api/embed/start", post(handle_embed_start))
        .route("/api/embed/stats", get(handle_embed_stats))
        .route("/api/embed/cleanup-orphans", post(handle_embed_cleanup))
        .route("/api/embed/{id}/stream", get(handle_embed_stream))
        .route("/api/embed/{id}/pause", post(handle_embed_pause))
        .route("/api/embed/{id}/resume", post(handle_embed_resume))
        .route("/api/embed/{id}/cancel", post(handle_embed_cancel))
        .route("/api/pipeline/start", post(handle_pipeline_start))
        .route("/api/pipeline/{id}/stream", get(handle_pipeline_stream))
        .route("/api/pipeline/{id}/pause", post(handle_pipeline_pause))
        .route("/api/pipeline/{id}/resume", post(handle_pipeline_resume))
        .route("/api/pipeline/{id}/cancel", post(handle_pipeline_cancel))
        .route("/api/providers/health", get(handle_providers_health))
        .route("/api/usage/stats", get(handle_usage_stats))
        .route("/api/digests/generate", post(handle_digest_generate))
        .route("/api/digests", get(handle_digest_list))
        .route("/api/digests/estimate", get(handle_digest_estimate))
        .route("/api/prompts", get(handle_prompt_list))
        .route(
            "/api/prompts/{key}",
            get(handle_prompt_get)
                .put(handle_prompt_put)
                .delete(handle_prompt_delete),
        )
        .route(
            "/api/settings/{key}",
            get(handle_setting_get).put(handle_setting_put),
        )
        .route("/api/chunking/info", get(handle_chunking_info))
        .layer(cors)
        .with_state(state);

    tracing::info!(bind = %bind_addr, "API server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: "conflict".to_string(),
        message: message.into(),
    }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

// ============ SSE plumbing ============

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

fn event_stream(rx: mpsc::Receiver<JobEvent>) -> Response {
    let stream: EventStream = ReceiverStream::new(rx)
        .map(|event| {
            Ok(Event::default()
                .event(event.kind.as_str())
                .data(event.payload().to_string()))
        })
        .boxed();
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn error_stream(message: impl Into<String>) -> Response {
    let message = message.into();
    let stream: EventStream =
        stream::once(async move { Ok(Event::default().event("error").data(message)) }).boxed();
    Sse::new(stream).into_response()
}

fn event_channel() -> (mpsc::Sender<JobEvent>, mpsc::Receiver<JobEvent>) {
    mpsc::channel(64)
}

// ============ GET /health ============

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

// ============ GET /library ============

#[derive(Deserialize, Default)]
struct LibraryQuery {
    #[serde(default)]
    q: String,
    mode: Option<String>,
    search_fulltext: Option<bool>,
    search_highlights: Option<bool>,
    categories: Option<String>,
    sort_by: Option<String>,
    sort_dir: Option<String>,
    limit: Option<i64>,
}

async fn handle_library(
    State(state): State<AppState>,
    Query(query): Query<LibraryQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mode = match query.mode.as_deref() {
        None => SearchMode::Lexical,
        Some(m) => SearchMode::parse(m)
            .ok_or_else(|| bad_request(format!("Unknown search mode: {}. Use fts or semantic.", m)))?,
    };

    let sort_by = match query.sort_by.as_deref() {
        Some(s) => SortKey::parse(s),
        None if mode == SearchMode::Semantic => SortKey::Relevance,
        None => SortKey::SavedAt,
    };

    let params = LibraryParams {
        query: query.q,
        mode,
        search_fulltext: query.search_fulltext.unwrap_or(true),
        highlights_only: query.search_highlights.unwrap_or(false),
        categories: query
            .categories
            .map(|c| {
                c.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        sort_by,
        sort_dir: query
            .sort_dir
            .as_deref()
            .map(SortDir::parse)
            .unwrap_or(SortDir::Desc),
        limit: query.limit.unwrap_or(50).clamp(1, 500),
    };

    let results = library_search(&state.store, &state.config, &params)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({"results": results})))
}

// ============ GET /documents/{id} ============

async fn handle_document(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let doc = state
        .store
        .get_document(id)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("document {} not found", id)))?;

    let highlights = state
        .store
        .get_highlights(id)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({"doc": doc, "highlights": highlights})))
}

// ============ Import job handlers ============

async fn handle_import_start(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.config.reading_service_token().is_none() {
        return Err(bad_request("READWISE_TOKEN not set"));
    }

    if let Some(running) = state.import_jobs.get_running().await {
        return Ok(Json(json!({"job_id": running.id, "already_running": true})));
    }

    let job = ImportJob::new();
    let job_id = job.id.clone();
    state
        .import_jobs
        .insert(job)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({"job_id": job_id})))
}

async fn handle_import_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(job) = state.import_jobs.get(&id).await else {
        return error_stream(format!("job {} not found", id));
    };
    if job.status != JobStatus::Pending {
        return error_stream(format!("job is {}, not pending", job.status.as_str()));
    }

    let Some(token) = state.config.reading_service_token() else {
        return error_stream("READWISE_TOKEN not set");
    };
    let client = match ReaderClient::new(&state.config.reading_service.base_url, &token) {
        Ok(client) => client,
        Err(e) => return error_stream(e.to_string()),
    };

    let updated_after = state
        .store
        .get_setting(LAST_SYNC_KEY)
        .await
        .unwrap_or(None);

    let (tx, rx) = event_channel();
    tokio::spawn(run_import_job(
        state.store.clone(),
        client,
        state.import_jobs.clone(),
        id,
        updated_after,
        tx,
    ));

    event_stream(rx)
}

async fn handle_import_jobs(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let jobs = state
        .import_jobs
        .list_recent(10)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    let jobs: Vec<serde_json::Value> = jobs.iter().map(|j| j.to_json()).collect();
    Ok(Json(json!({"jobs": jobs})))
}

async fn handle_import_resumable(
    State(state): State<AppState>,
) -> Json<serde_json::Value> {
    let job = state.import_jobs.get_resumable().await;
    Json(json!({"job": job.map(|j| j.to_json())}))
}

async fn handle_import_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.import_jobs.pause(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not running")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_import_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.import_jobs.resume(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not paused or failed")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_import_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.import_jobs.cancel(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is already terminal")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

// ============ Fetch job handlers ============

async fn handle_fetch_start(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Some(running) = state.fetch_jobs.get_running().await {
        return Ok(Json(json!({"job_id": running.id, "already_running": true})));
    }

    let total = state
        .store
        .count_documents_for_fetch()
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    let job = FetchJob::new(Some(total));
    let job_id = job.id.clone();
    state
        .fetch_jobs
        .insert(job)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({"job_id": job_id, "items_total": total})))
}

async fn handle_fetch_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(job) = state.fetch_jobs.get(&id).await else {
        return error_stream(format!("job {} not found", id));
    };
    if job.status != JobStatus::Pending {
        return error_stream(format!("job is {}, not pending", job.status.as_str()));
    }

    let (tx, rx) = event_channel();
    tokio::spawn(run_fetch_job(
        state.store.clone(),
        state.fetch_jobs.clone(),
        id,
        tx,
    ));

    event_stream(rx)
}

async fn handle_fetch_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let stats = state
        .store
        .fetch_stats()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

async fn handle_fetch_retry_failed(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let cleared = state
        .store
        .clear_retriable_failures()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"cleared": cleared})))
}

async fn handle_fetch_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.fetch_jobs.pause(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not running")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_fetch_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.fetch_jobs.resume(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not paused or failed")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_fetch_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.fetch_jobs.cancel(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is already terminal")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

// ============ Embed job handlers ============

#[derive(Deserialize, Default)]
struct EmbedStartRequest {
    provider: Option<String>,
    model: Option<String>,
}

async fn handle_embed_start(
    State(state): State<AppState>,
    body: Option<Json<EmbedStartRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let provider = request
        .provider
        .unwrap_or_else(|| state.config.embedding.provider.clone());
    let model = request
        .model
        .unwrap_or_else(|| state.config.embedding.model.clone());

    if embedding::model_info(&provider, &model).is_none() {
        return Err(bad_request(format!(
            "unknown provider/model: {}/{}",
            provider, model
        )));
    }

    if let Some(running) = state.embed_jobs.get_running().await {
        return Ok(Json(json!({"job_id": running.id, "already_running": true})));
    }

    let counts = state
        .store
        .count_chunks_for_embedding(&provider, &model)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    let job = EmbedJob::new(Some(counts.pending), &provider, &model);
    let job_id = job.id.clone();
    state
        .embed_jobs
        .insert(job)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({
        "job_id": job_id,
        "items_total": counts.pending,
        "provider": provider,
        "model": model,
    })))
}

async fn handle_embed_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Some(job) = state.embed_jobs.get(&id).await else {
        return error_stream(format!("job {} not found", id));
    };
    if job.status != JobStatus::Pending {
        return error_stream(format!("job is {}, not pending", job.status.as_str()));
    }

    let (tx, rx) = event_channel();
    tokio::spawn(run_embed_job(
        state.store.clone(),
        state.embed_jobs.clone(),
        id,
        state.config.embedding.batch_size,
        tx,
    ));

    event_stream(rx)
}

#[derive(Deserialize)]
struct EmbedStatsQuery {
    provider: Option<String>,
    model: Option<String>,
}

async fn handle_embed_stats(
    State(state): State<AppState>,
    Query(query): Query<EmbedStatsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let provider = query
        .provider
        .unwrap_or_else(|| state.config.embedding.provider.clone());
    let model = query
        .model
        .unwrap_or_else(|| state.config.embedding.model.clone());

    let counts = state
        .store
        .count_chunks_for_embedding(&provider, &model)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    let mut vector_rows = serde_json::Map::new();
    if state.store.vector_enabled() {
        for dims in crate::migrate::SUPPORTED_DIMS {
            let count = state
                .store
                .count_vector_rows(dims)
                .await
                .map_err(|e| internal_error(e.to_string()))?;
            vector_rows.insert(dims.to_string(), json!(count));
        }
    }

    Ok(Json(json!({
        "provider": provider,
        "model": model,
        "total": counts.total,
        "embedded": counts.embedded,
        "pending": counts.pending,
        "orphaned": counts.orphaned,
        "vector_rows": vector_rows,
    })))
}

async fn handle_embed_cleanup(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = state
        .store
        .cleanup_orphan_embeddings()
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"removed": removed})))
}

async fn handle_embed_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.embed_jobs.pause(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not running")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_embed_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.embed_jobs.resume(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not paused or failed")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_embed_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.embed_jobs.cancel(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is already terminal")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

// ============ Pipeline handlers ============

#[derive(Deserialize, Default)]
struct PipelineStartRequest {
    #[serde(default)]
    skip_import: bool,
}

async fn handle_pipeline_start(
    State(state): State<AppState>,
    body: Option<Json<PipelineStartRequest>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();

    if !request.skip_import && state.config.reading_service_token().is_none() {
        return Err(bad_request("READWISE_TOKEN not set"));
    }

    if let Some(running) = state.pipeline_jobs.get_running().await {
        return Ok(Json(json!({"job_id": running.id, "already_running": true})));
    }

    let job = PipelineJob::new();
    let job_id = job.id.clone();
    state
        .pipeline_jobs
        .insert(job)
        .await
        .map_err(|e| internal_error(e.to_string()))?;

    Ok(Json(json!({"job_id": job_id, "skip_import": request.skip_import})))
}

#[derive(Deserialize, Default)]
struct PipelineStreamQuery {
    #[serde(default)]
    skip_import: bool,
}

async fn handle_pipeline_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PipelineStreamQuery>,
) -> Response {
    let Some(job) = state.pipeline_jobs.get(&id).await else {
        return error_stream(format!("job {} not found", id));
    };
    if job.status != JobStatus::Pending {
        return error_stream(format!("job is {}, not pending", job.status.as_str()));
    }

    let ctx = PipelineContext {
        pipeline_jobs: state.pipeline_jobs.clone(),
        import_jobs: state.import_jobs.clone(),
        embed_jobs: state.embed_jobs.clone(),
    };

    let (tx, rx) = event_channel();
    tokio::spawn(run_pipeline(
        state.store.clone(),
        state.config.clone(),
        ctx,
        id,
        query.skip_import,
        tx,
    ));

    event_stream(rx)
}

async fn handle_pipeline_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.pipeline_jobs.pause(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not running")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_pipeline_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.pipeline_jobs.resume(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is not paused or failed")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

async fn handle_pipeline_cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.pipeline_jobs.cancel(&id).await {
        Ok(Some(job)) => Ok(Json(json!({"status": job.status.as_str()}))),
        Ok(None) => Err(conflict("job is already terminal")),
        Err(e) => Err(internal_error(e.to_string())),
    }
}

// ============ Providers health ============

async fn handle_providers_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut checks = Vec::new();

    match embedding::create_provider("openai", Some(&state.config.embedding.model))
        .or_else(|_| embedding::create_provider("openai", None))
    {
        Ok(provider) => checks.push(provider.health_check().await),
        Err(e) => tracing::warn!(error = %e, "could not build openai embedding provider"),
    }

    if let Ok(provider) = embedding::create_provider("ollama", None) {
        checks.push(provider.health_check().await);
    }

    let chat = match llm::create_chat_provider(Some(&state.config.digest.model)) {
        Ok(provider) => Some(provider.health_check().await),
        Err(_) => None,
    };

    Json(json!({"embedding": checks, "chat": chat}))
}

// ============ Usage ============

#[derive(Deserialize)]
struct UsageQuery {
    period: Option<String>,
}

async fn handle_usage_stats(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let period = match query.period.as_deref() {
        None => UsagePeriod::Week,
        Some(p) => UsagePeriod::parse(p)
            .ok_or_else(|| bad_request("period must be today, week, month, or all"))?,
    };

    let stats = state
        .store
        .usage_stats(period)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ============ Digests ============

#[derive(Deserialize, Default)]
struct DigestGenerateRequest {
    strategy: Option<String>,
    model: Option<String>,
    days: Option<i64>,
}

async fn handle_digest_generate(
    State(state): State<AppState>,
    body: Option<Json<DigestGenerateRequest>>,
) -> Response {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let strategy = request.strategy.unwrap_or_else(|| "hybrid".to_string());
    if strategy != "hybrid" && strategy != "pure_llm" {
        return error_stream(format!("unknown strategy: {}", strategy));
    }
    let model = request
        .model
        .unwrap_or_else(|| state.config.digest.model.clone());
    let days = request.days.unwrap_or(state.config.digest.days).max(1);

    if state.digest_jobs.get_running().await.is_some() {
        return error_stream("a digest job is already running");
    }

    let llm = match llm::create_chat_provider(Some(&model)) {
        Ok(provider) => provider,
        Err(e) => return error_stream(e.to_string()),
    };

    let job = DigestJob::new(&strategy, &model, days);
    let job_id = job.id.clone();
    state.digest_jobs.insert(job).await;

    let (tx, rx) = event_channel();
    tokio::spawn(run_digest(
        state.store.clone(),
        llm,
        state.digest_jobs.clone(),
        job_id,
        state.config.embedding.provider.clone(),
        state.config.embedding.model.clone(),
        tx,
    ));

    event_stream(rx)
}

async fn handle_digest_list(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let digests = state
        .store
        .list_digests(20)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"digests": digests})))
}

#[derive(Deserialize)]
struct DigestEstimateQuery {
    days: Option<i64>,
    model: Option<String>,
}

async fn handle_digest_estimate(
    State(state): State<AppState>,
    Query(query): Query<DigestEstimateQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let days = query.days.unwrap_or(state.config.digest.days).max(1);
    let model = query
        .model
        .unwrap_or_else(|| state.config.digest.model.clone());

    let estimate = estimate_digest(&state.store, days, &model)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(estimate))
}

// ============ Prompts ============

async fn handle_prompt_list(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let prompts = prompts::list_prompts(&state.store)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"prompts": prompts})))
}

async fn handle_prompt_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let prompt = prompts::get_prompt(&state.store, &key)
        .await
        .map_err(|e| internal_error(e.to_string()))?
        .ok_or_else(|| not_found(format!("unknown prompt key: {}", key)))?;
    Ok(Json(serde_json::to_value(prompt).unwrap_or_default()))
}

#[derive(Deserialize)]
struct PromptPutRequest {
    template: String,
    temperature: f64,
    max_tokens: i64,
}

async fn handle_prompt_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<PromptPutRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let saved = prompts::save_prompt(
        &state.store,
        &key,
        &request.template,
        request.temperature,
        request.max_tokens,
    )
    .await
    .map_err(|e| internal_error(e.to_string()))?;

    if !saved {
        return Err(not_found(format!("unknown prompt key: {}", key)));
    }
    Ok(Json(json!({"saved": true})))
}

async fn handle_prompt_delete(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let reset = prompts::reset_prompt(&state.store, &key)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    if !reset {
        return Err(not_found(format!("unknown prompt key: {}", key)));
    }
    Ok(Json(json!({"reset": true})))
}

// ============ Settings ============

async fn handle_setting_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let value = state
        .store
        .get_setting(&key)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"key": key, "value": value})))
}

#[derive(Deserialize)]
struct SettingPutRequest {
    value: String,
}

async fn handle_setting_put(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(request): Json<SettingPutRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    state
        .store
        .set_setting(&key, &request.value)
        .await
        .map_err(|e| internal_error(e.to_string()))?;
    Ok(Json(json!({"key": key, "value": request.value})))
}

// ============ Chunking info ============

async fn handle_chunking_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let chunking = &state.config.chunking;
    Json(json!({
        "chunk_size": chunking.chunk_size,
        "chunk_size_tokens": chunking.chunk_size / 4,
        "chunk_overlap": chunking.chunk_overlap,
        "chunk_overlap_percent": (chunking.chunk_overlap as f64 / chunking.chunk_size as f64 * 100.0).round() as i64,
        "min_chunk_size": chunking.min_chunk_size,
    }))
}
