//! Job engine: shared status machine, typed events, and the generic
//! registry backing the four job kinds.
//!
//! Jobs move `pending → running → completed`, with `paused` and `failed` as
//! resumable detours and `cancelled`/`completed` terminal. Cancellation is
//! cooperative: runners poll the registry's view of their status at page,
//! item, and batch boundaries and return promptly; nothing is ever killed.
//!
//! Runners are async functions that push [`JobEvent`]s into an mpsc sender;
//! the HTTP layer wraps the receiving end into an SSE response.

pub mod embed;
pub mod fetch;
pub mod import;
pub mod pipeline;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

/// Shared job status machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> JobStatus {
        match s {
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "cancelled" => JobStatus::Cancelled,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }
}

/// Kinds of events emitted over the SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Progress,
    ItemSuccess,
    ItemFailed,
    ItemSkipped,
    ItemError,
    BatchComplete,
    Paused,
    Resumed,
    Completed,
    Failed,
    Cancelled,
    PhaseStart,
    PhaseProgress,
    PhaseComplete,
    PipelineComplete,
    PipelinePaused,
    PipelineCancelled,
    PipelineFailed,
    CostConfirm,
    Heartbeat,
    DigestComplete,
    DigestFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Started => "started",
            EventKind::Progress => "progress",
            EventKind::ItemSuccess => "item_success",
            EventKind::ItemFailed => "item_failed",
            EventKind::ItemSkipped => "item_skipped",
            EventKind::ItemError => "item_error",
            EventKind::BatchComplete => "batch_complete",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::Cancelled => "cancelled",
            EventKind::PhaseStart => "phase_start",
            EventKind::PhaseProgress => "phase_progress",
            EventKind::PhaseComplete => "phase_complete",
            EventKind::PipelineComplete => "pipeline_complete",
            EventKind::PipelinePaused => "pipeline_paused",
            EventKind::PipelineCancelled => "pipeline_cancelled",
            EventKind::PipelineFailed => "pipeline_failed",
            EventKind::CostConfirm => "cost_confirm",
            EventKind::Heartbeat => "heartbeat",
            EventKind::DigestComplete => "digest_complete",
            EventKind::DigestFailed => "digest_failed",
        }
    }
}

/// What an event is scoped to: a job id, or a pipeline/digest phase.
#[derive(Debug, Clone)]
pub enum EventScope {
    Job(String),
    Phase(String),
}

/// A typed event emitted by a job runner.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub kind: EventKind,
    pub scope: EventScope,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl JobEvent {
    pub fn job(kind: EventKind, job_id: &str, data: serde_json::Value) -> Self {
        JobEvent {
            kind,
            scope: EventScope::Job(job_id.to_string()),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn phase(kind: EventKind, phase: &str, data: serde_json::Value) -> Self {
        JobEvent {
            kind,
            scope: EventScope::Phase(phase.to_string()),
            timestamp: Utc::now(),
            data,
        }
    }

    /// Payload object: type, scope, timestamp, plus the event's data fields
    /// flattened in.
    pub fn payload(&self) -> serde_json::Value {
        let mut object = serde_json::Map::new();
        object.insert(
            "type".to_string(),
            serde_json::Value::String(self.kind.as_str().to_string()),
        );
        match &self.scope {
            EventScope::Job(id) => {
                object.insert("job_id".to_string(), serde_json::Value::String(id.clone()));
            }
            EventScope::Phase(phase) => {
                object.insert(
                    "phase".to_string(),
                    serde_json::Value::String(phase.clone()),
                );
            }
        }
        object.insert(
            "timestamp".to_string(),
            serde_json::Value::String(self.timestamp.to_rfc3339()),
        );
        if let serde_json::Value::Object(data) = &self.data {
            for (k, v) in data {
                object.insert(k.clone(), v.clone());
            }
        }
        serde_json::Value::Object(object)
    }

    /// Serialize as a server-sent-event frame.
    pub fn to_sse(&self) -> String {
        format!(
            "event: {}\ndata: {}\n\n",
            self.kind.as_str(),
            self.payload()
        )
    }
}

/// A persistable job row. Each job kind implements this once; the registry
/// handles the in-memory map and the lifecycle transitions.
#[async_trait]
pub trait JobRecord: Sized + Clone + Send + Sync + 'static {
    const TABLE: &'static str;

    fn id(&self) -> &str;
    fn status(&self) -> JobStatus;
    fn set_status(&mut self, status: JobStatus);
    fn touch(&mut self);
    fn started_at(&self) -> DateTime<Utc>;
    fn last_activity(&self) -> DateTime<Utc>;
    fn set_error(&mut self, error: Option<String>);

    fn from_row(row: &SqliteRow) -> Result<Self>;
    async fn persist(&self, pool: &SqlitePool) -> Result<()>;
}

/// Thread-safe in-memory job table backed by the store. Non-completed rows
/// are rehydrated on open so paused and failed jobs survive restarts.
pub struct JobRegistry<J: JobRecord> {
    pool: SqlitePool,
    jobs: Mutex<HashMap<String, J>>,
}

impl<J: JobRecord> JobRegistry<J> {
    /// Load every non-completed row into memory.
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} WHERE status != 'completed' ORDER BY started_at DESC",
            J::TABLE
        ))
        .fetch_all(&pool)
        .await?;

        let mut jobs = HashMap::new();
        for row in &rows {
            let job = J::from_row(row)?;
            jobs.insert(job.id().to_string(), job);
        }

        Ok(JobRegistry {
            pool,
            jobs: Mutex::new(jobs),
        })
    }

    /// Insert a freshly created job and persist it.
    pub async fn insert(&self, job: J) -> Result<()> {
        job.persist(&self.pool).await?;
        self.jobs.lock().await.insert(job.id().to_string(), job);
        Ok(())
    }

    pub async fn get(&self, job_id: &str) -> Option<J> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// Touch, persist, and refresh the in-memory copy.
    pub async fn update(&self, job: &mut J) -> Result<()> {
        job.touch();
        job.persist(&self.pool).await?;
        self.jobs
            .lock()
            .await
            .insert(job.id().to_string(), job.clone());
        Ok(())
    }

    /// Pause a running job. Returns the job if it was paused.
    pub async fn pause(&self, job_id: &str) -> Result<Option<J>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.status() != JobStatus::Running {
            return Ok(None);
        }
        job.set_status(JobStatus::Paused);
        job.touch();
        job.persist(&self.pool).await?;
        Ok(Some(job.clone()))
    }

    /// Cancel from any non-terminal state. Returns the job if cancelled.
    pub async fn cancel(&self, job_id: &str) -> Result<Option<J>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if job.status().is_terminal() {
            return Ok(None);
        }
        job.set_status(JobStatus::Cancelled);
        job.touch();
        job.persist(&self.pool).await?;
        Ok(Some(job.clone()))
    }

    /// Put a paused or failed job back to pending so the next stream
    /// subscription re-enters the runner at the persisted cursor.
    pub async fn resume(&self, job_id: &str) -> Result<Option<J>> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !matches!(job.status(), JobStatus::Paused | JobStatus::Failed) {
            return Ok(None);
        }
        job.set_status(JobStatus::Pending);
        job.set_error(None);
        job.touch();
        job.persist(&self.pool).await?;
        Ok(Some(job.clone()))
    }

    /// At most one job per kind runs at a time.
    pub async fn get_running(&self) -> Option<J> {
        self.jobs
            .lock()
            .await
            .values()
            .find(|j| j.status() == JobStatus::Running)
            .cloned()
    }

    /// Most recently active paused or failed job.
    pub async fn get_resumable(&self) -> Option<J> {
        let jobs = self.jobs.lock().await;
        let mut candidates: Vec<&J> = jobs
            .values()
            .filter(|j| matches!(j.status(), JobStatus::Paused | JobStatus::Failed))
            .collect();
        candidates.sort_by_key(|j| std::cmp::Reverse(j.last_activity()));
        candidates.first().map(|j| (*j).clone())
    }

    /// Recent jobs from the database, including completed ones.
    pub async fn list_recent(&self, limit: i64) -> Result<Vec<J>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM {} ORDER BY started_at DESC LIMIT ?",
            J::TABLE
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(J::from_row).collect()
    }

    /// Remove a job from memory and the database.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        self.jobs.lock().await.remove(job_id);
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", J::TABLE))
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Paused,
            JobStatus::Cancelled,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_sse_frame_format() {
        let event = JobEvent::job(
            EventKind::Progress,
            "job-1",
            serde_json::json!({"items_processed": 5}),
        );
        let frame = event.to_sse();
        assert!(frame.starts_with("event: progress\ndata: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"job_id\":\"job-1\""));
        assert!(frame.contains("\"items_processed\":5"));
    }

    #[test]
    fn test_phase_event_payload() {
        let event = JobEvent::phase(
            EventKind::PhaseStart,
            "import",
            serde_json::json!({"message": "starting"}),
        );
        let payload = event.payload();
        assert_eq!(payload["phase"], "import");
        assert_eq!(payload["type"], "phase_start");
        assert_eq!(payload["message"], "starting");
    }
}
