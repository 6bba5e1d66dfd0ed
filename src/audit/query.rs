//! Read side and administration: job lookups, listings, purge.

use chrono::{DateTime, Utc};
use tracing::warn;

use super::AuditWriter;
use crate::error::{Error, Result};
use crate::model::{EventRecord, JobFilter, JobRecord, PurgeReport, StageRecord, TableCounts};

const JOB_COLUMNS: &str = "job_id, producer_id, state, accepted_at, started_at, finished_at, total_seconds, meta, result, error, stages, stages_list";

impl AuditWriter {
    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool()).await?;
        Ok(())
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: &str) -> Result<JobRecord> {
        self.ensure_schema().await?;
        let row: Option<JobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
                .bind(job_id)
                .fetch_optional(self.pool())
                .await?;

        row.ok_or_else(|| Error::NotFound(job_id.to_string()))?
            .try_into_record()
    }

    /// Most recently accepted jobs first.
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>> {
        self.ensure_schema().await?;
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE ($1::text IS NULL OR state = $1)
             AND ($2::text IS NULL OR producer_id = $2)
             ORDER BY accepted_at DESC NULLS LAST, job_id
             LIMIT $3"
        ))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.producer_id.as_deref())
        .bind(filter.limit.max(0))
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(JobRow::try_into_record).collect()
    }

    /// Stage history of a job, in insertion order.
    pub async fn list_stages(&self, job_id: &str) -> Result<Vec<StageRecord>> {
        self.ensure_schema().await?;
        let rows: Vec<StageRow> = sqlx::query_as(
            "SELECT id, job_id, name, status, started_at, ended_at, duration_ms, meta, error
             FROM job_stages WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(StageRow::try_into_record).collect()
    }

    /// Fine-grained event log of a job, in insertion order.
    pub async fn list_events(&self, job_id: &str) -> Result<Vec<EventRecord>> {
        self.ensure_schema().await?;
        let rows: Vec<(i64, String, String, DateTime<Utc>, serde_json::Value)> = sqlx::query_as(
            "SELECT id, job_id, event_type, ts, payload FROM job_events WHERE job_id = $1 ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, job_id, event_type, ts, payload)| EventRecord {
                id,
                job_id,
                event_type,
                ts,
                payload,
            })
            .collect())
    }

    pub async fn counts(&self) -> Result<TableCounts> {
        self.ensure_schema().await?;
        let (jobs, stages, events): (i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT count(*) FROM jobs),
                    (SELECT count(*) FROM job_stages),
                    (SELECT count(*) FROM job_events)",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(TableCounts {
            jobs: jobs as u64,
            stages: stages as u64,
            events: events as u64,
        })
    }

    /// Delete every job, stage and event row. Irreversible, no filters.
    ///
    /// The tables are locked for the transaction and children are deleted
    /// before jobs, so the counts reflect each table rather than what the
    /// cascade removed.
    pub async fn purge(&self) -> Result<PurgeReport> {
        self.ensure_schema().await?;
        let mut tx = self.pool().begin().await?;
        sqlx::query("LOCK TABLE jobs, job_stages, job_events IN ACCESS EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let events = sqlx::query("DELETE FROM job_events")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let stages = sqlx::query("DELETE FROM job_stages")
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let jobs = sqlx::query("DELETE FROM jobs")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;

        warn!(jobs, stages, events, "audit tables purged");
        Ok(PurgeReport {
            jobs,
            stages,
            events,
        })
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    producer_id: Option<String>,
    state: String,
    accepted_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    total_seconds: Option<f64>,
    meta: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
    stages: Option<serde_json::Value>,
    stages_list: Option<serde_json::Value>,
}

impl JobRow {
    fn try_into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            job_id: self.job_id,
            producer_id: self.producer_id,
            state: self.state.parse()?,
            accepted_at: self.accepted_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            total_seconds: self.total_seconds,
            meta: self.meta,
            result: self.result,
            error: self.error,
            stages: self.stages,
            stages_list: self.stages_list,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: i64,
    job_id: String,
    name: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    meta: Option<serde_json::Value>,
    error: Option<serde_json::Value>,
}

impl StageRow {
    fn try_into_record(self) -> Result<StageRecord> {
        Ok(StageRecord {
            id: self.id,
            job_id: self.job_id,
            name: self.name,
            status: self.status.parse()?,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_ms: self.duration_ms,
            meta: self.meta,
            error: self.error,
        })
    }
}
