//! Audit schema bootstrap.
//!
//! Every statement is create-if-absent, so running the whole list again is
//! harmless. Concurrent `CREATE TABLE IF NOT EXISTS` still collides in the
//! catalog, so the list runs in one transaction holding an advisory lock
//! shared by every writer and process. The writer memoizes a successful run
//! for its lifetime.

use sqlx::PgPool;

use crate::error::Result;

/// Transaction-scoped advisory lock key serializing bootstraps.
pub(crate) const BOOTSTRAP_LOCK_KEY: i64 = 0x6a6f_6274_7261_696c;

pub(crate) const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobs (
        job_id          TEXT PRIMARY KEY,
        producer_id     TEXT,
        state           TEXT NOT NULL DEFAULT 'queued'
                        CHECK (state IN ('queued', 'running', 'succeeded', 'failed', 'canceled')),
        accepted_at     TIMESTAMPTZ,
        started_at      TIMESTAMPTZ,
        finished_at     TIMESTAMPTZ,
        total_seconds   DOUBLE PRECISION,
        meta            JSONB NOT NULL DEFAULT '{}'::jsonb,
        result          JSONB,
        error           JSONB,
        stages          JSONB,
        stages_list     JSONB,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_finished_at ON jobs (finished_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_producer ON jobs (producer_id)",
    "CREATE TABLE IF NOT EXISTS job_stages (
        id              BIGSERIAL PRIMARY KEY,
        job_id          TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
        name            TEXT NOT NULL,
        status          TEXT NOT NULL CHECK (status IN ('start', 'succeed', 'fail')),
        started_at      TIMESTAMPTZ,
        ended_at        TIMESTAMPTZ,
        duration_ms     BIGINT,
        meta            JSONB,
        error           JSONB,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_stages_job ON job_stages (job_id, id)",
    "CREATE TABLE IF NOT EXISTS job_events (
        id              BIGSERIAL PRIMARY KEY,
        job_id          TEXT NOT NULL REFERENCES jobs (job_id) ON DELETE CASCADE,
        event_type      TEXT NOT NULL,
        ts              TIMESTAMPTZ NOT NULL,
        payload         JSONB NOT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events (job_id, id)",
];

/// Create the audit tables and indexes if they are missing.
pub(crate) async fn bootstrap(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(BOOTSTRAP_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    for statement in STATEMENTS {
        sqlx::query(*statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    tracing::info!(statements = STATEMENTS.len(), "audit schema ready");
    Ok(())
}
