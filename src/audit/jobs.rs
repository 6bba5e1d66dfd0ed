//! Job-level transitions: accepted, started, terminal, summary.

use serde_json::Value;
use tracing::{debug, warn};

use super::{Applied, AuditWriter};
use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::model::JobState;

impl AuditWriter {
    /// Insert the job as queued, or merge into the existing row.
    pub(super) async fn accept_job(&self, event: &LifecycleEvent) -> Result<Applied> {
        let meta = Value::Object(event.meta.clone().unwrap_or_default());

        // jsonb || jsonb is a shallow merge with the right side winning.
        sqlx::query(
            "INSERT INTO jobs (job_id, producer_id, state, accepted_at, meta)
             VALUES ($1, $2, 'queued', $3, $4)
             ON CONFLICT (job_id) DO UPDATE SET
                producer_id = COALESCE(EXCLUDED.producer_id, jobs.producer_id),
                accepted_at = EXCLUDED.accepted_at,
                meta = jobs.meta || EXCLUDED.meta,
                updated_at = now()",
        )
        .bind(&event.job_id)
        .bind(&event.producer_id)
        .bind(event.ts)
        .bind(&meta)
        .execute(self.pool())
        .await?;

        Ok(Applied::Written)
    }

    /// queued → running. Anything else is left alone.
    pub(super) async fn start_job(&self, event: &LifecycleEvent) -> Result<Applied> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET state = 'running', started_at = $2,
                producer_id = COALESCE(producer_id, $3), updated_at = now()
             WHERE job_id = $1 AND state = 'queued'",
        )
        .bind(&event.job_id)
        .bind(event.ts)
        .bind(&event.producer_id)
        .execute(self.pool())
        .await?
        .rows_affected();

        if rows_affected > 0 {
            return Ok(Applied::Written);
        }
        self.classify_miss(event, JobState::Running).await
    }

    /// Move to succeeded, failed or canceled; stores the normalized result
    /// or the error, and the elapsed time since start.
    pub(super) async fn finish_job(&self, event: &LifecycleEvent) -> Result<Applied> {
        let Some(target) = event.kind.target_state() else {
            return Ok(Applied::Ignored);
        };

        let mut tx = self.pool().begin().await?;

        let row: Option<(Option<String>, String)> =
            sqlx::query_as("SELECT producer_id, state FROM jobs WHERE job_id = $1 FOR UPDATE")
                .bind(&event.job_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((stored_producer, state)) = row else {
            return Ok(Applied::UnknownJob);
        };
        let current: JobState = state.parse()?;
        if !current.can_transition_to(target) {
            log_blocked(event, current, target);
            return Ok(Applied::Ignored);
        }

        let producer_id = stored_producer.or_else(|| event.producer_id.clone());
        let (result, error) = match target {
            JobState::Succeeded => {
                let raw = event.result.clone().unwrap_or(Value::Null);
                let envelope = self.normalizer().normalize(
                    producer_id.as_deref().unwrap_or_default(),
                    true,
                    &raw,
                    None,
                );
                (Some(envelope.to_value()), None)
            }
            _ => (None, event.error.clone().map(Value::Object)),
        };

        sqlx::query(
            "UPDATE jobs SET state = $2, finished_at = $3, result = $4, error = $5,
                producer_id = $6,
                total_seconds = CASE
                    WHEN started_at IS NULL THEN NULL
                    ELSE GREATEST(0, EXTRACT(EPOCH FROM ($3 - started_at)))::double precision
                END,
                updated_at = now()
             WHERE job_id = $1",
        )
        .bind(&event.job_id)
        .bind(target.as_str())
        .bind(event.ts)
        .bind(&result)
        .bind(&error)
        .bind(&producer_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Applied::Written)
    }

    /// Attach the stage rollup. An explicit total replaces `total_seconds`;
    /// without one it is left untouched.
    pub(super) async fn attach_summary(&self, event: &LifecycleEvent) -> Result<Applied> {
        let rows_affected = sqlx::query(
            "UPDATE jobs SET
                stages = COALESCE($2, stages),
                stages_list = COALESCE($3, stages_list),
                total_seconds = COALESCE($4, total_seconds),
                updated_at = now()
             WHERE job_id = $1",
        )
        .bind(&event.job_id)
        .bind(&event.stages)
        .bind(&event.stages_list)
        .bind(event.total_seconds)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(if rows_affected > 0 {
            Applied::Written
        } else {
            Applied::UnknownJob
        })
    }

    /// Tell a missing job apart from one whose state blocked the update.
    async fn classify_miss(&self, event: &LifecycleEvent, target: JobState) -> Result<Applied> {
        let state: Option<(String,)> = sqlx::query_as("SELECT state FROM jobs WHERE job_id = $1")
            .bind(&event.job_id)
            .fetch_optional(self.pool())
            .await?;

        match state {
            None => Ok(Applied::UnknownJob),
            Some((state,)) => {
                log_blocked(event, state.parse()?, target);
                Ok(Applied::Ignored)
            }
        }
    }
}

fn log_blocked(event: &LifecycleEvent, current: JobState, target: JobState) {
    if current == target {
        debug!(job_id = %event.job_id, state = %current, "state re-affirmed, no-op");
    } else {
        warn!(
            job_id = %event.job_id,
            event_type = %event.kind,
            from = %current,
            to = %target,
            "out-of-order transition ignored"
        );
    }
}
