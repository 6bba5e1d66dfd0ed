//! Stage rows and the fine-grained event log. Both are append-only.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use super::{Applied, AuditWriter};
use crate::error::{Error, Result};
use crate::event::LifecycleEvent;
use crate::model::StageStatus;

/// `(started_at, ended_at)` for a stage event logged at `ts`.
///
/// A start opens at `ts`. A terminal status ends at `ts` and started
/// `duration_ms` earlier, or at `ts` itself when the duration is unknown.
pub fn stage_window(
    status: StageStatus,
    ts: DateTime<Utc>,
    duration_ms: Option<i64>,
) -> (DateTime<Utc>, Option<DateTime<Utc>>) {
    if !status.is_terminal() {
        return (ts, None);
    }
    let started_at = duration_ms
        .filter(|d| *d >= 0)
        .and_then(Duration::try_milliseconds)
        .and_then(|d| ts.checked_sub_signed(d))
        .unwrap_or(ts);
    (started_at, Some(ts))
}

impl AuditWriter {
    /// Insert a stage row, only under an existing job.
    pub(super) async fn insert_stage(&self, event: &LifecycleEvent) -> Result<Applied> {
        let status = event
            .kind
            .stage_status()
            .ok_or_else(|| Error::MalformedEvent(format!("{} is not a stage event", event.kind)))?;
        let name = event
            .stage
            .as_deref()
            .ok_or_else(|| Error::MalformedEvent(format!("{} without stage name", event.kind)))?;
        let (started_at, ended_at) = stage_window(status, event.ts, event.duration_ms);

        let rows_affected = sqlx::query(
            "INSERT INTO job_stages (job_id, name, status, started_at, ended_at, duration_ms, meta, error)
             SELECT $1::text, $2::text, $3::text, $4::timestamptz, $5::timestamptz, $6::bigint, $7::jsonb, $8::jsonb
             WHERE EXISTS (SELECT 1 FROM jobs WHERE job_id = $1::text)",
        )
        .bind(&event.job_id)
        .bind(name)
        .bind(status.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(event.duration_ms)
        .bind(event.meta.clone().map(Value::Object))
        .bind(event.error.clone().map(Value::Object))
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(if rows_affected > 0 {
            Applied::Written
        } else {
            Applied::UnknownJob
        })
    }

    /// Record the event itself in `job_events`.
    pub(super) async fn append_event(&self, event: &LifecycleEvent) -> Result<()> {
        let payload = serde_json::to_value(event)?;
        sqlx::query(
            "INSERT INTO job_events (job_id, event_type, ts, payload)
             SELECT $1::text, $2::text, $3::timestamptz, $4::jsonb
             WHERE EXISTS (SELECT 1 FROM jobs WHERE job_id = $1::text)",
        )
        .bind(&event.job_id)
        .bind(event.kind.as_str())
        .bind(event.ts)
        .bind(&payload)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn terminal_stage_starts_duration_before_end() {
        let (started, ended) = stage_window(StageStatus::Succeed, at(1_000), Some(2_500));
        assert_eq!(ended, Some(at(1_000)));
        assert_eq!(started, at(1_000) - Duration::milliseconds(2_500));
    }

    #[test]
    fn terminal_stage_without_duration_is_instant() {
        let (started, ended) = stage_window(StageStatus::Fail, at(50), None);
        assert_eq!(started, at(50));
        assert_eq!(ended, Some(at(50)));
    }

    #[test]
    fn start_stage_has_no_end() {
        let (started, ended) = stage_window(StageStatus::Start, at(7), Some(100));
        assert_eq!(started, at(7));
        assert!(ended.is_none());
    }
}
