//! Audit writer: lifecycle events into durable job and stage rows.
//!
//! Owns a small Postgres pool, bootstraps its own schema on first use and
//! applies each event as an idempotent, per-field update. Storage failures
//! end here: [`AuditWriter::apply`] logs them and returns.

mod jobs;
mod query;
mod schema;
mod stages;

pub use stages::stage_window;

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, error, warn};

use crate::config::Config;
use crate::error::Result;
use crate::event::{EventType, LifecycleEvent};
use crate::normalize::Normalizer;
use crate::telemetry::job::{record_outcome, start_apply_span};
use crate::telemetry::metrics;

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Rows were inserted or updated.
    Written,
    /// No job row exists for the event's `jobId`; nothing was written.
    UnknownJob,
    /// The job is already past the transition, e.g. `job.started` after
    /// `job.succeeded`.
    Ignored,
}

impl Applied {
    pub fn as_str(self) -> &'static str {
        match self {
            Applied::Written => "written",
            Applied::UnknownJob => "unknown_job",
            Applied::Ignored => "ignored",
        }
    }
}

/// Translates lifecycle events into the `jobs`, `job_stages` and
/// `job_events` tables.
pub struct AuditWriter {
    pool: PgPool,
    /// Set once the schema bootstrap has succeeded.
    ready: OnceCell<()>,
    normalizer: Arc<Normalizer>,
    event_log: bool,
}

impl AuditWriter {
    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            ready: OnceCell::new(),
            normalizer: Arc::new(Normalizer::default()),
            event_log: false,
        }
    }

    /// Build a bounded pool without connecting; the first event connects.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)?;
        Ok(Self::from_pool(pool))
    }

    /// A writer when persistence is active, `None` when the sink should
    /// only log.
    pub fn from_config(config: &Config) -> Result<Option<Self>> {
        let Some(url) = config.database_url.as_ref().filter(|_| config.audit_enabled) else {
            return Ok(None);
        };
        let writer = Self::connect_lazy(url.expose_secret(), config.pool_size)?
            .with_event_log(config.event_log);
        Ok(Some(writer))
    }

    pub fn with_normalizer(mut self, normalizer: Arc<Normalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Also append every applied event to `job_events`.
    pub fn with_event_log(mut self, enabled: bool) -> Self {
        self.event_log = enabled;
        self
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Whether the schema bootstrap has completed in this process.
    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    /// Run the schema bootstrap once. A failure leaves the writer
    /// un-bootstrapped so the next call tries again.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                schema::bootstrap(&self.pool).await.inspect_err(|e| {
                    warn!(error = %e, "audit schema bootstrap failed, will retry on next event");
                })
            })
            .await?;
        Ok(())
    }

    /// Apply one event, best effort. Never returns an error.
    pub async fn apply(&self, event: &LifecycleEvent) {
        let span = start_apply_span(event.kind.as_str(), &event.job_id);
        let started = Instant::now();

        let outcome = match self.try_apply(event).instrument(span.clone()).await {
            Ok(applied) => {
                debug!(
                    parent: &span,
                    job_id = %event.job_id,
                    event_type = %event.kind,
                    outcome = applied.as_str(),
                    "audit event applied"
                );
                applied.as_str()
            }
            Err(e) => {
                error!(
                    parent: &span,
                    job_id = %event.job_id,
                    event_type = %event.kind,
                    error = %e,
                    "audit write failed, event dropped"
                );
                "error"
            }
        };
        record_outcome(&span, outcome);

        metrics::audit_writes().add(
            1,
            &[
                KeyValue::new("event_type", event.kind.as_str()),
                KeyValue::new("outcome", outcome),
            ],
        );
        metrics::apply_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("event_type", event.kind.as_str())],
        );
    }

    /// Apply one event and report what happened.
    pub async fn try_apply(&self, event: &LifecycleEvent) -> Result<Applied> {
        self.ensure_schema().await?;

        let applied = match event.kind {
            EventType::JobAccepted => self.accept_job(event).await?,
            EventType::JobStarted => self.start_job(event).await?,
            EventType::JobSucceeded | EventType::JobFailed | EventType::JobCanceled => {
                self.finish_job(event).await?
            }
            EventType::StageStart | EventType::StageSucceed | EventType::StageFail => {
                self.insert_stage(event).await?
            }
            EventType::JobSummary => self.attach_summary(event).await?,
        };

        if applied == Applied::UnknownJob {
            debug!(job_id = %event.job_id, event_type = %event.kind, "no job row, event dropped");
        } else if self.event_log {
            self.append_event(event).await?;
        }

        Ok(applied)
    }
}
