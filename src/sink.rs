//! Event sink: the process-wide entry point for lifecycle events.
//!
//! [`EventSink::record`] validates and clips an event, writes one log line
//! for it, and, when persistence is active, hands it to the audit writer
//! through a bounded queue. The caller only ever waits for the enqueue.
//!
//! Events are sharded by `jobId` across a fixed set of worker tasks, so
//! one job's events are applied in the order they were recorded while
//! other jobs proceed in parallel.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::audit::AuditWriter;
use crate::config::{self, Config};
use crate::error::Result;
use crate::event::LifecycleEvent;
use crate::telemetry::metrics;

/// Soft limits applied to free text before logging and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_meta_chars: usize,
    /// Applies to `error.stack` only.
    pub max_err_stack_chars: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_meta_chars: config::DEFAULT_MAX_META_CHARS,
            max_err_stack_chars: config::DEFAULT_MAX_ERR_STACK_CHARS,
        }
    }
}

impl Limits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_meta_chars: config.max_meta_chars,
            max_err_stack_chars: config.max_err_stack_chars,
        }
    }
}

/// Shape of the dispatch queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub workers: usize,
    /// Per worker.
    pub queue_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: config::DEFAULT_WORKERS,
            queue_capacity: config::DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Why an event went no further than the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Malformed(String),
    QueueClosed,
}

/// What `record` did with an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Dropped(DropReason),
    /// Logged; persistence is off.
    Logged,
    /// Logged and queued for the audit writer.
    Queued,
}

struct Dispatcher {
    shards: Vec<mpsc::Sender<LifecycleEvent>>,
    workers: Vec<JoinHandle<()>>,
}

pub struct EventSink {
    limits: Limits,
    dispatcher: Option<Dispatcher>,
}

impl EventSink {
    /// A sink that only logs.
    pub fn logger_only(limits: Limits) -> Self {
        Self {
            limits,
            dispatcher: None,
        }
    }

    /// A sink forwarding to `writer`. Spawns the workers, so it must be
    /// called inside a Tokio runtime.
    pub fn with_writer(limits: Limits, writer: Arc<AuditWriter>, dispatch: DispatchConfig) -> Self {
        let workers = dispatch.workers.max(1);
        let mut shards = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::channel(dispatch.queue_capacity.max(1));
            shards.push(tx);
            handles.push(tokio::spawn(drain(Arc::clone(&writer), rx)));
        }
        Self {
            limits,
            dispatcher: Some(Dispatcher {
                shards,
                workers: handles,
            }),
        }
    }

    /// Build the sink the configuration asks for.
    pub fn from_config(config: &Config) -> Result<Self> {
        let limits = Limits::from_config(config);
        Ok(match AuditWriter::from_config(config)? {
            Some(writer) => Self::with_writer(
                limits,
                Arc::new(writer),
                DispatchConfig {
                    workers: config.workers,
                    queue_capacity: config.queue_capacity,
                },
            ),
            None => Self::logger_only(limits),
        })
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn persists(&self) -> bool {
        self.dispatcher.is_some()
    }

    /// Record a raw event mapping. Never fails; see [`Disposition`].
    pub async fn record(&self, raw: Value) -> Disposition {
        match LifecycleEvent::from_value(raw) {
            Ok(event) => self.record_event(event).await,
            Err(e) => {
                warn!(target: "jobtrail::event", error = %e, "dropping malformed lifecycle event");
                metrics::events_dropped().add(1, &[KeyValue::new("reason", "malformed")]);
                Disposition::Dropped(DropReason::Malformed(e.to_string()))
            }
        }
    }

    /// Record an already-validated event.
    pub async fn record_event(&self, mut event: LifecycleEvent) -> Disposition {
        clip_event(&mut event, &self.limits);
        log_event(&event, &self.limits);
        metrics::events_recorded().add(1, &[KeyValue::new("event_type", event.kind.as_str())]);

        let Some(dispatcher) = &self.dispatcher else {
            return Disposition::Logged;
        };
        let shard = shard_for(&event.job_id, dispatcher.shards.len());
        let job_id = event.job_id.clone();
        match dispatcher.shards[shard].send(event).await {
            Ok(()) => Disposition::Queued,
            Err(_) => {
                warn!(job_id = %job_id, "audit queue closed, event not persisted");
                metrics::events_dropped().add(1, &[KeyValue::new("reason", "queue_closed")]);
                Disposition::Dropped(DropReason::QueueClosed)
            }
        }
    }

    /// Stop accepting events, then wait until everything queued is applied.
    pub async fn close(self) {
        let Some(dispatcher) = self.dispatcher else {
            return;
        };
        drop(dispatcher.shards);
        for worker in dispatcher.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "audit worker ended abnormally");
            }
        }
    }
}

async fn drain(writer: Arc<AuditWriter>, mut rx: mpsc::Receiver<LifecycleEvent>) {
    while let Some(event) = rx.recv().await {
        writer.apply(&event).await;
    }
}

fn shard_for(job_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    job_id.hash(&mut hasher);
    (hasher.finish() % shards.max(1) as u64) as usize
}

fn log_event(event: &LifecycleEvent, limits: &Limits) {
    let meta = event
        .meta
        .as_ref()
        .and_then(|m| serde_json::to_string(m).ok())
        .map(|s| clip(&s, limits.max_meta_chars).unwrap_or(s));

    if event.kind.is_failure() {
        warn!(
            target: "jobtrail::event",
            event_type = %event.kind,
            job_id = %event.job_id,
            producer = event.producer_id.as_deref(),
            stage = event.stage.as_deref(),
            duration_ms = event.duration_ms,
            meta = meta.as_deref(),
            error_message = event.error_message(),
            error_stack = event.error_stack(),
            "lifecycle event"
        );
    } else {
        info!(
            target: "jobtrail::event",
            event_type = %event.kind,
            job_id = %event.job_id,
            producer = event.producer_id.as_deref(),
            stage = event.stage.as_deref(),
            duration_ms = event.duration_ms,
            meta = meta.as_deref(),
            "lifecycle event"
        );
    }
}

/// Clip every free-text field of the event in place.
pub fn clip_event(event: &mut LifecycleEvent, limits: &Limits) {
    let max = limits.max_meta_chars;
    if let Some(meta) = event.meta.as_mut() {
        meta.values_mut().for_each(|v| clip_strings(v, max));
    }
    for payload in [
        event.result.as_mut(),
        event.stages.as_mut(),
        event.stages_list.as_mut(),
    ]
    .into_iter()
    .flatten()
    {
        clip_strings(payload, max);
    }
    if let Some(error) = event.error.as_mut() {
        for (key, value) in error.iter_mut() {
            let limit = if key == "stack" {
                limits.max_err_stack_chars
            } else {
                max
            };
            clip_strings(value, limit);
        }
    }
}

/// Clip every string inside `value`.
pub fn clip_strings(value: &mut Value, max_chars: usize) {
    match value {
        Value::String(s) => {
            if let Some(clipped) = clip(s, max_chars) {
                *s = clipped;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| clip_strings(v, max_chars)),
        Value::Object(map) => map.values_mut().for_each(|v| clip_strings(v, max_chars)),
        _ => {}
    }
}

/// `Some(clipped)` when `text` is longer than `max_chars` characters.
pub fn clip(text: &str, max_chars: usize) -> Option<String> {
    let (cut, _) = text.char_indices().nth(max_chars)?;
    let dropped = text[cut..].chars().count();
    Some(format!("{}…(+{dropped} chars)", &text[..cut]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_leaves_short_text_alone() {
        assert_eq!(clip("short", 10), None);
        assert_eq!(clip("exactly10!", 10), None);
    }

    #[test]
    fn clip_counts_characters_not_bytes() {
        let clipped = clip("ééééé", 2).unwrap();
        assert_eq!(clipped, "éé…(+3 chars)");
    }

    #[test]
    fn shards_are_stable_per_job() {
        assert_eq!(shard_for("job-1", 4), shard_for("job-1", 4));
        assert!(shard_for("job-2", 4) < 4);
        assert_eq!(shard_for("anything", 1), 0);
    }
}
