//! Lifecycle events received from running jobs.
//!
//! Producers hand over loosely-typed mappings. This module turns them into
//! [`LifecycleEvent`], rejecting only what cannot be applied at all: a
//! missing or unknown `type`, or a missing `jobId`. Everything else is
//! coerced into shape.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{JobState, StageStatus};

/// The fixed event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.accepted")]
    JobAccepted,
    #[serde(rename = "job.started")]
    JobStarted,
    #[serde(rename = "job.succeeded")]
    JobSucceeded,
    #[serde(rename = "job.failed")]
    JobFailed,
    #[serde(rename = "job.canceled")]
    JobCanceled,
    #[serde(rename = "stage.start")]
    StageStart,
    #[serde(rename = "stage.succeed")]
    StageSucceed,
    #[serde(rename = "stage.fail")]
    StageFail,
    #[serde(rename = "job.summary")]
    JobSummary,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::JobAccepted,
        EventType::JobStarted,
        EventType::JobSucceeded,
        EventType::JobFailed,
        EventType::JobCanceled,
        EventType::StageStart,
        EventType::StageSucceed,
        EventType::StageFail,
        EventType::JobSummary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobAccepted => "job.accepted",
            EventType::JobStarted => "job.started",
            EventType::JobSucceeded => "job.succeeded",
            EventType::JobFailed => "job.failed",
            EventType::JobCanceled => "job.canceled",
            EventType::StageStart => "stage.start",
            EventType::StageSucceed => "stage.succeed",
            EventType::StageFail => "stage.fail",
            EventType::JobSummary => "job.summary",
        }
    }

    /// Stage status carried by a `stage.*` event.
    pub fn stage_status(self) -> Option<StageStatus> {
        match self {
            EventType::StageStart => Some(StageStatus::Start),
            EventType::StageSucceed => Some(StageStatus::Succeed),
            EventType::StageFail => Some(StageStatus::Fail),
            _ => None,
        }
    }

    /// Job state a `job.*` transition moves to.
    pub fn target_state(self) -> Option<JobState> {
        match self {
            EventType::JobAccepted => Some(JobState::Queued),
            EventType::JobStarted => Some(JobState::Running),
            EventType::JobSucceeded => Some(JobState::Succeeded),
            EventType::JobFailed => Some(JobState::Failed),
            EventType::JobCanceled => Some(JobState::Canceled),
            _ => None,
        }
    }

    /// Events logged at warning level.
    pub fn is_failure(self) -> bool {
        matches!(self, EventType::JobFailed | EventType::StageFail)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::MalformedEvent(format!("unknown event type {s:?}")))
    }
}

/// A validated lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventType,
    pub job_id: String,
    pub ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Always an object when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Always an object when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stages_list: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_seconds: Option<f64>,
}

impl LifecycleEvent {
    /// Validate a raw event mapping.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut raw) = value else {
            return Err(Error::MalformedEvent("event is not a mapping".to_string()));
        };

        let kind: EventType = match raw.remove("type") {
            Some(Value::String(t)) => t.trim().parse()?,
            Some(other) => {
                return Err(Error::MalformedEvent(format!("type is not a string: {other}")));
            }
            None => return Err(Error::MalformedEvent("missing type".to_string())),
        };

        let job_id = take_first(&mut raw, &["jobId", "job_id"])
            .as_ref()
            .and_then(scalar_string)
            .ok_or_else(|| Error::MalformedEvent(format!("{kind} without jobId")))?;

        let stage = raw.remove("stage").as_ref().and_then(scalar_string);
        if kind.stage_status().is_some() && stage.is_none() {
            return Err(Error::MalformedEvent(format!("{kind} without stage name")));
        }

        let ts = match raw.remove("ts") {
            None | Some(Value::Null) => Utc::now(),
            Some(v) => parse_timestamp(&v).unwrap_or_else(|| {
                tracing::warn!(job_id = %job_id, ts = %v, "unparsable event timestamp, using now");
                Utc::now()
            }),
        };

        let total_seconds = raw
            .remove("totalSeconds")
            .as_ref()
            .and_then(number)
            .or_else(|| {
                raw.remove("totalMs")
                    .as_ref()
                    .and_then(number)
                    .map(|ms| ms / 1000.0)
            })
            .filter(|s| s.is_finite() && *s >= 0.0);

        Ok(Self {
            kind,
            job_id,
            ts,
            producer_id: take_first(&mut raw, &["producerId", "bot"])
                .as_ref()
                .and_then(scalar_string),
            stage,
            duration_ms: raw.remove("durationMs").as_ref().and_then(duration_ms),
            meta: raw.remove("meta").and_then(into_object),
            result: raw.remove("result").filter(|v| !v.is_null()),
            error: raw.remove("error").and_then(into_error_object),
            stages: raw.remove("stages").filter(|v| !v.is_null()),
            stages_list: raw.remove("stagesList").filter(|v| !v.is_null()),
            total_seconds,
        })
    }

    /// Error message, when the event carries one.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref()?.get("message")?.as_str()
    }

    pub fn error_stack(&self) -> Option<&str> {
        self.error.as_ref()?.get("stack")?.as_str()
    }
}

/// First non-null value among alias keys. All aliases are removed.
fn take_first(raw: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    let mut found = None;
    for key in keys {
        if let Some(v) = raw.remove(*key).filter(|v| !v.is_null()) {
            found.get_or_insert(v);
        }
    }
    found
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Negative or non-finite durations are treated as unknown.
fn duration_ms(v: &Value) -> Option<i64> {
    number(v)
        .filter(|d| d.is_finite() && *d >= 0.0)
        .map(|d| d.round() as i64)
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

fn into_object(v: Value) -> Option<Map<String, Value>> {
    match v {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Some(map)
        }
    }
}

fn into_error_object(v: Value) -> Option<Map<String, Value>> {
    match v {
        Value::Null => None,
        Value::Object(map) => Some(map),
        Value::String(message) => {
            let mut map = Map::new();
            map.insert("message".to_string(), Value::String(message));
            Some(map)
        }
        other => {
            let mut map = Map::new();
            map.insert("message".to_string(), Value::String(other.to_string()));
            Some(map)
        }
    }
}
