//! Core data model.
//!
//! A job is one unit of work run by an external producer. Its durable
//! record carries the lifecycle state, timing, and the normalized result,
//! with an append-only history of stage rows beneath it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted by the producer, not running yet.
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobState {
    /// Forward-only transitions. Re-affirming the current state is not a
    /// transition.
    pub fn can_transition_to(self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Succeeded)
                | (Queued, Failed)
                | (Queued, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "canceled" => Ok(JobState::Canceled),
            other => Err(Error::InvalidState(format!("unknown job state {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Start,
    Succeed,
    Fail,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StageStatus::Start)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageStatus::Start => "start",
            StageStatus::Succeed => "succeed",
            StageStatus::Fail => "fail",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(StageStatus::Start),
            "succeed" => Ok(StageStatus::Succeed),
            "fail" => Ok(StageStatus::Fail),
            other => Err(Error::InvalidState(format!("unknown stage status {other:?}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

/// A job row as read back from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub producer_id: Option<String>,
    pub state: JobState,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Elapsed seconds between start and finish, or an explicit summary total.
    pub total_seconds: Option<f64>,
    /// Accumulated by shallow merge across accepted events.
    pub meta: serde_json::Value,
    /// Canonical envelope, only set on success.
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub stages: Option<serde_json::Value>,
    pub stages_list: Option<serde_json::Value>,
}

/// One append-only stage fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRecord {
    pub id: i64,
    pub job_id: String,
    pub name: String,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub meta: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

/// A fine-grained event log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub job_id: String,
    pub event_type: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter for listing jobs. Empty fields match everything.
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub producer_id: Option<String>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            state: None,
            producer_id: None,
            limit: 50,
        }
    }
}

/// Row counts per audit table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub jobs: u64,
    pub stages: u64,
    pub events: u64,
}

/// Rows removed by a purge, per table.
pub type PurgeReport = TableCounts;
