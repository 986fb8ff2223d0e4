//! Stage journal events.
//!
//! Every stage transition of a deployment run is recorded as an immutable
//! event. The journal lives in memory for the lifetime of the run and is
//! reported back to the caller; it is never persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::Stage;

/// A single event in a run's journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Stage the event refers to (None for run-level events)
    pub stage: Option<Stage>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO credentials)
    pub payload_summary: String,

    /// Status of the stage/run
    pub status: StepStatus,

    /// Time taken in milliseconds (for finished stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        stage: Option<Stage>,
        event_type: EventType,
        payload_summary: String,
        status: StepStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            stage,
            event_type,
            payload_summary,
            status,
            duration_ms: None,
            error: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events recorded during a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started
    RunStarted,

    /// A run reached a terminal stage
    RunCompleted,

    /// A run failed
    RunFailed,

    /// A stage has started
    StageStarted,

    /// A stage completed successfully
    StageCompleted,

    /// A stage failed
    StageFailed,
}

/// Status of a stage or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,
}
