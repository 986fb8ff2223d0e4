//! Deployment run state machine.
//!
//! A DeploymentRun represents one build → package → prepare → upload →
//! extract execution against a single target. Transitions follow a fixed
//! table; rollback is never part of the forward chain.
//!
//! | From      | To        | Trigger                 |
//! |-----------|-----------|-------------------------|
//! | Created   | Built     | build                   |
//! | Built     | Packaged  | archive                 |
//! | Packaged  | Prepared  | remote `deploy:prepare` |
//! | Prepared  | Uploaded  | remote `deploy:upload`  |
//! | Uploaded  | Extracted | remote `deploy:extract` |
//! | any       | RolledBack| explicit rollback call  |

use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{Event, EventType, StepStatus};
use crate::core::CacheToken;
use crate::error::{DeployError, Result};

/// Stages of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Created,
    Built,
    Packaged,
    Prepared,
    Uploaded,
    Extracted,
    RolledBack,
}

impl Stage {
    /// Stage that must have completed before this one may start
    pub fn predecessor(self) -> Option<Stage> {
        match self {
            Stage::Created | Stage::RolledBack => None,
            Stage::Built => Some(Stage::Created),
            Stage::Packaged => Some(Stage::Built),
            Stage::Prepared => Some(Stage::Packaged),
            Stage::Uploaded => Some(Stage::Prepared),
            Stage::Extracted => Some(Stage::Uploaded),
        }
    }

    /// Remote tool subcommand that drives this stage
    pub fn subcommand(self) -> Option<&'static str> {
        match self {
            Stage::Prepared => Some("deploy:prepare"),
            Stage::Uploaded => Some("deploy:upload"),
            Stage::Extracted => Some("deploy:extract"),
            Stage::RolledBack => Some("deploy:rollback"),
            _ => None,
        }
    }

    /// Reverse of [`Stage::subcommand`]
    pub fn from_subcommand(subcommand: &str) -> Option<Stage> {
        match subcommand {
            "deploy:prepare" => Some(Stage::Prepared),
            "deploy:upload" => Some(Stage::Uploaded),
            "deploy:extract" => Some(Stage::Extracted),
            "deploy:rollback" => Some(Stage::RolledBack),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Created => "created",
            Stage::Built => "built",
            Stage::Packaged => "packaged",
            Stage::Prepared => "prepared",
            Stage::Uploaded => "uploaded",
            Stage::Extracted => "extracted",
            Stage::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of remote work that can time out or be cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// A pipeline stage
    Stage(Stage),
    /// An arbitrary remote task, by name
    Task(String),
}

impl Operation {
    pub fn task(name: impl Into<String>) -> Self {
        Operation::Task(name.into())
    }

    /// Pipeline stage this operation belongs to; tasks have none
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Operation::Stage(stage) => Some(*stage),
            Operation::Task(_) => None,
        }
    }
}

impl From<Stage> for Operation {
    fn from(stage: Stage) -> Self {
        Operation::Stage(stage)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Stage(stage) => write!(f, "Stage '{}'", stage),
            Operation::Task(name) => write!(f, "Task '{}'", name),
        }
    }
}

/// A single deployment run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Target hostname
    pub hostname: String,

    /// Remote deploy path
    pub deploy_path: String,

    /// Cache token injected into every remote command of this run
    pub cache_token: CacheToken,

    /// Last stage completed successfully
    pub stage: Stage,

    /// Overall run state
    pub state: RunState,

    /// Name of the artifact once packaged
    pub artifact_name: Option<String>,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished (if applicable)
    pub completed_at: Option<DateTime<Utc>>,

    /// Stage journal, in order
    pub events: Vec<Event>,
}

impl DeploymentRun {
    /// Create a new run against a target
    pub fn new(hostname: impl Into<String>, deploy_path: impl Into<String>, cache_token: CacheToken) -> Self {
        let id = Uuid::new_v4();
        let mut run = Self {
            id,
            hostname: hostname.into(),
            deploy_path: deploy_path.into(),
            cache_token,
            stage: Stage::Created,
            state: RunState::Running,
            artifact_name: None,
            started_at: Utc::now(),
            completed_at: None,
            events: Vec::new(),
        };
        run.record(Event::new(
            id,
            None,
            EventType::RunStarted,
            format!("Deployment to '{}' started", run.hostname),
            StepStatus::Running,
        ));
        run
    }

    /// Check that `stage` may start now
    pub fn ensure_can_enter(&self, stage: Stage) -> Result<()> {
        // Rollback is reachable from anywhere, failed runs included
        let Some(required) = stage.predecessor() else {
            return Ok(());
        };

        if let RunState::Failed { stage: failed_at, .. } = &self.state {
            return Err(DeployError::RunFailed {
                failed_at: *failed_at,
            });
        }

        if self.stage != required {
            return Err(DeployError::Precondition {
                attempted: stage,
                current: self.stage,
                required,
            });
        }

        Ok(())
    }

    /// Mark a stage as started; returns a handle used to time it
    pub fn begin(&mut self, stage: Stage) -> Result<StageTimer> {
        self.ensure_can_enter(stage)?;
        self.record(Event::new(
            self.id,
            Some(stage),
            EventType::StageStarted,
            format!("Stage '{}' started", stage),
            StepStatus::Running,
        ));
        Ok(StageTimer {
            stage,
            started: Instant::now(),
        })
    }

    /// Mark a stage as completed and advance the state machine
    pub fn complete(&mut self, timer: StageTimer) {
        let duration_ms = timer.started.elapsed().as_millis() as u64;
        self.stage = timer.stage;
        self.record(
            Event::new(
                self.id,
                Some(timer.stage),
                EventType::StageCompleted,
                format!("Stage '{}' completed in {}ms", timer.stage, duration_ms),
                StepStatus::Completed,
            )
            .with_duration(duration_ms),
        );

        if matches!(timer.stage, Stage::Extracted | Stage::RolledBack) {
            self.state = RunState::Completed;
            self.completed_at = Some(Utc::now());
            self.record(Event::new(
                self.id,
                None,
                EventType::RunCompleted,
                format!("Deployment to '{}' finished at '{}'", self.hostname, timer.stage),
                StepStatus::Completed,
            ));
        }
    }

    /// Mark a stage as failed; the run accepts no further forward transitions
    pub fn fail(&mut self, timer: StageTimer, error: &DeployError) {
        let duration_ms = timer.started.elapsed().as_millis() as u64;
        self.record(
            Event::new(
                self.id,
                Some(timer.stage),
                EventType::StageFailed,
                format!("Stage '{}' failed after {}ms", timer.stage, duration_ms),
                StepStatus::Failed,
            )
            .with_duration(duration_ms)
            .with_error(error.to_string()),
        );
        self.finish_failed(timer.stage, error);
    }

    /// Fail the run before `stage` could start, e.g. when its lease never came
    pub fn abort(&mut self, stage: Stage, error: &DeployError) {
        self.finish_failed(stage, error);
    }

    fn finish_failed(&mut self, stage: Stage, error: &DeployError) {
        let message = error.to_string();
        self.state = RunState::Failed {
            stage,
            error: message.clone(),
        };
        self.completed_at = Some(Utc::now());
        self.record(
            Event::new(
                self.id,
                None,
                EventType::RunFailed,
                format!("Deployment to '{}' failed at '{}'", self.hostname, stage),
                StepStatus::Failed,
            )
            .with_error(message),
        );
    }

    fn record(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Check if the run is still in progress
    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running)
    }

    /// Check if a specific stage completed in this run
    pub fn is_stage_completed(&self, stage: Stage) -> bool {
        self.events
            .iter()
            .any(|e| e.stage == Some(stage) && e.event_type == EventType::StageCompleted)
    }

    /// Stages that were started, in order
    pub fn stages_started(&self) -> Vec<Stage> {
        self.events
            .iter()
            .filter(|e| e.event_type == EventType::StageStarted)
            .filter_map(|e| e.stage)
            .collect()
    }
}

/// Timing handle for a stage in flight
#[derive(Debug)]
pub struct StageTimer {
    stage: Stage,
    started: Instant,
}

/// State of a deployment run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Currently executing
    #[default]
    Running,

    /// Reached a terminal stage
    Completed,

    /// Failed at a stage
    Failed { stage: Stage, error: String },
}
