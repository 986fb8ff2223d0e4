//! Error taxonomy for the deploy pipeline.
//!
//! Every variant is fatal: no stage retries, and nothing here triggers a
//! compensating rollback. Variants carry enough context to tell which stage
//! (and for remote failures, which subcommand on which host) raised them.

use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{DeploymentRun, Operation, Stage};

/// Result alias used across the pipeline
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum DeployError {
    /// Dependency install or build command failed, or the executor itself broke
    #[error("Build failed at '{step}'{}: {output}", exit_suffix(.exit_code))]
    Build {
        step: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Archive creation failed
    #[error("Packaging failed: {message}")]
    Packaging { message: String },

    /// Remote command exited non-zero or the channel could not be established
    #[error("Remote command '{subcommand}' on '{host}' failed{}: {output}", exit_suffix(.exit_code))]
    RemoteExec {
        subcommand: String,
        host: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Credential file unreadable or the permission step failed
    #[error("Credential error for {}: {message}", .path.display())]
    Credential { path: PathBuf, message: String },

    /// Stage attempted out of order
    #[error("Cannot enter stage '{attempted}' from '{current}' (requires '{required}')")]
    Precondition {
        attempted: Stage,
        current: Stage,
        required: Stage,
    },

    /// Run already failed; no further forward transitions are allowed
    #[error("Run already failed at stage '{failed_at}'")]
    RunFailed { failed_at: Stage },

    /// Stage or task exceeded its time budget
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: Operation, seconds: u64 },

    /// Stage or task was cancelled before it could finish
    #[error("{operation} cancelled")]
    Cancelled { operation: Operation },

    /// Another run holds the target lease
    #[error("{operation} timed out after {waited_seconds}s waiting for lease on '{target}'")]
    Lease {
        target: String,
        operation: Operation,
        waited_seconds: u64,
    },

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// A deployment that stopped early.
///
/// Carries the run journal up to the failure so callers can still record it.
/// `run` is `None` when the target was rejected before a run was started.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DeployFailure {
    pub run: Option<Box<DeploymentRun>>,
    pub error: DeployError,
}

impl DeployFailure {
    pub(crate) fn before_run(error: DeployError) -> Self {
        Self { run: None, error }
    }

    pub(crate) fn during(run: DeploymentRun, error: DeployError) -> Self {
        Self {
            run: Some(Box::new(run)),
            error,
        }
    }
}

impl From<DeployFailure> for DeployError {
    fn from(failure: DeployFailure) -> Self {
        failure.error
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    }
}

impl DeployError {
    /// Stage a failure belongs to, when it can be told from the error alone
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Build { .. } => Some(Stage::Built),
            Self::Packaging { .. } => Some(Stage::Packaged),
            Self::RemoteExec { subcommand, .. } => Stage::from_subcommand(subcommand),
            Self::Precondition { attempted, .. } => Some(*attempted),
            Self::Timeout { operation, .. } | Self::Cancelled { operation } => operation.stage(),
            Self::RunFailed { failed_at } => Some(*failed_at),
            Self::Credential { .. } | Self::Lease { .. } | Self::Config(_) => None,
        }
    }

    pub(crate) fn packaging(message: impl Into<String>) -> Self {
        Self::Packaging {
            message: message.into(),
        }
    }

    pub(crate) fn credential(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Credential {
            path: path.into(),
            message: message.into(),
        }
    }
}
