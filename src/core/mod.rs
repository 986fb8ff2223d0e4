//! Core pipeline logic.
//!
//! This module contains:
//! - Builder: runs a BuildSpec in an isolated environment
//! - Archiver: deterministic tar.gz packaging
//! - Cache: per-run cache tokens
//! - Lease: per-target advisory locking
//! - Timeouts: per-stage time budgets
//! - Orchestrator: the deployment state machine driver

pub mod archiver;
pub mod builder;
pub mod cache;
pub mod fs_util;
pub mod lease;
pub mod orchestrator;
pub mod timeouts;

// Re-export commonly used types
pub use builder::ArtifactBuilder;
pub use cache::{CacheMode, CacheToken, CACHE_BUSTER_ENV};
pub use lease::TargetLease;
pub use orchestrator::{DeployOptions, DeployReport, Orchestrator};
pub use timeouts::StageTimeouts;
