//! shipline - build, package and deploy Node applications
//!
//! Runs a project build inside a pinned `node:<version>-slim` container,
//! packages the output into a deterministic `tar.gz`, and drives a remote
//! deployment tool (`essh`) through prepare → upload → extract.
//!
//! # Architecture
//!
//! Every deployment is a `DeploymentRun` state machine:
//! - Stages advance strictly in order; skipping one is a precondition error
//! - The first failing stage aborts the run, with no automatic rollback
//! - Rollback is its own operation, invoked explicitly
//!
//! # Modules
//!
//! - `adapters`: Build executor and remote transport (docker, essh)
//! - `core`: Builder, archiver, cache tokens, leases and the orchestrator
//! - `domain`: Data structures (BuildSpec, Artifact, RemoteTarget, Run)
//! - `config`: Layered YAML/env configuration
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Build and package into ./archive.tar.gz
//! shipline export
//!
//! # Full deployment
//! shipline deploy --host web-1 --include-dirs certs:src/certs
//!
//! # Roll back
//! shipline rollback --host web-1
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use crate::core::{CacheMode, CacheToken, DeployOptions, DeployReport, Orchestrator, StageTimeouts};
pub use crate::domain::{
    Artifact, BuildOutput, BuildSpec, DeploymentRun, Operation, RemoteTarget, RunState, Stage,
};
pub use crate::error::{DeployError, DeployFailure, Result};
