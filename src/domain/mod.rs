//! Domain types for the deploy pipeline.
//!
//! This module contains the core data structures:
//! - BuildSpec: What to build and how
//! - Artifact: Build outputs and packaged archives
//! - RemoteTarget: Where to deploy, with credentials
//! - Run: Deployment run state machine and its event journal

pub mod artifact;
pub mod build_spec;
pub mod events;
pub mod run;
pub mod target;

// Re-export commonly used types
pub use artifact::{Artifact, BuildOutput, ARCHIVE_EXTENSION, DEFAULT_ARTIFACT_NAME};
pub use build_spec::{BuildSpec, IncludeKind, IncludeMapping, InstallMode};
pub use events::{Event, EventType, StepStatus};
pub use run::{DeploymentRun, Operation, RunState, Stage, StageTimer};
pub use target::{CredentialBundle, RemoteTarget, DEFAULT_DEPLOY_PATH};
