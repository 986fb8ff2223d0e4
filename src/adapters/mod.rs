//! Adapter interfaces for external systems.
//!
//! The pipeline depends on two external capabilities:
//! - A build executor that runs commands in an isolated, image-pinned
//!   environment (`docker` in production)
//! - A remote transport that runs one deployment-tool command against a
//!   target host (`essh` in production)

pub mod docker;
pub mod essh;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;

use crate::core::CacheToken;
use crate::domain::RemoteTarget;

// Re-export the concrete adapters
pub use docker::DockerExecutor;
pub use essh::EsshTransport;

/// Work directory of every build environment
pub const WORKDIR: &str = "/src";

/// Output from a command run inside a build environment
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Exit code (None if killed by a signal)
    pub exit_code: Option<i32>,

    pub stdout: String,

    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Factory for isolated build environments
#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Start a fresh environment from `image`
    async fn new_environment(&self, image: &str) -> Result<Box<dyn BuildEnvironment>>;
}

/// One isolated build environment.
///
/// Paths inside the environment are absolute or relative to [`WORKDIR`].
#[async_trait]
pub trait BuildEnvironment: Send {
    /// Copy a host directory into the environment at `dest`
    async fn with_directory(&mut self, dest: &str, src: &Path) -> Result<()>;

    /// Run a command in the work directory. A non-zero exit is not an error
    /// at this level; callers inspect [`ExecOutput::exit_code`].
    async fn run(&mut self, argv: &[String]) -> Result<ExecOutput>;

    /// Copy a directory out of the environment into `into` (merging)
    async fn extract_dir(&self, path: &str, into: &Path) -> Result<()>;

    /// Copy a single file out of the environment to `into`
    async fn extract_file(&self, path: &str, into: &Path) -> Result<()>;

    /// Tear the environment down
    async fn discard(self: Box<Self>) -> Result<()>;
}

/// A remote deployment-tool command: `<tool> <task> <hostname> <deploy_path>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Subcommand or task name, e.g. `deploy:extract`
    pub task: String,
}

impl RemoteCommand {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }

    /// Arguments following the tool binary
    pub fn argv(&self, target: &RemoteTarget) -> Vec<String> {
        vec![
            self.task.clone(),
            target.hostname.clone(),
            target.deploy_path.clone(),
        ]
    }
}

/// A local file staged into the transport's working directory
#[derive(Debug, Clone)]
pub struct StagedFile {
    /// Name in the working directory
    pub name: String,

    /// Local path to copy from
    pub source: PathBuf,
}

/// Runs one remote command per call
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Execute `command` against `target`, returning captured stdout.
    ///
    /// Credentials are installed fresh for every call. `cache_token` is
    /// exported to the tool process only.
    async fn run(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
        cache_token: &CacheToken,
        extra_files: &[StagedFile],
    ) -> crate::error::Result<String>;
}

/// Resolve an environment path against the work directory
pub fn resolve_env_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", WORKDIR, path.trim_start_matches("./"))
    }
}
