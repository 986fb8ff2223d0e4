//! Test doubles shared by the integration tests.
//!
//! `MockExecutor` runs builds against a host scratch directory standing in
//! for `/src`; `RecordingTransport` records every remote call instead of
//! reaching a host.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tempfile::TempDir;

use shipline::adapters::{
    resolve_env_path, BuildEnvironment, BuildExecutor, ExecOutput, RemoteCommand,
    RemoteTransport, StagedFile, WORKDIR,
};
use shipline::core::fs_util;
use shipline::core::{CacheToken, Orchestrator, StageTimeouts};
use shipline::domain::{CredentialBundle, RemoteTarget, DEFAULT_DEPLOY_PATH};
use shipline::error::{DeployError, Result};

// ============================================================================
// Build executor
// ============================================================================

/// What `npm run <task>` writes into the work directory
#[derive(Debug, Clone, Default)]
pub struct BuildScript {
    /// (path under /src, contents)
    pub outputs: Vec<(String, String)>,
    /// Step (joined argv) that exits non-zero
    pub fail_step: Option<String>,
    /// Delay applied to every step
    pub step_delay: Option<Duration>,
    /// (path under /src, link target) symlinks written by `npm run`
    pub links: Vec<(String, PathBuf)>,
}

#[derive(Debug, Default)]
pub struct ExecutorLog {
    pub images: Vec<String>,
    pub steps: Vec<String>,
    pub discarded: usize,
}

#[derive(Clone, Default)]
pub struct MockExecutor {
    script: BuildScript,
    pub log: Arc<Mutex<ExecutorLog>>,
}

impl MockExecutor {
    pub fn new(script: BuildScript) -> Self {
        Self {
            script,
            log: Arc::default(),
        }
    }

    /// Build that emits a small `dist/` tree
    pub fn with_dist() -> Self {
        Self::new(BuildScript {
            outputs: vec![
                ("dist/index.html".to_string(), "<html></html>".to_string()),
                ("dist/main.js".to_string(), "console.log(1)".to_string()),
            ],
            ..Default::default()
        })
    }

    pub fn steps(&self) -> Vec<String> {
        self.log.lock().unwrap().steps.clone()
    }

    pub fn discarded(&self) -> usize {
        self.log.lock().unwrap().discarded
    }
}

#[async_trait]
impl BuildExecutor for MockExecutor {
    fn name(&self) -> &str {
        "mock"
    }

    async fn new_environment(&self, image: &str) -> anyhow::Result<Box<dyn BuildEnvironment>> {
        self.log.lock().unwrap().images.push(image.to_string());
        Ok(Box::new(MockEnvironment {
            workspace: TempDir::new()?,
            script: self.script.clone(),
            log: self.log.clone(),
        }))
    }
}

struct MockEnvironment {
    workspace: TempDir,
    script: BuildScript,
    log: Arc<Mutex<ExecutorLog>>,
}

impl MockEnvironment {
    fn host_path(&self, env_path: &str) -> PathBuf {
        let resolved = resolve_env_path(env_path);
        let relative = resolved
            .strip_prefix(WORKDIR)
            .unwrap_or(&resolved)
            .trim_start_matches('/');
        self.workspace.path().join(relative)
    }
}

#[async_trait]
impl BuildEnvironment for MockEnvironment {
    async fn with_directory(&mut self, dest: &str, src: &Path) -> anyhow::Result<()> {
        fs_util::copy_dir_all(src, &self.host_path(dest))?;
        Ok(())
    }

    async fn run(&mut self, argv: &[String]) -> anyhow::Result<ExecOutput> {
        let step = argv.join(" ");
        self.log.lock().unwrap().steps.push(step.clone());

        if let Some(delay) = self.script.step_delay {
            tokio::time::sleep(delay).await;
        }

        if self.script.fail_step.as_deref() == Some(step.as_str()) {
            return Ok(ExecOutput {
                exit_code: Some(1),
                stdout: String::new(),
                stderr: format!("{} failed", step),
            });
        }

        if argv.get(1).map(String::as_str) == Some("run") {
            for (path, contents) in &self.script.outputs {
                let full = self.host_path(path);
                std::fs::create_dir_all(full.parent().unwrap())?;
                std::fs::write(full, contents)?;
            }
            for (path, link) in &self.script.links {
                let full = self.host_path(path);
                std::fs::create_dir_all(full.parent().unwrap())?;
                make_symlink(link, &full)?;
            }
        }

        Ok(ExecOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn extract_dir(&self, path: &str, into: &Path) -> anyhow::Result<()> {
        let src = self.host_path(path);
        anyhow::ensure!(src.is_dir(), "no directory {}", path);
        fs_util::copy_dir_all(&src, into)?;
        Ok(())
    }

    async fn extract_file(&self, path: &str, into: &Path) -> anyhow::Result<()> {
        let src = self.host_path(path);
        anyhow::ensure!(src.is_file(), "no file {}", path);
        fs_util::copy_file(&src, into)?;
        Ok(())
    }

    async fn discard(self: Box<Self>) -> anyhow::Result<()> {
        self.log.lock().unwrap().discarded += 1;
        Ok(())
    }
}

#[cfg(unix)]
fn make_symlink(link: &Path, at: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(link, at)
}

#[cfg(not(unix))]
fn make_symlink(_link: &Path, _at: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "symlinks need unix"))
}

// ============================================================================
// Remote transport
// ============================================================================

/// One recorded remote call
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub argv: Vec<String>,
    pub cache_token: String,
    /// Staged files with their contents
    pub staged: Vec<(String, Vec<u8>)>,
}

impl RemoteCall {
    pub fn task(&self) -> &str {
        &self.argv[0]
    }
}

#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub calls: Arc<Mutex<Vec<RemoteCall>>>,
    fail_task: Option<String>,
    delay: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call to `task` with exit code 1
    pub fn failing_on(task: &str) -> Self {
        Self {
            fail_task: Some(task.to_string()),
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn tasks(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.task().to_string()).collect()
    }
}

#[async_trait]
impl RemoteTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
        cache_token: &CacheToken,
        extra_files: &[StagedFile],
    ) -> Result<String> {
        let staged = extra_files
            .iter()
            .map(|f| (f.name.clone(), std::fs::read(&f.source).unwrap_or_default()))
            .collect();

        self.calls.lock().unwrap().push(RemoteCall {
            argv: command.argv(target),
            cache_token: cache_token.as_str().to_string(),
            staged,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_task.as_deref() == Some(command.task.as_str()) {
            return Err(DeployError::RemoteExec {
                subcommand: command.task.clone(),
                host: target.hostname.clone(),
                exit_code: Some(1),
                output: "remote failure".to_string(),
            });
        }

        Ok(format!("{} ok\n", command.task))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn target() -> RemoteTarget {
    RemoteTarget::new(
        "web-1",
        DEFAULT_DEPLOY_PATH,
        CredentialBundle {
            ssh_key: PathBuf::from("/keys/id_rsa"),
            cloud_credentials: PathBuf::from("/keys/aws"),
            tool_config: PathBuf::from("/keys/config.lua"),
        },
    )
    .unwrap()
}

/// A project tree with a package.json and the given extra files
pub fn project(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("package.json"), r#"{"name":"app"}"#).unwrap();
    for (path, contents) in files {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }
    dir
}

pub fn orchestrator(
    executor: &MockExecutor,
    transport: &RecordingTransport,
    leases: &Path,
) -> Orchestrator {
    Orchestrator::new(
        Box::new(executor.clone()),
        Box::new(transport.clone()),
        leases,
    )
}

pub fn short_timeouts() -> StageTimeouts {
    StageTimeouts {
        build_seconds: 5,
        package_seconds: 5,
        stage_seconds: 1,
        lease_wait_seconds: 0,
    }
}

/// Entry names of a tar.gz, directories without trailing slash
pub fn archive_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|e| {
            e.unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}

/// Contents of one file inside a tar.gz
pub fn archive_file(bytes: &[u8], name: &str) -> Option<String> {
    use std::io::Read;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().to_string_lossy() == name {
            let mut contents = String::new();
            entry.read_to_string(&mut contents).unwrap();
            return Some(contents);
        }
    }
    None
}
