//! Docker build executor.
//!
//! Each environment is a long-lived container started from the runtime image
//! with a host scratch directory bind-mounted at `/src`. Commands run through
//! `docker exec`, so state such as a globally installed npm persists between
//! steps of one build. Files move in and out through the bind mount.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{resolve_env_path, BuildEnvironment, BuildExecutor, ExecOutput, WORKDIR};
use crate::core::fs_util;

/// Executor backed by the docker CLI
pub struct DockerExecutor {
    /// Path to the docker binary (default: "docker")
    binary_path: String,
}

impl Default for DockerExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerExecutor {
    pub fn new() -> Self {
        Self {
            binary_path: "docker".to_string(),
        }
    }

    /// Use a custom docker-compatible binary (e.g. podman)
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl BuildExecutor for DockerExecutor {
    fn name(&self) -> &str {
        "docker"
    }

    async fn new_environment(&self, image: &str) -> Result<Box<dyn BuildEnvironment>> {
        let workspace = TempDir::new().context("Failed to create build workspace")?;
        let mount = format!("{}:{}", workspace.path().display(), WORKDIR);

        let output = Command::new(&self.binary_path)
            .args(["run", "-d", "--rm", "-v", &mount, "-w", WORKDIR, image])
            .args(["sleep", "infinity"])
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to spawn {} for image '{}'", self.binary_path, image))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Failed to start build container from '{}': {}",
                image,
                stderr.trim()
            );
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if container_id.is_empty() {
            anyhow::bail!("Docker returned no container id for image '{}'", image);
        }

        info!(%image, container = %short_id(&container_id), "Build environment started");

        Ok(Box::new(DockerEnvironment {
            binary_path: self.binary_path.clone(),
            container_id,
            workspace,
            discarded: false,
        }))
    }
}

/// A running build container
pub struct DockerEnvironment {
    binary_path: String,
    container_id: String,
    workspace: TempDir,
    discarded: bool,
}

impl DockerEnvironment {
    /// Map an environment path under `/src` to the host workspace
    fn host_path(&self, env_path: &str) -> Result<PathBuf> {
        map_to_workspace(self.workspace.path(), env_path)
    }

    async fn remove_container(&mut self) -> Result<()> {
        // Hand bind-mounted files back to the invoking user so the
        // workspace can be cleaned up
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            if let Ok(meta) = std::fs::metadata(self.workspace.path()) {
                let owner = format!("{}:{}", meta.uid(), meta.gid());
                let _ = Command::new(&self.binary_path)
                    .args(["exec", &self.container_id, "chown", "-R", &owner, WORKDIR])
                    .stdin(Stdio::null())
                    .output()
                    .await;
            }
        }

        let output = Command::new(&self.binary_path)
            .args(["rm", "-f", &self.container_id])
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to remove build container")?;
        self.discarded = true;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to remove build container: {}", stderr.trim());
        }
        Ok(())
    }
}

#[async_trait]
impl BuildEnvironment for DockerEnvironment {
    async fn with_directory(&mut self, dest: &str, src: &Path) -> Result<()> {
        let target = self.host_path(dest)?;
        let src = src.to_path_buf();
        tokio::task::spawn_blocking(move || fs_util::copy_dir_all(&src, &target))
            .await
            .context("Copy task panicked")?
            .with_context(|| format!("Failed to copy directory into environment at '{}'", dest))
    }

    async fn run(&mut self, argv: &[String]) -> Result<ExecOutput> {
        debug!(container = %short_id(&self.container_id), command = %argv.join(" "), "docker exec");

        let output = Command::new(&self.binary_path)
            .args(["exec", "-w", WORKDIR, &self.container_id])
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run '{}' in build container", argv.join(" ")))?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn extract_dir(&self, path: &str, into: &Path) -> Result<()> {
        let src = self.host_path(path)?;
        if !src.is_dir() {
            anyhow::bail!("Directory '{}' does not exist in build environment", path);
        }
        let into = into.to_path_buf();
        tokio::task::spawn_blocking(move || fs_util::copy_dir_all(&src, &into))
            .await
            .context("Copy task panicked")?
            .with_context(|| format!("Failed to extract directory '{}'", path))
    }

    async fn extract_file(&self, path: &str, into: &Path) -> Result<()> {
        let src = self.host_path(path)?;
        if !src.is_file() {
            anyhow::bail!("File '{}' does not exist in build environment", path);
        }
        fs_util::copy_file(&src, into).with_context(|| format!("Failed to extract file '{}'", path))
    }

    async fn discard(mut self: Box<Self>) -> Result<()> {
        self.remove_container().await?;
        info!(container = %short_id(&self.container_id), "Build environment discarded");
        Ok(())
    }
}

impl Drop for DockerEnvironment {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        // Best effort when the build future was cancelled mid-flight
        warn!(container = %short_id(&self.container_id), "Build environment dropped without discard");
        let _ = std::process::Command::new(&self.binary_path)
            .args(["rm", "-f", &self.container_id])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
    }
}

fn map_to_workspace(workspace: &Path, env_path: &str) -> Result<PathBuf> {
    let resolved = resolve_env_path(env_path);
    let relative = Path::new(&resolved)
        .strip_prefix(WORKDIR)
        .with_context(|| format!("Path '{}' is outside the work directory {}", env_path, WORKDIR))?;

    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        anyhow::bail!("Path '{}' must not contain '..'", env_path);
    }

    Ok(workspace.join(relative))
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}
