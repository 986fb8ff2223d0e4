//! essh remote transport.
//!
//! Every call builds a throwaway credential home:
//!
//! ```text
//! <home>/.ssh/id_rsa          (mode 0400)
//! <home>/.aws/credentials
//! <home>/.essh/config.lua
//! ```
//!
//! then runs `essh <task> <hostname> <deploy_path>` with `HOME` pointed at it
//! and `CACHEBUSTER` set on the tool process. The home is removed when the
//! call returns, so no session or credential outlives one round trip.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::{RemoteCommand, RemoteTransport, StagedFile};
use crate::core::cache::{CacheToken, CACHE_BUSTER_ENV};
use crate::domain::RemoteTarget;
use crate::error::{DeployError, Result};

/// Transport backed by the essh CLI
pub struct EsshTransport {
    /// Path to the essh binary (default: "essh")
    binary_path: String,
}

impl Default for EsshTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl EsshTransport {
    pub fn new() -> Self {
        Self {
            binary_path: "essh".to_string(),
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

/// Scratch space for one remote call
struct CallSandbox {
    _root: TempDir,
    home: PathBuf,
    workdir: PathBuf,
}

impl CallSandbox {
    fn create() -> Result<Self> {
        let root = TempDir::new()
            .map_err(|e| DeployError::credential(std::env::temp_dir(), format!("Failed to create sandbox: {}", e)))?;
        let home = root.path().join("home");
        let workdir = root.path().join("work");
        for dir in [&home, &workdir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| DeployError::credential(dir.as_path(), e.to_string()))?;
        }
        Ok(Self {
            _root: root,
            home,
            workdir,
        })
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.home.join(".ssh").join("id_rsa")
    }

    fn cloud_credentials_path(&self) -> PathBuf {
        self.home.join(".aws").join("credentials")
    }

    fn tool_config_path(&self) -> PathBuf {
        self.home.join(".essh").join("config.lua")
    }

    /// Install the credential bundle, then lock the key down to 0400
    fn install_credentials(&self, target: &RemoteTarget) -> Result<()> {
        let creds = &target.credentials;
        install_file(&creds.tool_config, &self.tool_config_path())?;
        install_file(&creds.cloud_credentials, &self.cloud_credentials_path())?;
        install_file(&creds.ssh_key, &self.ssh_key_path())?;
        restrict_to_owner_read(&self.ssh_key_path())
    }

    /// Copy files into the working directory the tool runs from
    fn stage_files(&self, files: &[StagedFile]) -> io::Result<()> {
        for file in files {
            if file.name.contains('/') || file.name.contains('\\') || file.name.is_empty() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a plain file name", file.name),
                ));
            }
            std::fs::copy(&file.source, self.workdir.join(&file.name)).map_err(|e| {
                io::Error::new(e.kind(), format!("{}: {}", file.source.display(), e))
            })?;
        }
        Ok(())
    }
}

fn install_file(src: &Path, dst: &Path) -> Result<()> {
    let content =
        std::fs::read(src).map_err(|e| DeployError::credential(src, format!("unreadable: {}", e)))?;
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DeployError::credential(src, e.to_string()))?;
    }
    std::fs::write(dst, content).map_err(|e| DeployError::credential(src, e.to_string()))
}

#[cfg(unix)]
fn restrict_to_owner_read(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o400))
        .map_err(|e| DeployError::credential(path, format!("chmod 400 failed: {}", e)))
}

#[cfg(not(unix))]
fn restrict_to_owner_read(path: &Path) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .map_err(|e| DeployError::credential(path, e.to_string()))?
        .permissions();
    perms.set_readonly(true);
    std::fs::set_permissions(path, perms).map_err(|e| DeployError::credential(path, e.to_string()))
}

#[async_trait]
impl RemoteTransport for EsshTransport {
    fn name(&self) -> &str {
        "essh"
    }

    #[instrument(skip_all, fields(task = %command.task, host = %target.hostname))]
    async fn run(
        &self,
        target: &RemoteTarget,
        command: &RemoteCommand,
        cache_token: &CacheToken,
        extra_files: &[StagedFile],
    ) -> Result<String> {
        let remote_error = |exit_code: Option<i32>, output: String| DeployError::RemoteExec {
            subcommand: command.task.clone(),
            host: target.hostname.clone(),
            exit_code,
            output,
        };

        let sandbox = CallSandbox::create()?;
        sandbox.install_credentials(target)?;
        sandbox
            .stage_files(extra_files)
            .map_err(|e| remote_error(None, format!("failed to stage files: {}", e)))?;

        let argv = command.argv(target);
        debug!(command = %argv.join(" "), cache_busted = !cache_token.is_empty(), "Running remote command");

        let output = Command::new(&self.binary_path)
            .args(&argv)
            .current_dir(&sandbox.workdir)
            .env("HOME", &sandbox.home)
            .env("AWS_SHARED_CREDENTIALS_FILE", sandbox.cloud_credentials_path())
            .env(CACHE_BUSTER_ENV, cache_token.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| remote_error(None, format!("failed to spawn {}: {}", self.binary_path, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(remote_error(output.status.code(), combined));
        }

        info!(bytes = stdout.len(), "Remote command succeeded");
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CredentialBundle;

    fn target_with(dir: &Path) -> RemoteTarget {
        for name in ["id_rsa", "aws", "config.lua"] {
            std::fs::write(dir.join(name), format!("{} contents", name)).unwrap();
        }
        RemoteTarget::new(
            "web-1",
            "/home/ubuntu/.deploy/",
            CredentialBundle {
                ssh_key: dir.join("id_rsa"),
                cloud_credentials: dir.join("aws"),
                tool_config: dir.join("config.lua"),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_essh_transport_creation() {
        assert_eq!(EsshTransport::new().name(), "essh");
        assert_eq!(EsshTransport::with_binary_path("/opt/essh").binary_path, "/opt/essh");
    }

    #[cfg(unix)]
    #[test]
    fn test_credentials_installed_with_key_locked_down() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = target_with(temp.path());
        let sandbox = CallSandbox::create().unwrap();
        sandbox.install_credentials(&target).unwrap();

        let mode = std::fs::metadata(sandbox.ssh_key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o400);
        assert_eq!(
            std::fs::read_to_string(sandbox.tool_config_path()).unwrap(),
            "config.lua contents"
        );
    }

    #[test]
    fn test_missing_credential_is_credential_error() {
        let temp = TempDir::new().unwrap();
        let mut target = target_with(temp.path());
        target.credentials.ssh_key = temp.path().join("missing");

        let sandbox = CallSandbox::create().unwrap();
        let err = sandbox.install_credentials(&target).unwrap_err();
        assert!(matches!(err, DeployError::Credential { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_remote_error() {
        let temp = TempDir::new().unwrap();
        let target = target_with(temp.path());
        let transport = EsshTransport::with_binary_path(temp.path().join("no-such-essh").display().to_string());

        let err = transport
            .run(&target, &RemoteCommand::new("deploy:prepare"), &CacheToken::empty(), &[])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DeployError::RemoteExec { ref subcommand, exit_code: None, .. } if subcommand == "deploy:prepare"
        ));
    }

    #[tokio::test]
    async fn test_unstageable_artifact_is_upload_error() {
        let temp = TempDir::new().unwrap();
        let target = target_with(temp.path());
        let transport = EsshTransport::with_binary_path(temp.path().join("essh").display().to_string());

        let err = transport
            .run(
                &target,
                &RemoteCommand::new("deploy:upload"),
                &CacheToken::empty(),
                &[StagedFile {
                    name: "archive.tar.gz".to_string(),
                    source: temp.path().join("vanished.tar.gz"),
                }],
            )
            .await
            .unwrap_err();

        match err {
            DeployError::RemoteExec {
                subcommand,
                host,
                exit_code,
                output,
            } => {
                assert_eq!(subcommand, "deploy:upload");
                assert_eq!(host, "web-1");
                assert_eq!(exit_code, None);
                assert!(output.contains("vanished.tar.gz"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cache_buster_and_argv_reach_the_tool() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = target_with(temp.path());

        let script = temp.path().join("fake-essh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho \"$1 $2 $3 cb=$CACHEBUSTER\"\nls\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let artifact = temp.path().join("archive.tar.gz");
        std::fs::write(&artifact, b"tgz").unwrap();

        let transport = EsshTransport::with_binary_path(script.display().to_string());
        let stdout = transport
            .run(
                &target,
                &RemoteCommand::new("deploy:upload"),
                &CacheToken::new(false),
                &[StagedFile {
                    name: "archive.tar.gz".to_string(),
                    source: artifact,
                }],
            )
            .await
            .unwrap();

        let mut lines = stdout.lines();
        let first = lines.next().unwrap();
        assert!(first.starts_with("deploy:upload web-1 /home/ubuntu/.deploy/ cb="));
        assert!(first.len() > "deploy:upload web-1 /home/ubuntu/.deploy/ cb=".len());
        assert_eq!(lines.next(), Some("archive.tar.gz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_captures_output() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let target = target_with(temp.path());

        let script = temp.path().join("failing-essh");
        std::fs::write(&script, "#!/bin/sh\necho 'no release to extract' >&2\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let transport = EsshTransport::with_binary_path(script.display().to_string());
        let err = transport
            .run(&target, &RemoteCommand::new("deploy:extract"), &CacheToken::empty(), &[])
            .await
            .unwrap_err();

        match err {
            DeployError::RemoteExec {
                subcommand,
                host,
                exit_code,
                output,
            } => {
                assert_eq!(subcommand, "deploy:extract");
                assert_eq!(host, "web-1");
                assert_eq!(exit_code, Some(3));
                assert!(output.contains("no release to extract"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
