//! Command-line interface for shipline.
//!
//! Provides commands for building and exporting artifacts, deploying them to
//! a remote target, rolling a target back and running arbitrary remote tasks.
//! Flags override the resolved configuration field by field.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{self, ResolvedConfig};
use crate::core::{DeployOptions, DeployReport, Orchestrator};
use crate::domain::{DeploymentRun, Stage};
use crate::error::DeployFailure;
use crate::domain::artifact::artifact_file_name;

/// shipline - build, package and deploy Node applications
#[derive(Parser, Debug)]
#[command(name = "shipline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (overrides discovery of .shipline/config.yaml)
    #[arg(long, global = true, env = "SHIPLINE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build the project and copy the output tree to a directory
    Build {
        #[command(flatten)]
        build: BuildArgs,

        /// Directory to write the build output to
        #[arg(short, long, default_value = "build-output")]
        out: PathBuf,
    },

    /// Build and package the project into <name>.tar.gz
    Export {
        #[command(flatten)]
        build: BuildArgs,

        /// Artifact name
        #[arg(short, long)]
        name: Option<String>,

        /// Directory to write the artifact to
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Build, package, upload and extract on the remote target
    Deploy {
        #[command(flatten)]
        build: BuildArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Artifact name
        #[arg(short, long)]
        name: Option<String>,

        /// Write the run's stage journal as JSON to this file
        #[arg(long)]
        journal: Option<PathBuf>,
    },

    /// Roll the remote target back to its previous release
    Rollback {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Run an arbitrary remote task against the target
    Task {
        /// Task name (e.g. "db:migrate")
        task: String,

        #[command(flatten)]
        target: TargetArgs,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Build overrides
#[derive(Args, Debug, Default)]
pub struct BuildArgs {
    /// Project source directory
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// npm script to run
    #[arg(long)]
    pub task: Option<String>,

    /// Node runtime version
    #[arg(long)]
    pub runtime_version: Option<String>,

    /// Pass --force to npm install
    #[arg(long, overrides_with = "no_force_install")]
    pub force_install: bool,

    /// Plain npm install, even if the config forces it
    #[arg(long, overrides_with = "force_install")]
    pub no_force_install: bool,

    /// Directory inclusions, "dest:src,dest:src"
    #[arg(long)]
    pub include_dirs: Option<String>,

    /// File inclusions, "dest:src,dest:src"
    #[arg(long)]
    pub include_files: Option<String>,
}

/// Target overrides
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Remote hostname
    #[arg(long)]
    pub host: Option<String>,

    /// Remote deploy path
    #[arg(long)]
    pub deploy_path: Option<String>,

    /// SSH private key
    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Cloud credentials file
    #[arg(long)]
    pub cloud_credentials: Option<PathBuf>,

    /// Remote tool config
    #[arg(long)]
    pub tool_config: Option<PathBuf>,

    /// Let the remote side reuse cached results
    #[arg(long, overrides_with = "no_cache")]
    pub cache_enabled: bool,

    /// Bust the remote cache, even if the config enables it
    #[arg(long, overrides_with = "cache_enabled")]
    pub no_cache: bool,
}

impl BuildArgs {
    fn apply(self, cfg: &mut ResolvedConfig) -> Result<()> {
        let build = &mut cfg.build;
        if let Some(source) = self.source {
            build.source = Some(absolute(&source)?);
        }
        if self.task.is_some() {
            build.task = self.task;
        }
        if self.runtime_version.is_some() {
            build.runtime_version = self.runtime_version;
        }
        if self.force_install {
            build.force_install = true;
        } else if self.no_force_install {
            build.force_install = false;
        }
        if self.include_dirs.is_some() {
            build.include_dirs = self.include_dirs;
        }
        if self.include_files.is_some() {
            build.include_files = self.include_files;
        }
        Ok(())
    }
}

impl TargetArgs {
    fn apply(self, cfg: &mut ResolvedConfig) -> Result<()> {
        let remote = &mut cfg.remote;
        if self.host.is_some() {
            remote.hostname = self.host;
        }
        if self.deploy_path.is_some() {
            remote.deploy_path = self.deploy_path;
        }
        if let Some(path) = self.ssh_key {
            remote.ssh_key = Some(absolute(&path)?);
        }
        if let Some(path) = self.cloud_credentials {
            remote.cloud_credentials = Some(absolute(&path)?);
        }
        if let Some(path) = self.tool_config {
            remote.tool_config = Some(absolute(&path)?);
        }
        if self.cache_enabled {
            remote.cache_enabled = true;
        } else if self.no_cache {
            remote.cache_enabled = false;
        }
        Ok(())
    }
}

/// CLI paths are relative to the working directory, not the project root
fn absolute(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to determine current directory")?
            .join(path)
    };
    Ok(path.to_string_lossy().into_owned())
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut cfg = match &self.config {
            Some(path) => config::load_from(path)?,
            None => config::config()?.clone(),
        };

        match self.command {
            Commands::Build { build, out } => {
                build.apply(&mut cfg)?;
                run_build(&cfg, &out).await
            }
            Commands::Export { build, name, out } => {
                build.apply(&mut cfg)?;
                if name.is_some() {
                    cfg.build.artifact_name = name;
                }
                run_export(&cfg, &out).await
            }
            Commands::Deploy {
                build,
                target,
                name,
                journal,
            } => {
                build.apply(&mut cfg)?;
                target.apply(&mut cfg)?;
                if name.is_some() {
                    cfg.build.artifact_name = name;
                }
                run_deploy(&cfg, journal.as_deref()).await
            }
            Commands::Rollback { target } => {
                target.apply(&mut cfg)?;
                run_rollback(&cfg).await
            }
            Commands::Task { task, target } => {
                target.apply(&mut cfg)?;
                run_task(&cfg, &task).await
            }
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Orchestrator wired to a Ctrl-C handler
fn orchestrator(cfg: &ResolvedConfig) -> Orchestrator {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling current stage");
            on_signal.cancel();
        }
    });

    Orchestrator::from_config(cfg).with_cancellation(cancel)
}

async fn run_build(cfg: &ResolvedConfig, out: &Path) -> Result<()> {
    let spec = cfg.build_spec()?;
    let output = orchestrator(cfg).build(&spec).await?;

    output
        .persist_to(out)
        .with_context(|| format!("Failed to write build output to {}", out.display()))?;

    eprintln!("[Build output written to {}]", out.display());
    Ok(())
}

async fn run_export(cfg: &ResolvedConfig, out: &Path) -> Result<()> {
    let spec = cfg.build_spec()?;
    let artifact = orchestrator(cfg).export(&spec, &cfg.artifact_name()).await?;

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create {}", out.display()))?;
    let dest = out.join(artifact_file_name(&artifact.name));
    std::fs::copy(artifact.path(), &dest)
        .with_context(|| format!("Failed to write artifact to {}", dest.display()))?;

    println!("{}", dest.display());
    eprintln!(
        "[{} bytes, sha256 {}]",
        artifact.size_bytes, artifact.digest
    );
    Ok(())
}

async fn run_deploy(cfg: &ResolvedConfig, journal: Option<&Path>) -> Result<()> {
    let spec = cfg.build_spec()?;
    let target = cfg.remote_target()?;
    let options = DeployOptions {
        artifact_name: cfg.artifact_name(),
        cache: cfg.cache_mode(),
    };

    let result = orchestrator(cfg).deploy(&spec, &target, &options).await;
    if let Some(path) = journal {
        if let Err(e) = write_journal(&result, path) {
            if result.is_ok() {
                return Err(e);
            }
            // keep the deploy error as the one reported
            warn!(error = %e, "Failed to write journal");
        }
    }

    match result {
        Ok(report) => {
            print!("{}", report.output);
            eprintln!(
                "\n[Run {} deployed to {} via {} (sha256 {})]",
                report.run.id,
                target,
                stage_trail(&report.run),
                report.artifact_digest
            );
            Ok(())
        }
        Err(failure) => {
            if let Some(run) = &failure.run {
                eprintln!("[Run {} stopped after {}]", run.id, stage_trail(run));
            }
            Err(failure.error.into())
        }
    }
}

/// Write the run journal, whether the deployment succeeded or not
fn write_journal(result: &std::result::Result<DeployReport, DeployFailure>, path: &Path) -> Result<()> {
    let run = match result {
        Ok(report) => &report.run,
        Err(failure) => match &failure.run {
            Some(run) => run.as_ref(),
            None => return Ok(()),
        },
    };

    let json = serde_json::to_string_pretty(run)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write journal to {}", path.display()))
}

fn stage_trail(run: &DeploymentRun) -> String {
    let stages: Vec<&str> = run.stages_started().into_iter().map(Stage::as_str).collect();
    if stages.is_empty() {
        "no stages".to_string()
    } else {
        stages.join(" -> ")
    }
}

async fn run_rollback(cfg: &ResolvedConfig) -> Result<()> {
    let target = cfg.remote_target()?;
    let output = orchestrator(cfg).rollback(&target, cfg.cache_mode()).await?;

    print!("{}", output);
    eprintln!("\n[{} rolled back]", target);
    Ok(())
}

async fn run_task(cfg: &ResolvedConfig, task: &str) -> Result<()> {
    let target = cfg.remote_target()?;
    let output = orchestrator(cfg)
        .run_task(&target, task, cfg.cache_mode())
        .await?;

    print!("{}", output);
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("Shipline Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:    {}", cfg.home.display());
    println!("  Leases:  {}", cfg.leases_dir().display());
    println!("  Project: {}", cfg.base_dir.display());
    println!();

    let spec = cfg.build_spec()?;
    println!("Build:");
    println!("  Source:   {}", spec.source.display());
    println!("  Image:    {}", spec.image());
    println!("  npm:      {}", spec.npm_version);
    println!("  Task:     {}", spec.build_task);
    println!("  Install:  {:?}", spec.install_mode);
    println!("  Output:   {}", spec.output_dir);
    println!("  Artifact: {}", artifact_file_name(&cfg.artifact_name()));
    for include in &spec.includes {
        println!(
            "  Include:  {:?} {} <- {}",
            include.kind, include.destination, include.source
        );
    }
    println!();
    println!("Remote:");
    match cfg.remote_target() {
        Ok(target) => {
            println!("  Target:   {}", target);
            println!("  Key:      {}", target.credentials.ssh_key.display());
        }
        Err(e) => println!("  (not configured: {})", e),
    }
    println!("  Tool:     {}", cfg.remote_tool);
    println!("  Cache:    {:?}", cfg.cache_mode());
    println!();
    println!("Timeouts:");
    println!("  Build:      {}s", cfg.timeouts.build_seconds);
    println!("  Package:    {}s", cfg.timeouts.package_seconds);
    println!("  Stage:      {}s", cfg.timeouts.stage_seconds);
    println!("  Lease wait: {}s", cfg.timeouts.lease_wait_seconds);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_deploy_flags() {
        let cli = Cli::try_parse_from([
            "shipline",
            "deploy",
            "--host",
            "web-1",
            "--include-dirs",
            "certs:src/certs",
            "--force-install",
        ])
        .unwrap();

        match cli.command {
            Commands::Deploy { build, target, .. } => {
                assert_eq!(target.host.as_deref(), Some("web-1"));
                assert!(!target.cache_enabled);
                assert!(build.force_install);
                assert_eq!(build.include_dirs.as_deref(), Some("certs:src/certs"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_flags_override_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "build:\n  task: build:prod\nremote:\n  hostname: old\n").unwrap();
        let mut cfg = crate::config::load_from(&path).unwrap();

        BuildArgs {
            task: Some("build:staging".to_string()),
            ..Default::default()
        }
        .apply(&mut cfg)
        .unwrap();
        TargetArgs {
            host: Some("web-2".to_string()),
            cache_enabled: true,
            ..Default::default()
        }
        .apply(&mut cfg)
        .unwrap();

        assert_eq!(cfg.build.task.as_deref(), Some("build:staging"));
        assert_eq!(cfg.remote.hostname.as_deref(), Some("web-2"));
        assert!(cfg.remote.cache_enabled);
    }

    #[test]
    fn test_negative_flags_turn_config_settings_off() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "build:\n  force_install: true\nremote:\n  cache_enabled: true\n",
        )
        .unwrap();
        let mut cfg = crate::config::load_from(&path).unwrap();
        assert!(cfg.remote.cache_enabled);

        let cli = Cli::try_parse_from([
            "shipline",
            "deploy",
            "--no-cache",
            "--no-force-install",
        ])
        .unwrap();
        let Commands::Deploy { build, target, .. } = cli.command else {
            panic!("expected deploy");
        };
        build.apply(&mut cfg).unwrap();
        target.apply(&mut cfg).unwrap();

        assert!(!cfg.remote.cache_enabled);
        assert!(!cfg.build.force_install);
        assert_eq!(cfg.cache_mode(), crate::core::CacheMode::Bust);
    }

    #[test]
    fn test_last_cache_flag_wins() {
        let cli = Cli::try_parse_from(["shipline", "task", "db:migrate", "--no-cache", "--cache-enabled"])
            .unwrap();
        let Commands::Task { target, .. } = cli.command else {
            panic!("expected task");
        };
        assert!(target.cache_enabled);
        assert!(!target.no_cache);
    }

    #[test]
    fn test_journal_written_for_failed_deploy() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("journal.json");

        let mut run = DeploymentRun::new("web-1", "/srv", crate::core::CacheToken::empty());
        let timer = run.begin(Stage::Built).unwrap();
        let error = crate::error::DeployError::Build {
            step: "npm install".to_string(),
            exit_code: Some(1),
            output: "ERESOLVE".to_string(),
        };
        run.fail(timer, &error);
        let result = Err(DeployFailure::during(run, error));

        write_journal(&result, &path).unwrap();

        let journal: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(journal["state"]["status"], "failed");
        assert_eq!(journal["state"]["stage"], "built");
        assert!(!journal["events"].as_array().unwrap().is_empty());
    }
}
