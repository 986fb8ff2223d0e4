//! Deployment orchestrator.
//!
//! Sequences build → package → prepare → upload → extract for one run,
//! propagating the first failure. Each remote stage is its own round trip so
//! the failing stage is unambiguous. A failed stage is never compensated:
//! rollback only happens when the caller asks for it.

use std::future::Future;
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::adapters::{
    BuildExecutor, DockerExecutor, EsshTransport, RemoteCommand, RemoteTransport, StagedFile,
};
use crate::config::ResolvedConfig;
use crate::domain::{
    Artifact, BuildOutput, BuildSpec, DeploymentRun, Operation, RemoteTarget, Stage,
};
use crate::error::{DeployError, DeployFailure, Result};

use super::archiver;
use super::builder::ArtifactBuilder;
use super::cache::CacheMode;
use super::lease::TargetLease;
use super::timeouts::StageTimeouts;

/// Options for one deployment
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Artifact name (`archive` → `archive.tar.gz`)
    pub artifact_name: String,

    /// Remote cache policy for every command of the run
    pub cache: CacheMode,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            artifact_name: crate::domain::DEFAULT_ARTIFACT_NAME.to_string(),
            cache: CacheMode::Bust,
        }
    }
}

/// Outcome of a successful deployment
#[derive(Debug)]
pub struct DeployReport {
    /// The finished run, including its stage journal
    pub run: DeploymentRun,

    /// SHA-256 of the uploaded artifact
    pub artifact_digest: String,

    /// Size of the uploaded artifact
    pub artifact_size: u64,

    /// stdout of the extract command
    pub output: String,
}

/// Main deployment orchestrator
pub struct Orchestrator {
    executor: Box<dyn BuildExecutor>,
    transport: Box<dyn RemoteTransport>,
    timeouts: StageTimeouts,
    lease_dir: PathBuf,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over the given adapters
    pub fn new(
        executor: Box<dyn BuildExecutor>,
        transport: Box<dyn RemoteTransport>,
        lease_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            transport,
            timeouts: StageTimeouts::default(),
            lease_dir: lease_dir.into(),
            cancel: CancellationToken::new(),
        }
    }

    /// Production orchestrator: docker builds, essh transport
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self::new(
            Box::new(DockerExecutor::with_binary_path(&config.docker_binary)),
            Box::new(EsshTransport::with_binary_path(&config.remote_tool)),
            config.leases_dir(),
        )
        .with_timeouts(config.timeouts.clone())
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Share a cancellation token (e.g. with a Ctrl-C handler)
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run a stage or task future under its time budget and the cancellation token
    async fn guarded<T, F>(&self, operation: Operation, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled { operation });
        }

        let budget = self.timeouts.for_operation(&operation);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!(%operation, "Cancelled");
                Err(DeployError::Cancelled { operation })
            }
            result = tokio::time::timeout(budget, fut) => match result {
                Ok(inner) => inner,
                Err(_) => {
                    error!(%operation, seconds = budget.as_secs(), "Timed out");
                    Err(DeployError::Timeout { operation, seconds: budget.as_secs() })
                }
            },
        }
    }

    async fn acquire_lease(&self, target: &RemoteTarget, operation: &Operation) -> Result<TargetLease> {
        TargetLease::acquire(
            &self.lease_dir,
            &target.lease_key(),
            self.timeouts.lease_wait(),
            &self.cancel,
            operation,
        )
        .await
    }

    // ------------------------------------------------------------------
    // Standalone build operations
    // ------------------------------------------------------------------

    /// Build a spec outside of any run
    #[instrument(skip_all, fields(source = %spec.source.display()))]
    pub async fn build(&self, spec: &BuildSpec) -> Result<BuildOutput> {
        let builder = ArtifactBuilder::new(self.executor.as_ref());
        self.guarded(Stage::Built.into(), builder.build(spec)).await
    }

    /// Package a build output
    pub async fn archive(&self, output: &BuildOutput, name: &str) -> Result<Artifact> {
        self.guarded(Stage::Packaged.into(), archiver::archive(output, name)).await
    }

    /// Build and package in one go
    pub async fn export(&self, spec: &BuildSpec, name: &str) -> Result<Artifact> {
        let output = self.build(spec).await?;
        self.archive(&output, name).await
    }

    // ------------------------------------------------------------------
    // Run stages
    // ------------------------------------------------------------------

    /// Start a run against a target with a fresh cache token
    pub fn start_run(&self, target: &RemoteTarget, cache: CacheMode) -> DeploymentRun {
        DeploymentRun::new(&target.hostname, &target.deploy_path, cache.token())
    }

    /// Created → Built
    pub async fn build_stage(&self, run: &mut DeploymentRun, spec: &BuildSpec) -> Result<BuildOutput> {
        let timer = run.begin(Stage::Built)?;
        match self.build(spec).await {
            Ok(output) => {
                run.complete(timer);
                Ok(output)
            }
            Err(e) => {
                run.fail(timer, &e);
                Err(e)
            }
        }
    }

    /// Built → Packaged
    pub async fn package_stage(
        &self,
        run: &mut DeploymentRun,
        output: &BuildOutput,
        name: &str,
    ) -> Result<Artifact> {
        let timer = run.begin(Stage::Packaged)?;
        match self.archive(output, name).await {
            Ok(artifact) => {
                run.artifact_name = Some(artifact.name.clone());
                run.complete(timer);
                Ok(artifact)
            }
            Err(e) => {
                run.fail(timer, &e);
                Err(e)
            }
        }
    }

    /// Packaged → Prepared (`deploy:prepare`)
    pub async fn prepare(&self, run: &mut DeploymentRun, target: &RemoteTarget) -> Result<String> {
        self.remote_stage(run, target, Stage::Prepared, &[]).await
    }

    /// Prepared → Uploaded (`deploy:upload` with the artifact staged)
    pub async fn upload(
        &self,
        run: &mut DeploymentRun,
        target: &RemoteTarget,
        artifact: &Artifact,
    ) -> Result<String> {
        let staged = [StagedFile {
            name: artifact.name.clone(),
            source: artifact.path().to_path_buf(),
        }];
        self.remote_stage(run, target, Stage::Uploaded, &staged).await
    }

    /// Uploaded → Extracted (`deploy:extract`)
    pub async fn extract(&self, run: &mut DeploymentRun, target: &RemoteTarget) -> Result<String> {
        self.remote_stage(run, target, Stage::Extracted, &[]).await
    }

    /// Any → RolledBack, on explicit request only
    pub async fn rollback_run(&self, run: &mut DeploymentRun, target: &RemoteTarget) -> Result<String> {
        let _lease = self.acquire_lease(target, &Stage::RolledBack.into()).await?;
        self.remote_stage(run, target, Stage::RolledBack, &[]).await
    }

    async fn remote_stage(
        &self,
        run: &mut DeploymentRun,
        target: &RemoteTarget,
        stage: Stage,
        files: &[StagedFile],
    ) -> Result<String> {
        if run.hostname != target.hostname || run.deploy_path != target.deploy_path {
            return Err(DeployError::Config(format!(
                "Run {} belongs to '{}:{}', not '{}'",
                run.id, run.hostname, run.deploy_path, target
            )));
        }

        let timer = run.begin(stage)?;
        let command = RemoteCommand::new(stage.subcommand().unwrap_or(stage.as_str()));
        info!(run_id = %run.id, %stage, task = %command.task, host = %target.hostname, "Stage started");

        let result = self
            .guarded(
                stage.into(),
                self.transport.run(target, &command, &run.cache_token, files),
            )
            .await;

        match result {
            Ok(stdout) => {
                run.complete(timer);
                info!(run_id = %run.id, %stage, "Stage completed");
                Ok(stdout)
            }
            Err(e) => {
                error!(run_id = %run.id, %stage, error = %e, "Stage failed");
                run.fail(timer, &e);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // End-to-end operations
    // ------------------------------------------------------------------

    /// Build, package, prepare, upload and extract.
    ///
    /// Returns the extract stdout. The first failure aborts the run; a failed
    /// extract leaves the target partially deployed and is NOT rolled back.
    /// On failure the run journal up to that point travels with the error.
    #[instrument(skip_all, fields(host = %target.hostname, task = %spec.build_task))]
    pub async fn deploy(
        &self,
        spec: &BuildSpec,
        target: &RemoteTarget,
        options: &DeployOptions,
    ) -> Result<DeployReport, DeployFailure> {
        target.validate().map_err(DeployFailure::before_run)?;

        let mut run = self.start_run(target, options.cache);
        info!(
            run_id = %run.id,
            cache_busted = !run.cache_token.is_empty(),
            "Starting deployment"
        );

        match self.deploy_run(&mut run, spec, target, options).await {
            Ok((artifact, output)) => {
                info!(run_id = %run.id, artifact = %artifact.name, "Deployment completed");
                Ok(DeployReport {
                    run,
                    artifact_digest: artifact.digest.clone(),
                    artifact_size: artifact.size_bytes,
                    output,
                })
            }
            Err(error) => Err(DeployFailure::during(run, error)),
        }
    }

    async fn deploy_run(
        &self,
        run: &mut DeploymentRun,
        spec: &BuildSpec,
        target: &RemoteTarget,
        options: &DeployOptions,
    ) -> Result<(Artifact, String)> {
        let output = self.build_stage(run, spec).await?;
        let artifact = self
            .package_stage(run, &output, &options.artifact_name)
            .await?;
        drop(output);

        let _lease = match self.acquire_lease(target, &Stage::Prepared.into()).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Could not lease target");
                run.abort(Stage::Prepared, &e);
                return Err(e);
            }
        };

        self.prepare(run, target).await?;
        self.upload(run, target, &artifact).await?;
        let output = self.extract(run, target).await?;
        Ok((artifact, output))
    }

    /// Roll the target back to its previous release
    #[instrument(skip_all, fields(host = %target.hostname))]
    pub async fn rollback(&self, target: &RemoteTarget, cache: CacheMode) -> Result<String> {
        target.validate()?;
        let mut run = self.start_run(target, cache);
        self.rollback_run(&mut run, target).await
    }

    /// Run an arbitrary remote task: `<tool> <task> <hostname> <deploy_path>`
    #[instrument(skip_all, fields(host = %target.hostname, task = %task))]
    pub async fn run_task(&self, target: &RemoteTarget, task: &str, cache: CacheMode) -> Result<String> {
        target.validate()?;
        if task.trim().is_empty() || task.chars().any(char::is_whitespace) {
            return Err(DeployError::Config(format!("Invalid task name '{}'", task)));
        }

        // Tasks are not part of the stage chain; they share the remote-stage budget
        let operation = Operation::task(task);
        let _lease = self.acquire_lease(target, &operation).await?;
        let token = cache.token();
        let command = RemoteCommand::new(task);
        self.guarded(operation, self.transport.run(target, &command, &token, &[]))
            .await
    }
}
