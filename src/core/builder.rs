//! Artifact builder.
//!
//! Runs a BuildSpec inside a fresh build environment:
//! 1. copy the source tree into `/src`
//! 2. install the pinned npm, then dependencies, then `npm run <task>`
//! 3. extract the base output directory
//! 4. merge include mappings on top, in order (last write wins)
//!
//! Any non-zero exit is fatal and names the failing command. The environment
//! is discarded on every path out of the build.

use std::path::Path;

use tempfile::TempDir;
use tracing::{error, info, instrument, warn};

use crate::adapters::{resolve_env_path, BuildEnvironment, BuildExecutor, WORKDIR};
use crate::core::fs_util;
use crate::domain::{BuildOutput, BuildSpec, IncludeKind};
use crate::error::{DeployError, Result};

/// Builds BuildSpecs through a build executor
pub struct ArtifactBuilder<'a> {
    executor: &'a dyn BuildExecutor,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(executor: &'a dyn BuildExecutor) -> Self {
        Self { executor }
    }

    /// Execute a build and return its output tree
    #[instrument(skip(self, spec), fields(executor = self.executor.name(), task = %spec.build_task))]
    pub async fn build(&self, spec: &BuildSpec) -> Result<BuildOutput> {
        spec.validate()?;

        let image = spec.image();
        let mut env = self
            .executor
            .new_environment(&image)
            .await
            .map_err(|e| executor_error(format!("start {}", image), e))?;

        let result = self.build_in(env.as_mut(), spec).await;

        if let Err(e) = env.discard().await {
            warn!(error = %e, "Failed to discard build environment");
        }

        result
    }

    async fn build_in(&self, env: &mut dyn BuildEnvironment, spec: &BuildSpec) -> Result<BuildOutput> {
        env.with_directory(WORKDIR, &spec.source)
            .await
            .map_err(|e| executor_error("copy source", e))?;

        for argv in spec.commands() {
            let step = argv.join(" ");
            info!(%step, "Running build step");

            let output = env
                .run(&argv)
                .await
                .map_err(|e| executor_error(step.clone(), e))?;

            if !output.success() {
                error!(%step, exit_code = ?output.exit_code, "Build step failed");
                let detail = if output.stderr.trim().is_empty() {
                    output.stdout.trim().to_string()
                } else {
                    output.stderr.trim().to_string()
                };
                return Err(DeployError::Build {
                    step,
                    exit_code: output.exit_code,
                    output: detail,
                });
            }
        }

        let out_dir = TempDir::new().map_err(|e| DeployError::Build {
            step: "create output directory".to_string(),
            exit_code: None,
            output: e.to_string(),
        })?;

        let base = resolve_env_path(&spec.output_dir);
        env.extract_dir(&base, out_dir.path())
            .await
            .map_err(|e| executor_error(format!("extract {}", base), e))?;

        for include in &spec.includes {
            let source = resolve_env_path(&include.source);
            let dest = out_dir.path().join(&include.destination);
            let step = format!("include {} <- {}", include.destination, source);

            fs_util::prepare_parents(out_dir.path(), Path::new(&include.destination))
                .map_err(|e| executor_error(step.clone(), e.into()))?;
            let copied = match include.kind {
                IncludeKind::Directory => env.extract_dir(&source, &dest).await,
                IncludeKind::File => env.extract_file(&source, &dest).await,
            };
            copied.map_err(|e| executor_error(step, e))?;
        }

        info!(includes = spec.includes.len(), "Build output ready");
        Ok(BuildOutput::new(out_dir))
    }
}

fn executor_error(step: impl Into<String>, err: anyhow::Error) -> DeployError {
    DeployError::Build {
        step: step.into(),
        exit_code: None,
        output: format!("{:#}", err),
    }
}
