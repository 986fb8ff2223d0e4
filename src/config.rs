//! Configuration for shipline.
//!
//! Configuration sources (highest priority first):
//! 1. CLI flags (applied by the caller on top of the resolved config)
//! 2. Environment variables (SHIPLINE_HOME, SHIPLINE_CONFIG)
//! 3. Config file (.shipline/config.yaml)
//! 4. Defaults (~/.shipline)
//!
//! Config file discovery:
//! - SHIPLINE_CONFIG names the file explicitly, otherwise the current
//!   directory and its parents are searched for .shipline/config.yaml
//! - Relative paths in the file resolve against the project root (the
//!   directory holding .shipline/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::{CacheMode, StageTimeouts};
use crate::domain::build_spec::{
    DEFAULT_BUILD_TASK, DEFAULT_NPM_VERSION, DEFAULT_OUTPUT_DIR, DEFAULT_RUNTIME_IMAGE,
    DEFAULT_RUNTIME_VERSION,
};
use crate::domain::{
    BuildSpec, CredentialBundle, IncludeKind, IncludeMapping, InstallMode, RemoteTarget,
    DEFAULT_ARTIFACT_NAME, DEFAULT_DEPLOY_PATH,
};
use crate::error::DeployError;

const HOME_ENV: &str = "SHIPLINE_HOME";
const CONFIG_ENV: &str = "SHIPLINE_CONFIG";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub timeouts: StageTimeouts,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .shipline/)
    pub home: Option<String>,
}

/// `build:` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfig {
    /// Project source tree (default: project root)
    pub source: Option<String>,
    pub runtime_version: Option<String>,
    pub runtime_image: Option<String>,
    pub npm_version: Option<String>,
    pub task: Option<String>,
    #[serde(default)]
    pub force_install: bool,
    pub output_dir: Option<String>,
    /// `dest:src,dest:src` directory inclusions
    pub include_dirs: Option<String>,
    /// `dest:src,dest:src` file inclusions
    pub include_files: Option<String>,
    pub artifact_name: Option<String>,
}

/// `remote:` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
    pub hostname: Option<String>,
    pub deploy_path: Option<String>,
    pub ssh_key: Option<String>,
    pub cloud_credentials: Option<String>,
    pub tool_config: Option<String>,
    /// Remote tool binary (default: essh)
    pub tool: Option<String>,
    #[serde(default)]
    pub cache_enabled: bool,
}

/// `docker:` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    pub binary: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to shipline home (leases)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Directory relative paths resolve against
    pub base_dir: PathBuf,
    pub build: BuildConfig,
    pub remote: RemoteConfig,
    pub timeouts: StageTimeouts,
    pub docker_binary: String,
    pub remote_tool: String,
}

impl ResolvedConfig {
    /// Directory holding per-target lease files
    pub fn leases_dir(&self) -> PathBuf {
        self.home.join("leases")
    }

    pub fn cache_mode(&self) -> CacheMode {
        CacheMode::from_cache_enabled(self.remote.cache_enabled)
    }

    pub fn artifact_name(&self) -> String {
        self.build
            .artifact_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ARTIFACT_NAME.to_string())
    }

    /// Build the BuildSpec described by the `build:` section.
    ///
    /// File inclusions are applied before directory inclusions.
    pub fn build_spec(&self) -> crate::error::Result<BuildSpec> {
        let build = &self.build;
        let source = match &build.source {
            Some(source) => resolve_path(&self.base_dir, source),
            None => self.base_dir.clone(),
        };

        let mut includes = Vec::new();
        if let Some(raw) = &build.include_files {
            includes.extend(IncludeMapping::parse_list(IncludeKind::File, raw)?);
        }
        if let Some(raw) = &build.include_dirs {
            includes.extend(IncludeMapping::parse_list(IncludeKind::Directory, raw)?);
        }

        let mut spec = BuildSpec::new(source)
            .with_runtime_version(or_default(&build.runtime_version, DEFAULT_RUNTIME_VERSION))
            .with_build_task(or_default(&build.task, DEFAULT_BUILD_TASK))
            .with_install_mode(InstallMode::from_force_flag(build.force_install))
            .with_includes(includes);
        spec.runtime_image = or_default(&build.runtime_image, DEFAULT_RUNTIME_IMAGE);
        spec.npm_version = or_default(&build.npm_version, DEFAULT_NPM_VERSION);
        spec.output_dir = or_default(&build.output_dir, DEFAULT_OUTPUT_DIR);

        Ok(spec)
    }

    /// Build the RemoteTarget described by the `remote:` section
    pub fn remote_target(&self) -> crate::error::Result<RemoteTarget> {
        let remote = &self.remote;
        let hostname = remote
            .hostname
            .clone()
            .ok_or_else(|| DeployError::Config("remote.hostname is not set".to_string()))?;

        let credential = |field: &str, value: &Option<String>| {
            value
                .as_deref()
                .map(|p| resolve_path(&self.base_dir, p))
                .ok_or_else(|| DeployError::Config(format!("remote.{} is not set", field)))
        };

        RemoteTarget::new(
            hostname,
            or_default(&remote.deploy_path, DEFAULT_DEPLOY_PATH),
            CredentialBundle {
                ssh_key: credential("ssh_key", &remote.ssh_key)?,
                cloud_credentials: credential("cloud_credentials", &remote.cloud_credentials)?,
                tool_config: credential("tool_config", &remote.tool_config)?,
            },
        )
    }
}

fn or_default(value: &Option<String>, default: &str) -> String {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

impl ConfigFile {
    /// Reject values that can never produce a valid run
    pub fn validate(&self) -> Result<()> {
        let build = &self.build;
        for (field, value) in [
            ("build.runtime_version", &build.runtime_version),
            ("build.task", &build.task),
            ("build.output_dir", &build.output_dir),
            ("build.npm_version", &build.npm_version),
            ("remote.hostname", &self.remote.hostname),
            ("remote.deploy_path", &self.remote.deploy_path),
        ] {
            if matches!(value, Some(v) if v.trim().is_empty()) {
                anyhow::bail!("{} cannot be empty", field);
            }
        }

        if let Some(raw) = &build.include_dirs {
            IncludeMapping::parse_list(IncludeKind::Directory, raw)
                .context("Invalid build.include_dirs")?;
        }
        if let Some(raw) = &build.include_files {
            IncludeMapping::parse_list(IncludeKind::File, raw)
                .context("Invalid build.include_files")?;
        }

        self.timeouts.validate().context("Invalid timeouts")?;
        Ok(())
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".shipline").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(config)
}

/// Resolve a path that may be relative to `base` or start with `~/`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve configuration from an optional file and an optional home override
fn resolve(config_file: Option<PathBuf>, env_home: Option<PathBuf>) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".shipline");

    let (file, base_dir, file_home) = match &config_file {
        Some(config_path) => {
            let file = load_config_file(config_path)?;

            // .shipline/ and the project root above it
            let shipline_dir = config_path.parent().unwrap_or(Path::new("."));
            let base_dir = shipline_dir.parent().unwrap_or(Path::new(".")).to_path_buf();
            let file_home = file
                .paths
                .home
                .as_deref()
                .map(|home| resolve_path(shipline_dir, home));

            (file, base_dir, file_home)
        }
        None => (
            ConfigFile::default(),
            std::env::current_dir().context("Failed to determine current directory")?,
            None,
        ),
    };

    let home = env_home.or(file_home).unwrap_or(default_home);

    Ok(ResolvedConfig {
        home,
        config_file,
        base_dir,
        docker_binary: or_default(&file.docker.binary, "docker"),
        remote_tool: or_default(&file.remote.tool, "essh"),
        build: file.build,
        remote: file.remote,
        timeouts: file.timeouts,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let config_file = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            let path = PathBuf::from(path);
            if !path.is_file() {
                anyhow::bail!("{} points to a missing file: {}", CONFIG_ENV, path.display());
            }
            Some(path)
        }
        Err(_) => find_config_file(),
    };

    let env_home = std::env::var(HOME_ENV).ok().map(PathBuf::from);
    resolve(config_file, env_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Load configuration from an explicit file, bypassing discovery
pub fn load_from(path: &Path) -> Result<ResolvedConfig> {
    let env_home = std::env::var(HOME_ENV).ok().map(PathBuf::from);
    resolve(Some(path.to_path_buf()), env_home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(contents: &str) -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".shipline");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", contents).unwrap();
        (temp, path)
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, None).unwrap();

        let expected_home = dirs::home_dir().unwrap().join(".shipline");
        assert_eq!(config.home, expected_home);
        assert_eq!(config.leases_dir(), expected_home.join("leases"));
        assert_eq!(config.remote_tool, "essh");
        assert_eq!(config.docker_binary, "docker");
        assert_eq!(config.cache_mode(), CacheMode::Bust);
        assert_eq!(config.artifact_name(), "archive");
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_env_home_wins() {
        let (_temp, path) = write_config("paths:\n  home: ./state\n");
        let config = resolve(Some(path), Some(PathBuf::from("/var/shipline"))).unwrap();
        assert_eq!(config.home, PathBuf::from("/var/shipline"));
    }

    #[test]
    fn test_config_file_parsing() {
        let (temp, path) = write_config(
            r#"
version: "1.0"
paths:
  home: ./state
build:
  task: build:staging
  force_install: true
  include_dirs: "certs:src/certs,config:src/config"
  include_files: "robots.txt:static/robots.txt"
remote:
  hostname: web-1
  ssh_key: keys/id_rsa
  cloud_credentials: keys/aws
  tool_config: keys/config.lua
  cache_enabled: true
timeouts:
  build_seconds: 900
"#,
        );

        let config = resolve(Some(path), None).unwrap();
        assert_eq!(config.home, temp.path().join(".shipline").join("state"));
        assert_eq!(config.timeouts.build_seconds, 900);
        assert_eq!(config.timeouts.stage_seconds, 300);
        assert_eq!(config.cache_mode(), CacheMode::Reuse);

        let spec = config.build_spec().unwrap();
        assert_eq!(spec.build_task, "build:staging");
        assert_eq!(spec.install_mode, InstallMode::Forced);
        assert_eq!(spec.image(), "node:20.9.0-slim");
        // files first, then directories
        let destinations: Vec<_> = spec.includes.iter().map(|i| i.destination.as_str()).collect();
        assert_eq!(destinations, vec!["robots.txt", "certs", "config"]);

        let target = config.remote_target().unwrap();
        assert_eq!(target.hostname, "web-1");
        assert_eq!(target.deploy_path, DEFAULT_DEPLOY_PATH);
        assert_eq!(target.credentials.ssh_key, temp.path().join("keys/id_rsa"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_temp, path) = write_config("build:\n  include_dirs: \"certs\"\n");
        assert!(resolve(Some(path), None).is_err());

        let (_temp, path) = write_config("timeouts:\n  stage_seconds: 0\n");
        assert!(resolve(Some(path), None).is_err());

        let (_temp, path) = write_config("build:\n  task: \"  \"\n");
        assert!(resolve(Some(path), None).is_err());

        let (_temp, path) = write_config("unknown_section: {}\n");
        assert!(resolve(Some(path), None).is_err());
    }

    #[test]
    fn test_remote_target_requires_hostname() {
        let config = resolve(None, None).unwrap();
        assert!(matches!(config.remote_target(), Err(DeployError::Config(_))));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            resolve_path(&base, "~/keys/id_rsa"),
            dirs::home_dir().unwrap().join("keys/id_rsa")
        );
    }
}
