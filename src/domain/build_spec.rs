//! Build job description.
//!
//! A BuildSpec is immutable once constructed and consumed by exactly one
//! build. Include mappings are parsed from `dest:src` pairs joined by commas.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

pub const DEFAULT_RUNTIME_VERSION: &str = "20.9.0";
pub const DEFAULT_BUILD_TASK: &str = "build:prod";
pub const DEFAULT_NPM_VERSION: &str = "10.8.2";
pub const DEFAULT_RUNTIME_IMAGE: &str = "node";
pub const DEFAULT_OUTPUT_DIR: &str = "dist";

/// Package-manager install mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMode {
    #[default]
    Normal,
    /// Append `--force` to override lockfile/peer conflicts
    Forced,
}

impl InstallMode {
    pub fn from_force_flag(force: bool) -> Self {
        if force {
            Self::Forced
        } else {
            Self::Normal
        }
    }

    /// Argument vector for the dependency install step
    pub fn install_command(self) -> Vec<String> {
        let mut argv = vec!["npm".to_string(), "install".to_string()];
        if self == Self::Forced {
            argv.push("--force".to_string());
        }
        argv
    }
}

/// Whether an include mapping copies a single file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeKind {
    File,
    Directory,
}

/// One `destination <- source` inclusion into the build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeMapping {
    pub kind: IncludeKind,

    /// Path relative to the build output root
    pub destination: String,

    /// Path inside the build environment (relative to the work directory)
    pub source: String,
}

impl IncludeMapping {
    pub fn directory(destination: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: IncludeKind::Directory,
            destination: destination.into(),
            source: source.into(),
        }
    }

    pub fn file(destination: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            kind: IncludeKind::File,
            destination: destination.into(),
            source: source.into(),
        }
    }

    /// Parse a comma-separated list of `dest:src` pairs.
    ///
    /// An empty string yields no mappings. Entries keep their order.
    pub fn parse_list(kind: IncludeKind, raw: &str) -> Result<Vec<Self>> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        raw.split(',')
            .map(|entry| {
                let entry = entry.trim();
                let (destination, source) = entry.split_once(':').ok_or_else(|| {
                    DeployError::Config(format!(
                        "Include mapping '{}' must have the form dest:src",
                        entry
                    ))
                })?;

                let destination = destination.trim().trim_start_matches('/');
                let source = source.trim();
                if destination.is_empty() || source.is_empty() {
                    return Err(DeployError::Config(format!(
                        "Include mapping '{}' has an empty side",
                        entry
                    )));
                }
                if destination.split('/').any(|part| part == "..") {
                    return Err(DeployError::Config(format!(
                        "Include destination '{}' escapes the output directory",
                        destination
                    )));
                }

                Ok(Self {
                    kind,
                    destination: destination.to_string(),
                    source: source.to_string(),
                })
            })
            .collect()
    }
}

/// A build job description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Source tree on the host
    pub source: PathBuf,

    /// Runtime version the build image is pinned to
    pub runtime_version: String,

    /// Runtime image repository; the image is `<repo>:<version>-slim`
    pub runtime_image: String,

    /// npm version installed before dependencies
    pub npm_version: String,

    /// Dependency install mode
    pub install_mode: InstallMode,

    /// Task passed to `npm run`
    pub build_task: String,

    /// Base output directory inside the work directory
    pub output_dir: String,

    /// Ordered inclusions; later entries overwrite earlier ones
    pub includes: Vec<IncludeMapping>,
}

impl BuildSpec {
    /// Create a spec with default runtime, task and no includes
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            runtime_version: DEFAULT_RUNTIME_VERSION.to_string(),
            runtime_image: DEFAULT_RUNTIME_IMAGE.to_string(),
            npm_version: DEFAULT_NPM_VERSION.to_string(),
            install_mode: InstallMode::Normal,
            build_task: DEFAULT_BUILD_TASK.to_string(),
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            includes: Vec::new(),
        }
    }

    pub fn with_build_task(mut self, task: impl Into<String>) -> Self {
        self.build_task = task.into();
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = version.into();
        self
    }

    pub fn with_install_mode(mut self, mode: InstallMode) -> Self {
        self.install_mode = mode;
        self
    }

    pub fn with_includes(mut self, includes: Vec<IncludeMapping>) -> Self {
        self.includes = includes;
        self
    }

    /// Full image reference for the build environment
    pub fn image(&self) -> String {
        format!("{}:{}-slim", self.runtime_image, self.runtime_version)
    }

    /// Ordered list of commands the build runs
    pub fn commands(&self) -> Vec<Vec<String>> {
        vec![
            vec![
                "npm".to_string(),
                "install".to_string(),
                "-g".to_string(),
                format!("npm@{}", self.npm_version),
            ],
            self.install_mode.install_command(),
            vec![
                "npm".to_string(),
                "run".to_string(),
                self.build_task.clone(),
            ],
        ]
    }

    /// Validate the spec
    pub fn validate(&self) -> Result<()> {
        if self.runtime_version.trim().is_empty() {
            return Err(DeployError::Config("Runtime version cannot be empty".to_string()));
        }
        if self.build_task.trim().is_empty() {
            return Err(DeployError::Config("Build task cannot be empty".to_string()));
        }
        if self.output_dir.trim().is_empty() {
            return Err(DeployError::Config("Output directory cannot be empty".to_string()));
        }
        if !self.source.is_dir() {
            return Err(DeployError::Config(format!(
                "Source directory does not exist: {}",
                self.source.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_include_dirs() {
        let includes =
            IncludeMapping::parse_list(IncludeKind::Directory, "certs:src/certs,config:src/config")
                .unwrap();

        assert_eq!(
            includes,
            vec![
                IncludeMapping::directory("certs", "src/certs"),
                IncludeMapping::directory("config", "src/config"),
            ]
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert!(IncludeMapping::parse_list(IncludeKind::File, "").unwrap().is_empty());
        assert!(IncludeMapping::parse_list(IncludeKind::File, "   ").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        assert!(IncludeMapping::parse_list(IncludeKind::File, "certs").is_err());
        assert!(IncludeMapping::parse_list(IncludeKind::File, ":src/certs").is_err());
        assert!(IncludeMapping::parse_list(IncludeKind::File, "../etc:src/x").is_err());
    }

    #[test]
    fn test_parse_keeps_absolute_source() {
        let includes =
            IncludeMapping::parse_list(IncludeKind::Directory, "node_modules:/src/node_modules")
                .unwrap();
        assert_eq!(includes[0].source, "/src/node_modules");
    }

    #[test]
    fn test_install_mode_force_flag() {
        assert_eq!(InstallMode::Normal.install_command(), vec!["npm", "install"]);
        assert_eq!(
            InstallMode::from_force_flag(true).install_command(),
            vec!["npm", "install", "--force"]
        );
    }

    #[test]
    fn test_default_commands_and_image() {
        let spec = BuildSpec::new("/tmp/app");

        assert_eq!(spec.image(), "node:20.9.0-slim");
        let commands = spec.commands();
        assert_eq!(commands[0], vec!["npm", "install", "-g", "npm@10.8.2"]);
        assert_eq!(commands[2], vec!["npm", "run", "build:prod"]);
    }
}
