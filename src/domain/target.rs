//! Remote deployment targets and their credentials.
//!
//! Credential material is read-only input: paths are held here and read
//! fresh by the transport on every call. Nothing is cached or persisted.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, Result};

pub const DEFAULT_DEPLOY_PATH: &str = "/home/ubuntu/.deploy/";

/// Files needed to authenticate against a target
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    /// SSH private key
    pub ssh_key: PathBuf,

    /// Cloud credentials file
    pub cloud_credentials: PathBuf,

    /// Remote tool configuration
    pub tool_config: PathBuf,
}

// Paths only; contents are never formatted
impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("ssh_key", &self.ssh_key)
            .field("cloud_credentials", &self.cloud_credentials)
            .field("tool_config", &self.tool_config)
            .finish()
    }
}

/// A remote host plus the path deployments land in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub hostname: String,
    pub deploy_path: String,
    pub credentials: CredentialBundle,
}

impl RemoteTarget {
    /// Build a validated target
    pub fn new(
        hostname: impl Into<String>,
        deploy_path: impl Into<String>,
        credentials: CredentialBundle,
    ) -> Result<Self> {
        let target = Self {
            hostname: hostname.into(),
            deploy_path: deploy_path.into(),
            credentials,
        };
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<()> {
        let host = self.hostname.trim();
        if host.is_empty() {
            return Err(DeployError::Config("Target hostname cannot be empty".to_string()));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(DeployError::Config(format!(
                "Target hostname '{}' contains whitespace",
                self.hostname
            )));
        }
        if self.deploy_path.trim().is_empty() {
            return Err(DeployError::Config("Deploy path cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Stable key identifying this target for leasing
    pub fn lease_key(&self) -> String {
        format!("{}:{}", self.hostname, self.deploy_path)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.deploy_path)
    }
}
