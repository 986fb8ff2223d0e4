//! Time budgets for pipeline stages.
//!
//! Every build-executor and remote-transport call is a blocking round trip.
//! Without a budget a hung remote call would block the run forever, so each
//! stage is bounded:
//! - Build: the whole install + build sequence
//! - Remote stages: prepare, upload, extract, rollback, tasks
//! - Lease wait: how long to wait for another run to release a target

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Operation, Stage};
use crate::error::{DeployError, Result};

/// Per-stage time budgets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Build timeout in seconds (default: 1800 = 30 min)
    #[serde(default = "default_build_timeout")]
    pub build_seconds: u64,

    /// Packaging timeout in seconds (default: 600)
    #[serde(default = "default_package_timeout")]
    pub package_seconds: u64,

    /// Per remote stage timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_stage_timeout")]
    pub stage_seconds: u64,

    /// Maximum wait for a target lease in seconds (default: 120)
    #[serde(default = "default_lease_wait")]
    pub lease_wait_seconds: u64,
}

fn default_build_timeout() -> u64 {
    1800
}
fn default_package_timeout() -> u64 {
    600
}
fn default_stage_timeout() -> u64 {
    300
}
fn default_lease_wait() -> u64 {
    120
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            build_seconds: default_build_timeout(),
            package_seconds: default_package_timeout(),
            stage_seconds: default_stage_timeout(),
            lease_wait_seconds: default_lease_wait(),
        }
    }
}

impl StageTimeouts {
    /// Budget for a stage
    /// Budget for a stage or task; remote tasks share the remote-stage budget
    pub fn for_operation(&self, operation: &Operation) -> Duration {
        let seconds = match operation.stage() {
            Some(Stage::Built) => self.build_seconds,
            Some(Stage::Packaged) => self.package_seconds,
            _ => self.stage_seconds,
        };
        Duration::from_secs(seconds)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait_seconds)
    }

    /// Reject zero budgets
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("build_seconds", self.build_seconds),
            ("package_seconds", self.package_seconds),
            ("stage_seconds", self.stage_seconds),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(DeployError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = StageTimeouts::default();
        assert_eq!(timeouts.for_operation(&Stage::Built.into()), Duration::from_secs(1800));
        assert_eq!(timeouts.for_operation(&Stage::Extracted.into()), Duration::from_secs(300));
        assert_eq!(
            timeouts.for_operation(&Operation::task("db:migrate")),
            Duration::from_secs(300)
        );
        assert_eq!(timeouts.lease_wait(), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let timeouts = StageTimeouts {
            stage_seconds: 0,
            ..Default::default()
        };
        assert!(timeouts.validate().is_err());

        // A zero lease wait means "fail immediately if held"
        let timeouts = StageTimeouts {
            lease_wait_seconds: 0,
            ..Default::default()
        };
        assert!(timeouts.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let timeouts: StageTimeouts = serde_yaml::from_str("stage_seconds: 30").unwrap();
        assert_eq!(timeouts.stage_seconds, 30);
        assert_eq!(timeouts.build_seconds, 1800);
    }
}
