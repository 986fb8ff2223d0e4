//! Per-target advisory leases.
//!
//! Two runs against the same hostname + deploy path must not interleave
//! their prepare/upload/extract calls. A lease is an exclusive file lock on
//! `<home>/leases/<hash>.lock`, polled until the wait budget runs out. The
//! lock is released when the lease is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::Utc;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::Operation;
use crate::error::{DeployError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exclusive hold on one deployment target
#[derive(Debug)]
pub struct TargetLease {
    file: File,
    key: String,
}

impl TargetLease {
    /// Acquire the lease for `key`, waiting at most `wait`
    pub async fn acquire(
        dir: &Path,
        key: &str,
        wait: Duration,
        cancel: &CancellationToken,
        operation: &Operation,
    ) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            DeployError::Config(format!(
                "Failed to create lease directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join(lease_file_name(key));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                DeployError::Config(format!("Failed to open lease file {}: {}", path.display(), e))
            })?;

        let started = Instant::now();
        let mut warned = false;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if started.elapsed() >= wait {
                        return Err(DeployError::Lease {
                            target: key.to_string(),
                            operation: operation.clone(),
                            waited_seconds: started.elapsed().as_secs(),
                        });
                    }
                    if !warned {
                        warn!(target_key = %key, "Target is leased by another run, waiting");
                        warned = true;
                    }
                }
                Err(e) => {
                    return Err(DeployError::Config(format!(
                        "Failed to lock {}: {}",
                        path.display(),
                        e
                    )));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(DeployError::Cancelled {
                        operation: operation.clone(),
                    })
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }

        let mut lease = Self {
            file,
            key: key.to_string(),
        };
        lease.write_holder();
        info!(target_key = %lease.key, "Lease acquired");
        Ok(lease)
    }

    // Informational only; the lock is what matters
    fn write_holder(&mut self) {
        let holder = format!(
            "pid={} acquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        let result = self
            .file
            .set_len(0)
            .and_then(|_| self.file.write_all(holder.as_bytes()))
            .and_then(|_| self.file.flush());
        if let Err(e) = result {
            debug!(error = %e, "Failed to record lease holder");
        }
    }
}

impl Drop for TargetLease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(target_key = %self.key, error = %e, "Failed to release lease");
        } else {
            debug!(target_key = %self.key, "Lease released");
        }
    }
}

/// Lock file name for a target key (first 16 hex chars of SHA256)
pub fn lease_file_name(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{}.lock", hex::encode(&digest[..8]))
}
