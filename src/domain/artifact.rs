//! Build outputs and packaged artifacts.
//!
//! A BuildOutput is the file tree a build produced; an Artifact is that tree
//! packed into a single transferable file. Both own their backing temporary
//! directory and clean it up on drop.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// File extension of packaged artifacts
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Default artifact name (yields `archive.tar.gz`)
pub const DEFAULT_ARTIFACT_NAME: &str = "archive";

/// Directory tree produced by one build
#[derive(Debug)]
pub struct BuildOutput {
    dir: TempDir,
}

impl BuildOutput {
    pub(crate) fn new(dir: TempDir) -> Self {
        Self { dir }
    }

    /// Root of the output tree
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy the output tree somewhere that outlives this handle
    pub fn persist_to(&self, dest: &Path) -> std::io::Result<()> {
        crate::core::fs_util::copy_dir_all(self.path(), dest)
    }
}

/// A packaged build output
#[derive(Debug)]
pub struct Artifact {
    /// File name, e.g. `archive.tar.gz`
    pub name: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// SHA-256 of the content, for logging only
    pub digest: String,

    path: PathBuf,

    // Keeps the backing file alive
    _dir: TempDir,
}

impl Artifact {
    pub(crate) fn new(name: String, dir: TempDir, size_bytes: u64, digest: String) -> Self {
        let path = dir.path().join(&name);
        Self {
            name,
            size_bytes,
            digest,
            path,
            _dir: dir,
        }
    }

    /// Path of the archive file on disk
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the archive content
    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }
}

/// Normalise an artifact name to its on-disk file name
pub fn artifact_file_name(name: &str) -> String {
    if name.ends_with(ARCHIVE_EXTENSION) {
        name.to_string()
    } else {
        format!("{}{}", name, ARCHIVE_EXTENSION)
    }
}
