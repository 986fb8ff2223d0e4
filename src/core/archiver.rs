//! Deterministic tar.gz packaging of build outputs.
//!
//! The same tree always packs to the same bytes: entries are written in
//! sorted order, timestamps and ownership are zeroed, modes are normalised
//! and the gzip header carries no mtime or file name.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use sha2::{Digest, Sha256};
use tar::{Builder, EntryType, Header};
use tempfile::TempDir;
use tracing::{debug, info, instrument};

use crate::domain::artifact::artifact_file_name;
use crate::domain::{Artifact, BuildOutput};
use crate::error::{DeployError, Result};

/// Package a build output into `<name>.tar.gz`
#[instrument(skip(output), fields(output = %output.path().display()))]
pub async fn archive(output: &BuildOutput, name: &str) -> Result<Artifact> {
    let file_name = artifact_file_name(name.trim());
    if file_name == crate::domain::ARCHIVE_EXTENSION
        || file_name.contains('/')
        || file_name.contains('\\')
    {
        return Err(DeployError::packaging(format!(
            "Invalid artifact name '{}'",
            name
        )));
    }

    let src = output.path().to_path_buf();
    let dir = TempDir::new()
        .map_err(|e| DeployError::packaging(format!("Failed to create artifact directory: {}", e)))?;
    let dst = dir.path().join(&file_name);

    let path = dst.clone();
    let (size_bytes, digest) = tokio::task::spawn_blocking(move || -> io::Result<(u64, String)> {
        write_archive(&src, &path)?;
        digest_file(&path)
    })
    .await
    .map_err(|e| DeployError::packaging(format!("Archive task panicked: {}", e)))?
    .map_err(|e| DeployError::packaging(format!("Failed to write {}: {}", dst.display(), e)))?;

    info!(artifact = %file_name, size_bytes, digest = %digest, "Artifact packaged");

    Ok(Artifact::new(file_name, dir, size_bytes, digest))
}

/// Write `src` as a gzip-compressed tar to `dst`
pub fn write_archive(src: &Path, dst: &Path) -> io::Result<()> {
    let file = BufWriter::new(File::create(dst)?);
    let encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let mut entries = Vec::new();
    collect_entries(src, Path::new(""), &mut entries)?;
    debug!(count = entries.len(), "Packing entries");

    for rel in &entries {
        append_entry(&mut builder, src, rel)?;
    }

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    file.flush()?;
    Ok(())
}

// Depth-first, children sorted by name
fn collect_entries(root: &Path, rel: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(root.join(rel))?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.file_name())
        .collect();
    children.sort();

    for name in children {
        let child = rel.join(&name);
        let meta = fs::symlink_metadata(root.join(&child))?;
        out.push(child.clone());
        if meta.is_dir() {
            collect_entries(root, &child, out)?;
        }
    }

    Ok(())
}

fn append_entry<W: Write>(builder: &mut Builder<W>, root: &Path, rel: &Path) -> io::Result<()> {
    let full = root.join(rel);
    let meta = fs::symlink_metadata(&full)?;

    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);

    if meta.file_type().is_symlink() {
        let link = fs::read_link(&full)?;
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        builder.append_link(&mut header, rel, link)
    } else if meta.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder.append_data(&mut header, rel, io::empty())
    } else {
        header.set_entry_type(EntryType::Regular);
        header.set_mode(normalized_mode(&meta));
        header.set_size(meta.len());
        builder.append_data(&mut header, rel, File::open(&full)?)
    }
}

#[cfg(unix)]
fn normalized_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o100 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn normalized_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}
