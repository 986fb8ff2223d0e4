//! Filesystem helpers shared by the builder, executor and transport.

use std::fs;
use std::io;
use std::path::{Component, Path};

/// Recursively copy `src` into `dst`, merging with whatever is there.
///
/// Files already present at the same relative path are overwritten. Anything
/// in the way of a directory (a file or a symlink) is replaced by a real
/// directory first, so the merge never writes through a link in `dst`.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    ensure_real_dir(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            clear(&target)?;
            symlink(&link, &target)?;
        } else {
            clear(&target)?;
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

/// Copy a single file, creating parent directories as needed.
///
/// Whatever sits at `dst` is removed first; a symlink there is replaced, not
/// followed.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    clear(dst)?;
    fs::copy(src, dst)?;
    Ok(())
}

/// Create every directory between `root` and `root/rel`'s parent.
///
/// Files and symlinks on the way are replaced by real directories, so a
/// later copy to `root/rel` stays inside `root`.
pub fn prepare_parents(root: &Path, rel: &Path) -> io::Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };

    let mut current = root.to_path_buf();
    for component in parent.components() {
        match component {
            Component::Normal(part) => {
                current.push(part);
                ensure_real_dir(&current)?;
            }
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("'{}' is not a relative path below the root", rel.display()),
                ))
            }
        }
    }
    Ok(())
}

fn ensure_real_dir(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => {
            remove_path(path)?;
            fs::create_dir_all(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(path),
        Err(e) => Err(e),
    }
}

fn clear(path: &Path) -> io::Result<()> {
    match path.symlink_metadata() {
        Ok(_) => remove_path(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(unix)]
fn symlink(link: &Path, target: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn symlink(_link: &Path, _target: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks in build output are only supported on unix",
    ))
}
