use crate::{
    error::{SyncError, SyncResult},
    policing,
    task::CancelToken,
};
use filetime::FileTime;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

pub fn prepare_parent(dest: &Path) -> SyncResult<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| SyncError::format("mod path", format!("{:?} has no parent", dest)))?;
    fs::create_dir_all(parent).map_err(|err| SyncError::from_io(parent, "create directory", err))
}

pub fn link_existing(source: &Path, dest: &Path) -> SyncResult<()> {
    if fs::symlink_metadata(dest).is_ok() {
        return Err(SyncError::from_io(
            dest,
            "link",
            io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }
    prepare_parent(dest)?;
    create_dir_link(source, dest).map_err(|err| SyncError::from_io(dest, "create link", err))?;
    tracing::info!(source = ?source, dest = ?dest, "linked existing copy");
    Ok(())
}

#[cfg(unix)]
fn create_dir_link(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn create_dir_link(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(source, dest)
}

#[cfg(not(any(unix, windows)))]
fn create_dir_link(_source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        "directory links unavailable on this platform",
    ))
}

/// Copies `source` into `<dest>.partial`, then renames it to `dest`. File
/// mtimes are preserved because the quick check compares them. A cancelled
/// or failed copy removes the partial directory.
pub fn copy_existing(source: &Path, dest: &Path, cancel: &CancelToken) -> SyncResult<u64> {
    if fs::symlink_metadata(dest).is_ok() {
        return Err(SyncError::from_io(
            dest,
            "copy into",
            io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }
    prepare_parent(dest)?;
    let partial = partial_path(dest)?;
    if fs::symlink_metadata(&partial).is_ok() {
        discard_partial(&partial)?;
    }

    match copy_tree(source, &partial, cancel) {
        Ok(copied) => {
            fs::rename(&partial, dest).map_err(|err| SyncError::from_io(dest, "rename", err))?;
            tracing::info!(source = ?source, dest = ?dest, files = copied, "copied existing copy");
            Ok(copied)
        }
        Err(err) => {
            discard_partial(&partial)?;
            Err(err)
        }
    }
}

fn copy_tree(source: &Path, dest: &Path, cancel: &CancelToken) -> SyncResult<u64> {
    let mut copied = 0u64;
    for entry in WalkDir::new(source).follow_links(true) {
        cancel.check()?;
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(source).to_path_buf();
            match err.into_io_error() {
                Some(io_err) => SyncError::from_io(&path, "read", io_err),
                None => SyncError::format("directory tree", format!("link loop at {:?}", path)),
            }
        })?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| SyncError::format("directory tree", err))?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| SyncError::from_io(&target, "create directory", err))?;
            continue;
        }
        fs::copy(entry.path(), &target).map_err(|err| SyncError::from_io(&target, "copy", err))?;
        let meta = entry
            .metadata()
            .map_err(|err| SyncError::format("directory tree", err))?;
        filetime::set_file_mtime(&target, FileTime::from_last_modification_time(&meta))
            .map_err(|err| SyncError::from_io(&target, "set modification time of", err))?;
        copied += 1;
    }
    Ok(copied)
}

fn partial_path(dest: &Path) -> SyncResult<PathBuf> {
    let name = dest
        .file_name()
        .ok_or_else(|| SyncError::format("mod path", format!("{:?}", dest)))?;
    let mut partial = name.to_os_string();
    partial.push(".partial");
    Ok(dest.with_file_name(partial))
}

fn discard_partial(partial: &Path) -> SyncResult<()> {
    let parent = partial
        .parent()
        .ok_or_else(|| SyncError::format("mod path", format!("{:?}", partial)))?;
    let real_parent =
        fs::canonicalize(parent).map_err(|err| SyncError::from_io(parent, "resolve", err))?;
    policing::remove_inside(&real_parent, partial, true)?;
    Ok(())
}
