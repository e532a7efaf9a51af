use crate::{
    error::{SyncError, SyncResult},
    manifest::ManifestLayout,
};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicingMode {
    Warn,
    Remove,
}

/// Returns whether every top-level declared directory under `base` now holds
/// only declared content. Traversal errors yield `Ok(false)`; only a safety
/// violation or a denied deletion is an `Err`.
pub fn check_mod_directories(
    layout: &ManifestLayout,
    base: &Path,
    whitelist: &[String],
    mode: PolicingMode,
) -> SyncResult<bool> {
    for top in &layout.top_dirs {
        let root = base.join(top);
        match fs::symlink_metadata(&root) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => {
                tracing::warn!(path = ?root, error = %err, "cannot stat mod directory");
                return Ok(false);
            }
        }
        // The mod root may be a link to a copy living elsewhere; deletions are
        // confined to wherever it really points.
        let real_root = match fs::canonicalize(&root) {
            Ok(path) => path,
            Err(err) => {
                tracing::warn!(path = ?root, error = %err, "cannot resolve mod directory");
                return Ok(false);
            }
        };
        if !police_tree(layout, base, &root, &real_root, whitelist, mode)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn police_tree(
    layout: &ManifestLayout,
    base: &Path,
    root: &Path,
    real_root: &Path,
    whitelist: &[String],
    mode: PolicingMode,
) -> SyncResult<bool> {
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "error while walking mod directory");
                return Ok(false);
            }
        };
        let Some(rel) = relative_key(base, entry.path()) else {
            return Ok(false);
        };
        let name = entry.file_name().to_string_lossy();
        let whitelisted = whitelist.iter().any(|item| item.as_str() == name);
        let is_dir = entry.file_type().is_dir();

        if is_dir {
            if layout.dirs.contains(&rel) {
                continue;
            }
            if whitelisted {
                walker.skip_current_dir();
                continue;
            }
        } else if whitelisted || layout.files.contains(&rel) {
            continue;
        }

        match mode {
            PolicingMode::Warn => {
                tracing::info!(path = %rel, "superfluous entry in mod directory");
                return Ok(false);
            }
            PolicingMode::Remove => {
                tracing::info!(path = %rel, "removing superfluous entry");
                if !remove_inside(real_root, entry.path(), is_dir)? {
                    return Ok(false);
                }
                if is_dir {
                    walker.skip_current_dir();
                }
            }
        }
    }
    Ok(true)
}

/// Resolves where `target` itself lives (its parent is canonicalised, the
/// final component is not followed) and checks that location is strictly
/// inside `real_base`.
pub fn ensure_inside(real_base: &Path, target: &Path) -> SyncResult<PathBuf> {
    let violation = || SyncError::SafetyViolation {
        target: target.to_path_buf(),
        base: real_base.to_path_buf(),
    };
    let name = target.file_name().ok_or_else(violation)?;
    let parent = target.parent().ok_or_else(violation)?;
    let real_parent = fs::canonicalize(parent).map_err(|err| SyncError::from_io(parent, "resolve", err))?;
    let resolved = real_parent.join(name);
    if resolved == real_base || !resolved.starts_with(real_base) {
        return Err(violation());
    }
    Ok(resolved)
}

pub fn remove_inside(real_base: &Path, target: &Path, is_dir: bool) -> SyncResult<bool> {
    let resolved = ensure_inside(real_base, target)?;
    let result = if is_dir {
        fs::remove_dir_all(&resolved)
    } else {
        fs::remove_file(&resolved)
    };
    match result {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Err(SyncError::from_io(&resolved, "delete", err))
        }
        Err(err) => {
            tracing::warn!(path = ?resolved, error = %err, "could not delete");
            Ok(false)
        }
    }
}

fn relative_key(base: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(base).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
