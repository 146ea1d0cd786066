//! Filesystem primitives behind conversions: staging directories, atomic
//! writes, opaque tree copies and the swap into place.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs_extra::dir::CopyOptions;
use tracing::{debug, warn};

use super::{BoxError, STAGING_PREFIX, TRASH_PREFIX};

/// File count and byte total of a tree, used to validate opaque copies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

/// A hidden sibling of `target` with the given prefix, unique per process and instant.
pub(crate) fn sibling_path(target: &Path, prefix: &str, label: &str) -> Result<PathBuf, BoxError> {
    let parent = target
        .parent()
        .ok_or_else(|| BoxError::staging("planning", format!("{} has no parent", target.display())))?;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    Ok(parent.join(format!(
        "{}{}-{}-{}",
        prefix,
        label,
        std::process::id(),
        nanos
    )))
}

pub(crate) fn staging_path(target: &Path, label: &str) -> Result<PathBuf, BoxError> {
    sibling_path(target, STAGING_PREFIX, label)
}

/// Write `contents` to `path` via a synced temporary file in the same directory.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".agentbox-tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Copy a file or directory tree from `src` to `dst`.
pub(crate) fn copy_entry(src: &Path, dst: &Path) -> io::Result<()> {
    if src.is_dir() {
        fs::create_dir_all(dst)?;
        let mut options = CopyOptions::new();
        options.content_only = true;
        options.overwrite = true;
        fs_extra::dir::copy(src, dst, &options).map_err(|e| io::Error::other(e.to_string()))?;
    } else {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Count files and bytes under `path`, following symlinks like the copy does.
pub(crate) fn tree_stats(path: &Path) -> io::Result<TreeStats> {
    let meta = fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(TreeStats {
            files: 1,
            bytes: meta.len(),
        });
    }
    let mut stats = TreeStats::default();
    for entry in fs::read_dir(path)? {
        let child = tree_stats(&entry?.path())?;
        stats.files += child.files;
        stats.bytes += child.bytes;
    }
    Ok(stats)
}

/// Flush every file and directory under `path` to disk.
pub(crate) fn sync_tree(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_dir() {
        for entry in fs::read_dir(path)? {
            sync_tree(&entry?.path())?;
        }
        sync_dir(path)
    } else if meta.is_file() {
        File::open(path)?.sync_all()
    } else {
        Ok(())
    }
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Best-effort removal of an abandoned staging directory.
pub(crate) fn discard(staging: &Path) {
    if !staging.exists() {
        return;
    }
    match fs::remove_dir_all(staging) {
        Ok(()) => debug!(path = %staging.display(), "staging:discarded"),
        Err(e) => warn!(path = %staging.display(), error = %e, "staging:discard failed"),
    }
}

/// Move a validated staging directory to `target`.
///
/// With `replace`, an existing target is renamed aside first and deleted once
/// the new tree is in place; without it an existing target is a collision.
pub(crate) fn swap_into_place(
    staging: &Path,
    target: &Path,
    replace: bool,
    collision: impl FnOnce() -> BoxError,
) -> Result<(), BoxError> {
    sync_tree(staging).map_err(|e| BoxError::staging("syncing staged files", e))?;

    let trash = if target.exists() {
        if !replace {
            return Err(collision());
        }
        let trash = sibling_path(target, TRASH_PREFIX, "replaced")?;
        fs::rename(target, &trash)
            .map_err(|e| BoxError::staging("moving the old target aside", e))?;
        Some(trash)
    } else {
        None
    };

    if let Err(e) = rename_or_copy(staging, target) {
        if let Some(trash) = &trash
            && let Err(restore) = fs::rename(trash, target)
        {
            warn!(
                trash = %trash.display(),
                error = %restore,
                "swap:failed to restore replaced target"
            );
        }
        return Err(e);
    }

    if let Some(parent) = target.parent()
        && let Err(e) = sync_dir(parent)
    {
        warn!(path = %parent.display(), error = %e, "swap:parent fsync failed");
    }

    if let Some(trash) = trash
        && let Err(e) = fs::remove_dir_all(&trash)
    {
        warn!(path = %trash.display(), error = %e, "swap:failed to delete replaced target");
    }
    debug!(target = %target.display(), "swap:complete");
    Ok(())
}

fn rename_or_copy(staging: &Path, target: &Path) -> Result<(), BoxError> {
    match fs::rename(staging, target) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!(
                staging = %staging.display(),
                target = %target.display(),
                "swap:cross-device, copying"
            );
            let copied = copy_entry(staging, target).and_then(|_| sync_tree(target));
            if let Err(e) = copied {
                let _ = fs::remove_dir_all(target);
                return Err(BoxError::staging("copying across devices", e));
            }
            discard(staging);
            Ok(())
        }
        Err(e) => Err(BoxError::staging("renaming staging into place", e)),
    }
}

/// Remove a state root: hide it under a trash name first so a partial delete
/// never looks like a live box.
pub(crate) fn retire(state_root: &Path) -> Result<(), String> {
    let trash = sibling_path(state_root, TRASH_PREFIX, "removed").map_err(|e| e.to_string())?;
    fs::rename(state_root, &trash)
        .map_err(|e| format!("could not remove {}: {}", state_root.display(), e))?;
    if let Some(parent) = state_root.parent()
        && let Err(e) = sync_dir(parent)
    {
        warn!(path = %parent.display(), error = %e, "retire:parent fsync failed");
    }
    fs::remove_dir_all(&trash).map_err(|e| {
        format!(
            "old state hidden at {} could not be deleted: {}",
            trash.display(),
            e
        )
    })
}
