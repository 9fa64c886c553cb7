//! The rename engine.
//!
//! Physically renames an indexed item to its content-derived storage name.
//! Identity is always computed before any rename, so identity never depends
//! on a file's current on-disk name. This module is the only one permitted
//! to change filenames.

use crate::dedup::sidecar_path;
use crate::entry::Entry;
use crate::error::{Error, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Rename an item to its storage name, as a sibling of the original path.
///
/// - `dry_run` returns the computed target without touching the filesystem.
/// - An existing target that is the same filesystem object as the source is
///   an already-renamed idempotent no-op.
/// - An existing target that is a distinct object is a genuine collision the
///   dedup engine should have eliminated beforehand; it is logged at error
///   severity and the original path is returned unchanged rather than
///   overwriting.
/// - A primitive rename that fails crossing a filesystem boundary falls back
///   to copy-then-delete; if that also fails, the error carries both paths.
pub fn rename_to_storage(original: &Path, entry: &Entry, dry_run: bool) -> Result<PathBuf> {
    let target = original.with_file_name(entry.storage_name());

    if dry_run {
        return Ok(target);
    }

    if target.exists() {
        match same_object(original, &target) {
            // Distinct existing object: should have been deduplicated before
            // rename, so this signals a pipeline-ordering defect.
            Some(false) => {
                error!(
                    original = %original.display(),
                    target = %target.display(),
                    "storage-name collision with a distinct file; refusing to overwrite"
                );
                return Ok(original.to_path_buf());
            }
            // Same object, or cannot determine (zero inode numbers on some
            // filesystems): treat as already renamed and proceed.
            Some(true) | None => return Ok(target),
        }
    }

    match fs::rename(original, &target) {
        Ok(()) => Ok(target),
        Err(e) if crosses_devices(&e) => copy_then_delete(original, &target),
        Err(e) => Err(Error::rename(original, &target, e)),
    }
}

/// Rename a previously written in-place sidecar from the original-name form
/// to the storage-name form, so it stays beside its renamed content file.
///
/// Absence of a sidecar is a silent no-op. Failure only warns.
pub fn rename_sidecar(original: &Path, entry: &Entry) -> Option<PathBuf> {
    let source = sidecar_path(original);
    if !source.exists() {
        return None;
    }

    let renamed_content = original.with_file_name(entry.storage_name());
    let target = sidecar_path(&renamed_content);

    match fs::rename(&source, &target) {
        Ok(()) => Some(target),
        Err(e) => {
            warn!(
                source = %source.display(),
                target = %target.display(),
                error = %e,
                "failed to rename sidecar"
            );
            None
        }
    }
}

/// Whether two paths name the same filesystem object, by device and inode.
///
/// `None` means it cannot be determined (stat failure, inode numbers of
/// zero, or a platform without inodes); callers preserve the conservative
/// bias toward proceeding rather than blocking.
#[cfg(unix)]
fn same_object(a: &Path, b: &Path) -> Option<bool> {
    use std::os::unix::fs::MetadataExt;

    let meta_a = fs::metadata(a).ok()?;
    let meta_b = fs::metadata(b).ok()?;

    if meta_a.ino() == 0 || meta_b.ino() == 0 {
        return None;
    }

    Some(meta_a.dev() == meta_b.dev() && meta_a.ino() == meta_b.ino())
}

#[cfg(not(unix))]
fn same_object(_a: &Path, _b: &Path) -> Option<bool> {
    None
}

/// Whether a rename failure indicates a cross-filesystem-boundary move.
fn crosses_devices(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18)
}

fn copy_then_delete(original: &Path, target: &Path) -> Result<PathBuf> {
    fs::copy(original, target).map_err(|e| Error::rename(original, target, e))?;
    fs::remove_file(original).map_err(|e| Error::rename(original, target, e))?;
    Ok(target.to_path_buf())
}
