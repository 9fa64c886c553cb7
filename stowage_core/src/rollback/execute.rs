//! Rollback execution.
//!
//! Applies a plan in strict phase order: directories, canonical restores,
//! duplicate restores, sidecar metadata. Failures are per-action: a failed
//! copy is counted and logged, and the rest of the phase continues.
//! Cancellation is cooperative and returns the partial result accumulated so
//! far. A dry run walks the identical action sequence, incrementing the same
//! counters, with zero filesystem mutation.

use crate::cancel::CancelFlag;
use crate::entry::Entry;
use crate::rollback::plan::{ActionKind, RollbackAction, RollbackPlan};
use filetime::FileTime;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome counters for one executed plan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackResult {
    pub restored: u64,
    pub duplicates_restored: u64,
    pub sidecars_restored: u64,
    pub dirs_created: u64,
    pub skipped: u64,
    pub failed: u64,
    /// One message per failed action.
    pub errors: Vec<String>,
    /// The run stopped early on a cancellation request; counters cover only
    /// the work done before the stop.
    pub cancelled: bool,
}

const PHASES: [ActionKind; 4] = [
    ActionKind::Mkdir,
    ActionKind::Restore,
    ActionKind::DuplicateRestore,
    ActionKind::SidecarRestore,
];

/// Execute a rollback plan.
///
/// The progress callback, when supplied, fires synchronously once per
/// attempted action, before the action runs.
pub fn execute(
    plan: &RollbackPlan,
    dry_run: bool,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&RollbackAction)>,
) -> RollbackResult {
    let mut result = RollbackResult::default();

    for phase in PHASES {
        for action in plan.actions.iter().filter(|a| a.kind == phase) {
            if cancel.is_cancelled() {
                result.cancelled = true;
                return result;
            }

            if let Some(callback) = progress {
                callback(action);
            }

            if let Some(reason) = action.skip {
                debug!(target = %action.target.display(), reason = reason.as_str(), "skipped");
                result.skipped += 1;
                continue;
            }

            if dry_run {
                count_success(&mut result, phase);
                continue;
            }

            match run_action(action) {
                Ok(()) => count_success(&mut result, phase),
                Err(message) => {
                    warn!(target = %action.target.display(), error = message, "action failed");
                    result.failed += 1;
                    result.errors.push(message);
                }
            }
        }
    }

    result
}

fn count_success(result: &mut RollbackResult, phase: ActionKind) {
    match phase {
        ActionKind::Mkdir => result.dirs_created += 1,
        ActionKind::Restore => result.restored += 1,
        ActionKind::DuplicateRestore => result.duplicates_restored += 1,
        ActionKind::SidecarRestore => result.sidecars_restored += 1,
    }
}

fn run_action(action: &RollbackAction) -> std::result::Result<(), String> {
    match action.kind {
        ActionKind::Mkdir => fs::create_dir_all(&action.target)
            .map_err(|e| format!("mkdir {}: {}", action.target.display(), e)),
        ActionKind::Restore | ActionKind::DuplicateRestore => {
            let source = action
                .source
                .as_deref()
                .ok_or_else(|| format!("restore {}: no source", action.target.display()))?;
            fs::copy(source, &action.target).map_err(|e| {
                format!(
                    "copy {} -> {}: {}",
                    source.display(),
                    action.target.display(),
                    e
                )
            })?;
            if let Some(entry) = &action.entry {
                restore_timestamps(&action.target, entry);
            }
            Ok(())
        }
        ActionKind::SidecarRestore => {
            let payload = action
                .payload
                .as_deref()
                .ok_or_else(|| format!("sidecar {}: no payload", action.target.display()))?;
            write_atomic(&action.target, payload)
                .map_err(|e| format!("write {}: {}", action.target.display(), e))?;
            if let Some(entry) = &action.entry {
                restore_timestamps(&action.target, entry);
            }
            Ok(())
        }
    }
}

/// Restore modified and accessed times from the record. Creation time has no
/// portable restoration API and is left to the filesystem. Best-effort: a
/// failure only warns, the content restore already succeeded.
fn restore_timestamps(path: &Path, entry: &Entry) {
    let mtime = millis_to_filetime(entry.modified.millis);
    let atime = millis_to_filetime(entry.accessed.millis);
    if let Err(e) = filetime::set_file_times(path, atime, mtime) {
        warn!(path = %path.display(), error = %e, "failed to restore timestamps");
    }
}

fn millis_to_filetime(millis: i64) -> FileTime {
    FileTime::from_unix_time(millis.div_euclid(1000), (millis.rem_euclid(1000) * 1_000_000) as u32)
}

/// Write payload bytes through a temporary file in the target's directory,
/// so a crash never leaves a half-written sidecar.
fn write_atomic(target: &Path, payload: &[u8]) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(payload)?;
    temp.persist(target).map_err(|e| e.error)?;
    Ok(())
}
