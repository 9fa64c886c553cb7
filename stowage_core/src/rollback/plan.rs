//! Rollback planning.
//!
//! Turns a loaded index into an ordered action list. Planning reads the
//! filesystem (to resolve sources and detect conflicts) but never writes;
//! every mutation is deferred to the execute step. Actions are grouped into
//! phases by [`ActionKind`]: directories first, then canonical restores,
//! then duplicate restores, then sidecar metadata.

use crate::cancel::CancelFlag;
use crate::dedup::sidecar_path;
use crate::entry::{Entry, MetadataOrigin};
use crate::error::{Error, Result};
use crate::hash::digest_content;
use crate::rollback::load::LoadedIndex;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Where restored files land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetMode {
    /// Everything directly under the target root; basename collisions
    /// detected and skipped.
    Flat,
    /// Original relative paths recreated under the target root.
    #[default]
    Structured,
}

/// Planner knobs.
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub mode: TargetMode,
    /// Hash-verify existing targets to distinguish already-restored files
    /// from genuine conflicts.
    pub verify: bool,
    /// Overwrite conflicting targets instead of skipping them.
    pub overwrite: bool,
    /// Restore lifted duplicates as well as canonicals.
    pub include_duplicates: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            mode: TargetMode::Structured,
            verify: true,
            overwrite: false,
            include_duplicates: true,
        }
    }
}

/// Finds the content bytes for an entry being restored.
///
/// Kept as a trait seam so callers can resolve from places other than a
/// local directory, such as a remote store or an archive.
pub trait SourceResolver {
    /// The path holding this entry's content, or `None` if it cannot be
    /// found.
    fn resolve(&self, entry: &Entry, search_dir: &Path) -> Option<PathBuf>;
}

/// Resolves content from a local directory of stored files.
///
/// Tries the storage name first; a hit needs no verification because the
/// name is content-derived. Falls back to the original name, where a hit is
/// only trusted after its digest matches the record.
#[derive(Debug, Default)]
pub struct LocalResolver;

impl SourceResolver for LocalResolver {
    fn resolve(&self, entry: &Entry, search_dir: &Path) -> Option<PathBuf> {
        let by_storage = search_dir.join(entry.storage_name());
        if by_storage.is_file() {
            return Some(by_storage);
        }

        let name = entry.name.as_deref()?;
        let by_name = search_dir.join(name);
        if by_name.is_file() && content_matches(&by_name, entry) {
            return Some(by_name);
        }
        None
    }
}

/// Whether a file's digest matches the entry's recorded content digest,
/// under the entry's identity algorithm. Unreadable or mismatching is false.
fn content_matches(path: &Path, entry: &Entry) -> bool {
    let Some(recorded) = &entry.content else {
        return false;
    };
    let Some(expected) = recorded.get(entry.id_algorithm) else {
        return false;
    };
    match digest_content(path, &[entry.id_algorithm], &CancelFlag::new()) {
        Ok(actual) => actual.get(entry.id_algorithm) == Some(expected),
        Err(_) => false,
    }
}

/// Action phase. Execution runs phases strictly in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionKind {
    Mkdir,
    Restore,
    DuplicateRestore,
    SidecarRestore,
}

/// Why a planned action was marked as a skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Target exists with matching content.
    AlreadyRestored,
    /// Target exists with different content and overwrite is off.
    Conflict,
    /// Another entry already claimed this basename in flat mode.
    FlatCollision,
    /// No source file could be resolved.
    SourceMissing,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AlreadyRestored => "already restored",
            SkipReason::Conflict => "conflict",
            SkipReason::FlatCollision => "flat-mode name collision",
            SkipReason::SourceMissing => "source missing",
        }
    }
}

/// One planned filesystem operation.
#[derive(Debug, Clone)]
pub struct RollbackAction {
    pub kind: ActionKind,
    /// Content source. `None` for mkdirs and payload-carrying sidecars.
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    /// The entry being restored; timestamps come from here. `None` for
    /// mkdirs.
    pub entry: Option<Entry>,
    pub skip: Option<SkipReason>,
    /// The existing target was hash-verified identical.
    pub verified: bool,
    /// Decoded sidecar bytes, present only on sidecar actions.
    pub payload: Option<Vec<u8>>,
}

/// Plan-time counters. Skipped actions are counted once, under `skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub restores: u64,
    pub duplicate_restores: u64,
    pub sidecar_restores: u64,
    pub dirs: u64,
    pub skipped: u64,
}

/// The ordered, auditable action list.
#[derive(Debug, Default)]
pub struct RollbackPlan {
    pub actions: Vec<RollbackAction>,
    pub stats: PlanStats,
    pub warnings: Vec<String>,
}

/// Build a rollback plan.
///
/// `search_dir` is where the resolver looks for stored content;
/// `target_root` is where entries are restored. Every computed target is
/// validated to stay inside the target root; a record whose relative path
/// escapes it fails the whole plan.
pub fn plan(
    index: &LoadedIndex,
    search_dir: &Path,
    target_root: &Path,
    resolver: &dyn SourceResolver,
    options: &PlanOptions,
    cancel: &CancelFlag,
) -> Result<RollbackPlan> {
    let mut out = RollbackPlan::default();

    if index.sessions > 1 {
        out.warnings.push(format!(
            "records span {} indexing sessions; restored layout may interleave",
            index.sessions
        ));
    }

    // shallowest-first ordering falls out of sorting by component count
    let mut dirs: BTreeSet<(usize, PathBuf)> = BTreeSet::new();
    let mut claimed_names: HashSet<String> = HashSet::new();
    let mut restores = Vec::new();

    for (i, entry) in index.entries.iter().enumerate() {
        cancel.check()?;

        let is_duplicate = index.is_duplicate(i);
        if is_duplicate && !options.include_duplicates {
            continue;
        }
        let kind = if is_duplicate {
            ActionKind::DuplicateRestore
        } else {
            ActionKind::Restore
        };

        // Basenames are claimed and parent dirs scheduled only once the
        // entry is known to restore for real; a skipped entry must not
        // reserve a flat name or leave empty directories behind.
        let claim = match options.mode {
            TargetMode::Flat => {
                let basename = flat_basename(entry);
                if claimed_names.contains(&basename) {
                    let target = target_root.join(&basename);
                    restores.push(skip_action(kind, target, entry, SkipReason::FlatCollision));
                    out.stats.skipped += 1;
                    continue;
                }
                Some(basename)
            }
            TargetMode::Structured => None,
        };
        let target = match &claim {
            Some(basename) => target_root.join(basename),
            None => safe_join(target_root, &entry.location.relative)?,
        };

        let Some(source) = resolver.resolve(entry, search_dir) else {
            debug!(
                storage_name = entry.storage_name(),
                "no source resolved; skipping"
            );
            restores.push(skip_action(kind, target, entry, SkipReason::SourceMissing));
            out.stats.skipped += 1;
            continue;
        };

        if target.exists() {
            if options.verify && content_matches(&target, entry) {
                let mut action = skip_action(kind, target, entry, SkipReason::AlreadyRestored);
                action.verified = true;
                action.source = Some(source);
                restores.push(action);
                out.stats.skipped += 1;
                continue;
            }
            if !options.overwrite {
                restores.push(skip_action(kind, target, entry, SkipReason::Conflict));
                out.stats.skipped += 1;
                continue;
            }
        }

        match claim {
            Some(basename) => {
                claimed_names.insert(basename);
            }
            None => schedule_parents(&target, target_root, &mut dirs),
        }

        match kind {
            ActionKind::DuplicateRestore => out.stats.duplicate_restores += 1,
            _ => out.stats.restores += 1,
        }

        plan_sidecars(
            entry,
            &target,
            options,
            &mut claimed_names,
            &mut out,
            &mut restores,
        );

        restores.push(RollbackAction {
            kind,
            source: Some(source),
            target,
            entry: Some(entry.clone()),
            skip: None,
            verified: false,
            payload: None,
        });
    }

    for (_, dir) in dirs {
        out.stats.dirs += 1;
        out.actions.push(RollbackAction {
            kind: ActionKind::Mkdir,
            source: None,
            target: dir,
            entry: None,
            skip: None,
            verified: false,
            payload: None,
        });
    }
    out.actions.extend(restores);

    Ok(out)
}

/// Plan restoration of an entry's sidecar-origin metadata records.
///
/// Only sidecar-origin records restore as files; embedded metadata already
/// lives inside the restored content. An undecodable payload warns and is
/// dropped from the plan.
fn plan_sidecars(
    entry: &Entry,
    content_target: &Path,
    options: &PlanOptions,
    claimed_names: &mut HashSet<String>,
    out: &mut RollbackPlan,
    restores: &mut Vec<RollbackAction>,
) {
    let Some(records) = &entry.metadata else {
        return;
    };

    for record in records {
        if record.origin != MetadataOrigin::Sidecar {
            continue;
        }

        let target = if is_plain_filename(&record.target_name) {
            content_target.with_file_name(&record.target_name)
        } else {
            sidecar_path(content_target)
        };

        if options.mode == TargetMode::Flat {
            let basename = target
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !claimed_names.insert(basename) {
                restores.push(sidecar_skip(target, entry, SkipReason::FlatCollision));
                out.stats.skipped += 1;
                continue;
            }
        }

        let payload = match record.decode_payload() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    target_name = record.target_name,
                    error = %e,
                    "undecodable sidecar payload; dropped from plan"
                );
                out.warnings
                    .push(format!("sidecar {} dropped: {}", record.target_name, e));
                continue;
            }
        };

        if target.exists() {
            let already = std::fs::read(&target).is_ok_and(|existing| existing == payload);
            if already {
                let mut action = sidecar_skip(target, entry, SkipReason::AlreadyRestored);
                action.verified = true;
                restores.push(action);
                out.stats.skipped += 1;
                continue;
            }
            if !options.overwrite {
                restores.push(sidecar_skip(target, entry, SkipReason::Conflict));
                out.stats.skipped += 1;
                continue;
            }
        }

        out.stats.sidecar_restores += 1;
        restores.push(RollbackAction {
            kind: ActionKind::SidecarRestore,
            source: None,
            target,
            entry: Some(entry.clone()),
            skip: None,
            verified: false,
            payload: Some(payload),
        });
    }
}

fn skip_action(
    kind: ActionKind,
    target: PathBuf,
    entry: &Entry,
    reason: SkipReason,
) -> RollbackAction {
    RollbackAction {
        kind,
        source: None,
        target,
        entry: Some(entry.clone()),
        skip: Some(reason),
        verified: false,
        payload: None,
    }
}

fn sidecar_skip(target: PathBuf, entry: &Entry, reason: SkipReason) -> RollbackAction {
    skip_action(ActionKind::SidecarRestore, target, entry, reason)
}

/// A recorded sidecar target name must be a bare filename; anything with
/// path components falls back to the conventional sidecar name beside the
/// content file.
fn is_plain_filename(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// The basename used for a flat-mode restore: the original name when
/// present, the storage name otherwise.
fn flat_basename(entry: &Entry) -> String {
    entry
        .name
        .clone()
        .unwrap_or_else(|| entry.storage_name().to_string())
}

/// Join a recorded relative path under the root, rejecting any component
/// that would escape it.
fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::target_outside_root(rel, root));
            }
        }
    }
    Ok(root.join(rel))
}

/// Schedule every missing ancestor directory of a target, each exactly once.
fn schedule_parents(target: &Path, root: &Path, dirs: &mut BTreeSet<(usize, PathBuf)>) {
    let mut parent = target.parent();
    while let Some(dir) = parent {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if !dir.exists() {
            dirs.insert((dir.components().count(), dir.to_path_buf()));
        }
        parent = dir.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{MetadataRecord, PayloadFormat};
    use crate::hash::{Algorithm, DEFAULT_ALGORITHMS, digest_bytes};
    use crate::rollback::load::load_path;
    use std::fs;

    fn file_entry(name: &str, relative: &str, content: &[u8]) -> Entry {
        Entry::new_file(
            name,
            relative,
            content.len() as u64,
            digest_bytes(content, DEFAULT_ALGORITHMS),
            Algorithm::Md5,
        )
        .unwrap()
    }

    fn index_of(entries: Vec<Entry>) -> LoadedIndex {
        let mut index = LoadedIndex::default();
        index.sessions = 1;
        index.entries = entries;
        index
    }

    fn store_file(store: &Path, entry: &Entry, content: &[u8]) {
        fs::write(store.join(entry.storage_name()), content).unwrap();
    }

    #[test]
    fn test_plan_is_read_only() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "photos/a.txt", b"hello");
        store_file(store.path(), &entry, b"hello");

        plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(fs::read_dir(target.path()).unwrap().next().is_none());
    }

    #[test]
    fn test_structured_plan_schedules_dirs_shallowest_first() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "x/y/z/a.txt", b"hello");
        store_file(store.path(), &entry, b"hello");

        let plan = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        let mkdirs: Vec<_> = plan
            .actions
            .iter()
            .filter(|a| a.kind == ActionKind::Mkdir)
            .map(|a| a.target.clone())
            .collect();
        assert_eq!(
            mkdirs,
            vec![
                target.path().join("x"),
                target.path().join("x/y"),
                target.path().join("x/y/z"),
            ]
        );
        assert_eq!(plan.stats.dirs, 3);
        assert_eq!(plan.stats.restores, 1);
    }

    #[test]
    fn test_shared_parent_scheduled_once() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let a = file_entry("a.txt", "shared/a.txt", b"one");
        let b = file_entry("b.txt", "shared/b.txt", b"two");
        store_file(store.path(), &a, b"one");
        store_file(store.path(), &b, b"two");

        let plan = plan(
            &index_of(vec![a, b]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(plan.stats.dirs, 1);
    }

    #[test]
    fn test_traversal_escape_rejected() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let mut entry = file_entry("a.txt", "a.txt", b"hello");
        entry.location.relative = "../outside/a.txt".to_string();
        store_file(store.path(), &entry, b"hello");

        let err = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::TargetOutsideRoot { .. }));
    }

    #[test]
    fn test_flat_mode_collision_skipped() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let a = file_entry("same.txt", "one/same.txt", b"first");
        let b = file_entry("same.txt", "two/same.txt", b"second");
        store_file(store.path(), &a, b"first");
        store_file(store.path(), &b, b"second");

        let plan = plan(
            &index_of(vec![a, b]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions {
                mode: TargetMode::Flat,
                ..PlanOptions::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(plan.stats.restores, 1);
        assert_eq!(plan.stats.skipped, 1);
        let skipped = plan.actions.iter().find(|a| a.skip.is_some()).unwrap();
        assert_eq!(skipped.skip, Some(SkipReason::FlatCollision));
        assert_eq!(plan.stats.dirs, 0);
    }

    #[test]
    fn test_missing_source_skipped() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "a.txt", b"hello");

        let plan = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(plan.stats.restores, 0);
        assert_eq!(plan.actions[0].skip, Some(SkipReason::SourceMissing));
    }

    #[test]
    fn test_skipped_entries_schedule_no_dirs() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let missing = file_entry("a.txt", "deep/nested/a.txt", b"hello");
        let conflicting = file_entry("b.txt", "other/b.txt", b"world");
        store_file(store.path(), &conflicting, b"world");
        fs::create_dir(target.path().join("other")).unwrap();
        fs::write(target.path().join("other/b.txt"), b"changed").unwrap();

        let plan = plan(
            &index_of(vec![missing, conflicting]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        // neither the unresolved nor the conflicting entry restores, so no
        // directories are planned for them
        assert_eq!(plan.stats.restores, 0);
        assert_eq!(plan.stats.skipped, 2);
        assert_eq!(plan.stats.dirs, 0);
        assert!(plan.actions.iter().all(|a| a.kind != ActionKind::Mkdir));
    }

    #[test]
    fn test_flat_skip_does_not_reserve_basename() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let missing = file_entry("same.txt", "one/same.txt", b"first");
        let present = file_entry("same.txt", "two/same.txt", b"second");
        store_file(store.path(), &present, b"second");

        let plan = plan(
            &index_of(vec![missing, present]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions {
                mode: TargetMode::Flat,
                ..PlanOptions::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();

        // the first entry has no stored source; its basename stays free for
        // the second entry instead of turning it into a collision
        assert_eq!(plan.stats.restores, 1);
        let reasons: Vec<_> = plan.actions.iter().filter_map(|a| a.skip).collect();
        assert_eq!(reasons, vec![SkipReason::SourceMissing]);
    }

    #[test]
    fn test_existing_identical_target_already_restored() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "a.txt", b"hello");
        store_file(store.path(), &entry, b"hello");
        fs::write(target.path().join("a.txt"), b"hello").unwrap();

        let plan = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        let action = &plan.actions[0];
        assert_eq!(action.skip, Some(SkipReason::AlreadyRestored));
        assert!(action.verified);
    }

    #[test]
    fn test_existing_different_target_is_conflict_without_overwrite() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "a.txt", b"hello");
        store_file(store.path(), &entry, b"hello");
        fs::write(target.path().join("a.txt"), b"different").unwrap();

        let skipping = plan(
            &index_of(vec![entry.clone()]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(skipping.actions[0].skip, Some(SkipReason::Conflict));

        let overwriting = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions {
                overwrite: true,
                ..PlanOptions::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();
        assert!(overwriting.actions[0].skip.is_none());
        assert_eq!(overwriting.stats.restores, 1);
    }

    #[test]
    fn test_resolver_falls_back_to_verified_original_name() {
        let store = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "a.txt", b"hello");
        fs::write(store.path().join("a.txt"), b"hello").unwrap();

        let resolved = LocalResolver.resolve(&entry, store.path()).unwrap();
        assert_eq!(resolved, store.path().join("a.txt"));

        // wrong bytes under the original name are not trusted
        fs::write(store.path().join("a.txt"), b"tampered").unwrap();
        assert!(LocalResolver.resolve(&entry, store.path()).is_none());
    }

    #[test]
    fn test_duplicates_planned_in_their_own_phase() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let record_dir = tempfile::TempDir::new().unwrap();

        let mut canonical = file_entry("a.txt", "a.txt", b"hello");
        canonical.push_duplicate(file_entry("b.txt", "b.txt", b"hello"));
        store_file(store.path(), &canonical, b"hello");
        let record = record_dir.path().join("a.stow.json");
        fs::write(&record, serde_json::to_string(&canonical).unwrap()).unwrap();

        let index = load_path(&record, false).unwrap();
        let plan = plan(
            &index,
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(plan.stats.restores, 1);
        assert_eq!(plan.stats.duplicate_restores, 1);
        let dup = plan
            .actions
            .iter()
            .find(|a| a.kind == ActionKind::DuplicateRestore)
            .unwrap();
        // both restores draw from the same stored content
        assert_eq!(
            dup.source.as_deref(),
            Some(store.path().join(canonical.storage_name()).as_path())
        );
        assert_eq!(dup.target, target.path().join("b.txt"));
    }

    #[test]
    fn test_duplicates_excluded_on_request() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let record_dir = tempfile::TempDir::new().unwrap();

        let mut canonical = file_entry("a.txt", "a.txt", b"hello");
        canonical.push_duplicate(file_entry("b.txt", "b.txt", b"hello"));
        store_file(store.path(), &canonical, b"hello");
        let record = record_dir.path().join("a.stow.json");
        fs::write(&record, serde_json::to_string(&canonical).unwrap()).unwrap();

        let index = load_path(&record, false).unwrap();
        let plan = plan(
            &index,
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions {
                include_duplicates: false,
                ..PlanOptions::default()
            },
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(plan.stats.restores, 1);
        assert_eq!(plan.stats.duplicate_restores, 0);
    }

    #[test]
    fn test_sidecar_metadata_planned_with_payload() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let mut entry = file_entry("a.txt", "a.txt", b"hello");
        entry.metadata = Some(vec![MetadataRecord {
            origin: MetadataOrigin::Sidecar,
            format: PayloadFormat::Text,
            target_name: "a.txt.meta".to_string(),
            payload: serde_json::Value::String("camera: X100".to_string()),
        }]);
        store_file(store.path(), &entry, b"hello");

        let plan = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(plan.stats.sidecar_restores, 1);
        let sidecar = plan
            .actions
            .iter()
            .find(|a| a.kind == ActionKind::SidecarRestore)
            .unwrap();
        assert_eq!(sidecar.target, target.path().join("a.txt.meta"));
        assert_eq!(sidecar.payload.as_deref(), Some(&b"camera: X100"[..]));
    }

    #[test]
    fn test_embedded_metadata_not_planned_as_file() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let mut entry = file_entry("a.txt", "a.txt", b"hello");
        entry.metadata = Some(vec![MetadataRecord {
            origin: MetadataOrigin::Embedded,
            format: PayloadFormat::Text,
            target_name: "ignored".to_string(),
            payload: serde_json::Value::String("exif".to_string()),
        }]);
        store_file(store.path(), &entry, b"hello");

        let plan = plan(
            &index_of(vec![entry]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(plan.stats.sidecar_restores, 0);
    }

    #[test]
    fn test_multi_session_warning() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let entry = file_entry("a.txt", "a.txt", b"hello");
        store_file(store.path(), &entry, b"hello");

        let mut index = index_of(vec![entry]);
        index.sessions = 2;
        let plan = plan(
            &index,
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(plan.warnings.len(), 1);
    }

    #[test]
    fn test_plan_cancelled() {
        let store = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let err = plan(
            &index_of(vec![file_entry("a.txt", "a.txt", b"hello")]),
            store.path(),
            target.path(),
            &LocalResolver,
            &PlanOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
