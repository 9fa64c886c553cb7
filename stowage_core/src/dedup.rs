//! Provenance-preserving deduplication.
//!
//! Byte-identical files are folded into a single canonical entry, with every
//! duplicate preserved in full on the canonical's `duplicates` list. The
//! equality key is the storage name (identity plus extension), not the raw
//! digest: two byte-identical files with different extensions are
//! deliberately not duplicates, because on-disk placement is keyed by name.
//!
//! The engine is split into a pure, read-only scan that produces actions and
//! a separate apply step that mutates the tree, so a caller can audit or
//! dry-run before committing. Deleting the folded files from disk is a third,
//! explicitly invoked step.

use crate::cancel::CancelFlag;
use crate::entry::{Entry, SIDECAR_SUFFIX};
use crate::error::Result;
use crate::hash::Identity;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Run-scoped mapping from storage name to the first-seen canonical entry.
///
/// Cross-run reuse is supported only through explicit pre-registration of a
/// prior run's canonicals before a new scan; there are never concurrent
/// writers.
#[derive(Debug, Default)]
pub struct DedupRegistry {
    canonicals: HashMap<String, Entry>,
}

impl DedupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prior run's canonical so this run's scan treats matching
    /// files as duplicates of it.
    pub fn preregister(&mut self, canonical: Entry) {
        self.canonicals
            .entry(canonical.storage_name().to_string())
            .or_insert(canonical);
    }

    /// The canonical registered for a storage name, if any.
    pub fn canonical(&self, storage_name: &str) -> Option<&Entry> {
        self.canonicals.get(storage_name)
    }

    pub fn len(&self) -> usize {
        self.canonicals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.canonicals.is_empty()
    }
}

/// One planned fold of a duplicate into its canonical. Ephemeral, never
/// persisted.
#[derive(Debug, Clone)]
pub struct DedupAction {
    /// The duplicate file entry, in full.
    pub duplicate: Entry,
    /// The first-seen canonical this duplicate folds into.
    pub canonical: Entry,
    /// The duplicate's path relative to the indexing root.
    pub relative: String,
    /// Identity of the duplicate's parent directory. `None` when the
    /// duplicate was the scan root itself.
    pub parent_id: Option<Identity>,
}

/// Scan statistics, accumulated in the single pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub files_scanned: u64,
    pub unique_files: u64,
    pub duplicates_found: u64,
    pub bytes_reclaimed: u64,
}

/// Deletion statistics for the explicit removal step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteStats {
    pub deleted: u64,
    pub sidecars_deleted: u64,
    pub failed: u64,
    pub bytes_freed: u64,
}

/// Depth-first, read-only duplicate scan.
///
/// The first file seen for each storage name registers as canonical; every
/// later occurrence produces a [`DedupAction`] referencing it. The progress
/// callback, when supplied, fires synchronously once per scanned file. The
/// cancellation flag is checked once per item.
pub fn scan(
    root: &Entry,
    registry: &mut DedupRegistry,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&Entry)>,
) -> Result<(Vec<DedupAction>, DedupStats)> {
    let mut actions = Vec::new();
    let mut stats = DedupStats::default();
    scan_node(root, None, registry, cancel, progress, &mut actions, &mut stats)?;
    Ok((actions, stats))
}

/// The parent is threaded down as an explicit traversal parameter; entries
/// hold no parent back-references.
fn scan_node(
    node: &Entry,
    parent: Option<&Entry>,
    registry: &mut DedupRegistry,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&Entry)>,
    actions: &mut Vec<DedupAction>,
    stats: &mut DedupStats,
) -> Result<()> {
    cancel.check()?;

    if node.is_file() {
        if let Some(callback) = progress {
            callback(node);
        }
        stats.files_scanned += 1;

        match registry.canonical(node.storage_name()) {
            None => {
                registry.preregister(node.clone());
                stats.unique_files += 1;
            }
            Some(canonical) => {
                stats.duplicates_found += 1;
                stats.bytes_reclaimed += node.size.bytes;
                actions.push(DedupAction {
                    duplicate: node.clone(),
                    canonical: canonical.clone(),
                    relative: node.location.relative.clone(),
                    parent_id: parent.map(|p| p.id.clone()),
                });
            }
        }
        return Ok(());
    }

    if let Some(children) = &node.children {
        for child in children {
            scan_node(child, Some(node), registry, cancel, progress, actions, stats)?;
        }
    }

    Ok(())
}

/// Apply a batch of fold actions to the tree.
///
/// For each action the duplicate is removed from its parent's children and
/// appended to the in-tree canonical's lazily-created duplicates list. A
/// failed removal or a canonical that is not part of this tree (cross-run
/// pre-registration) is logged and skipped; the batch never aborts.
///
/// Returns the number of duplicates actually merged.
pub fn apply(root: &mut Entry, actions: &[DedupAction]) -> usize {
    let mut merged = 0;

    for action in actions {
        // The duplicate carries the canonical's storage name too, so
        // presence is checked against the canonical's own location; a
        // name-only lookup would mistake the duplicate for its canonical
        // and drop the removed entry.
        if find_canonical_mut(root, &action.canonical).is_none() {
            debug!(
                storage_name = action.canonical.storage_name(),
                "canonical is not in this tree (cross-run registry); duplicate left in place"
            );
            continue;
        }

        let removed = match &action.parent_id {
            Some(parent_id) => remove_child(root, parent_id, &action.duplicate),
            None => None,
        };

        let Some(removed) = removed else {
            warn!(
                relative = action.relative,
                "duplicate not found under its parent; skipping"
            );
            continue;
        };

        // Re-resolve after the removal above mutated the tree.
        if let Some(canonical) = find_canonical_mut(root, &action.canonical) {
            canonical.push_duplicate(removed);
            merged += 1;
        }
    }

    merged
}

/// The in-tree file entry that is this action's canonical: same storage
/// name at the canonical's own relative location.
fn find_canonical_mut<'a>(node: &'a mut Entry, canonical: &Entry) -> Option<&'a mut Entry> {
    if node.is_file()
        && node.storage_name() == canonical.storage_name()
        && node.location.relative == canonical.location.relative
    {
        return Some(node);
    }
    if let Some(children) = &mut node.children {
        for child in children {
            if let Some(found) = find_canonical_mut(child, canonical) {
                return Some(found);
            }
        }
    }
    None
}

/// Remove the duplicate from the children of the directory with `parent_id`.
fn remove_child(node: &mut Entry, parent_id: &Identity, duplicate: &Entry) -> Option<Entry> {
    if node.id == *parent_id {
        let children = node.children.as_mut()?;
        let position = children.iter().position(|c| {
            c.id == duplicate.id && c.location.relative == duplicate.location.relative
        })?;
        return Some(children.remove(position));
    }
    if let Some(children) = &mut node.children {
        for child in children {
            if let Some(removed) = remove_child(child, parent_id, duplicate) {
                return Some(removed);
            }
        }
    }
    None
}

/// Delete the folded duplicates' files from disk.
///
/// Distinct from scan/apply so callers can audit first. Best-effort per
/// file: a failure is logged and the remaining deletions continue. An
/// orphaned sidecar with the duplicate's name is removed opportunistically.
pub fn delete_duplicate_files(actions: &[DedupAction], base: &Path, dry_run: bool) -> DeleteStats {
    let mut stats = DeleteStats::default();

    for action in actions {
        let path = base.join(&action.relative);

        if dry_run {
            stats.deleted += 1;
            stats.bytes_freed += action.duplicate.size.bytes;
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                stats.deleted += 1;
                stats.bytes_freed += action.duplicate.size.bytes;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to delete duplicate");
                stats.failed += 1;
                continue;
            }
        }

        let sidecar = sidecar_path(&path);
        if sidecar.exists() {
            match fs::remove_file(&sidecar) {
                Ok(()) => stats.sidecars_deleted += 1,
                Err(e) => {
                    warn!(path = %sidecar.display(), error = %e, "failed to delete orphaned sidecar");
                }
            }
        }
    }

    stats
}

/// The sidecar path that sits beside a content file.
pub fn sidecar_path(content_path: &Path) -> std::path::PathBuf {
    let mut name = content_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(SIDECAR_SUFFIX);
    content_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use crate::hash::{Algorithm, DEFAULT_ALGORITHMS, digest_bytes};

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

    fn tree(files: Vec<Entry>) -> Entry {
        let mut root = Entry::new_directory("root", "", None, Algorithm::Md5).unwrap();
        *root.children.as_mut().unwrap() = files;
        root.recompute_size();
        root
    }

    #[test]
    fn test_scan_two_identical_files() {
        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);

        let mut registry = DedupRegistry::new();
        let (actions, stats) =
            scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();

        assert_eq!(actions.len(), 1);
        assert_eq!(stats.files_scanned, 2);
        assert_eq!(stats.unique_files, 1);
        assert_eq!(stats.duplicates_found, 1);
        assert_eq!(stats.bytes_reclaimed, 5);

        let action = &actions[0];
        assert_eq!(action.relative, "b.txt");
        assert_eq!(action.canonical.name.as_deref(), Some("a.txt"));
        assert_eq!(action.parent_id, Some(root.id.clone()));
    }

    #[test]
    fn test_scan_is_read_only() {
        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);
        let before = root.clone();

        let mut registry = DedupRegistry::new();
        scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert_eq!(root, before);
    }

    #[test]
    fn test_n_copies_fold_to_one_canonical() {
        let n = 5;
        let files: Vec<Entry> = (0..n)
            .map(|i| {
                let name = format!("copy{}.txt", i);
                file_entry(&name, &name, b"same bytes")
            })
            .collect();
        let mut root = tree(files);

        let mut registry = DedupRegistry::new();
        let (actions, stats) =
            scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert_eq!(actions.len(), n - 1);
        assert_eq!(stats.unique_files, 1);
        // every action references the first-seen canonical
        for action in &actions {
            assert_eq!(action.canonical.name.as_deref(), Some("copy0.txt"));
        }

        let merged = apply(&mut root, &actions);
        assert_eq!(merged, n - 1);

        let children = root.children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        let canonical = &children[0];
        assert_eq!(canonical.name.as_deref(), Some("copy0.txt"));
        assert_eq!(canonical.duplicates.as_ref().unwrap().len(), n - 1);
        canonical.validate().unwrap();
    }

    #[test]
    fn test_hello_scenario_preserves_duplicate_fields() {
        // Two files a.txt and b.txt, both containing b"hello".
        let mut root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);
        let original_b = root.children.as_ref().unwrap()[1].clone();

        let mut registry = DedupRegistry::new();
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert_eq!(actions.len(), 1);

        apply(&mut root, &actions);

        let children = root.children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name.as_deref(), Some("a.txt"));

        let duplicates = children[0].duplicates.as_ref().unwrap();
        assert_eq!(duplicates.len(), 1);
        let dup = &duplicates[0];
        assert_eq!(dup.location.relative, "b.txt");
        assert_eq!(dup.size.bytes, 5);
        assert_eq!(
            dup.content.as_ref().unwrap().md5,
            digest_bytes(b"hello", DEFAULT_ALGORITHMS).md5
        );
        // every original field is intact
        assert_eq!(*dup, original_b);

        // merged tree round-trips through serialization byte-for-byte
        let json = serde_json::to_string(&root).unwrap();
        let parsed: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn test_equal_content_different_extension_not_merged() {
        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("a.jpg", "a.jpg", b"hello"),
        ]);

        let mut registry = DedupRegistry::new();
        let (actions, stats) =
            scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert!(actions.is_empty());
        assert_eq!(stats.unique_files, 2);
    }

    #[test]
    fn test_nested_duplicates_found_across_directories() {
        let mut sub = Entry::new_directory("sub", "sub", Some("root"), Algorithm::Md5).unwrap();
        sub.children
            .as_mut()
            .unwrap()
            .push(file_entry("deep.txt", "sub/deep.txt", b"hello"));

        let mut root = tree(vec![file_entry("a.txt", "a.txt", b"hello")]);
        root.children.as_mut().unwrap().push(sub);

        let mut registry = DedupRegistry::new();
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].relative, "sub/deep.txt");

        let merged = apply(&mut root, &actions);
        assert_eq!(merged, 1);

        let children = root.children.as_ref().unwrap();
        let sub = children.iter().find(|c| c.is_directory()).unwrap();
        assert!(sub.children.as_ref().unwrap().is_empty());
        let canonical = children.iter().find(|c| c.is_file()).unwrap();
        assert_eq!(canonical.duplicates.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_preregistered_canonical_claims_duplicates() {
        let prior = file_entry("old.txt", "old.txt", b"hello");
        let mut registry = DedupRegistry::new();
        registry.preregister(prior);

        let mut root = tree(vec![file_entry("new.txt", "new.txt", b"hello")]);
        let (actions, stats) =
            scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();

        assert_eq!(actions.len(), 1);
        assert_eq!(stats.unique_files, 0);
        assert_eq!(actions[0].canonical.name.as_deref(), Some("old.txt"));

        // the canonical is not part of this tree, so apply leaves the
        // duplicate in place rather than discarding it
        let before = root.children.as_ref().unwrap()[0].clone();
        let merged = apply(&mut root, &actions);
        assert_eq!(merged, 0);
        let children = root.children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0], before);
        assert!(children[0].duplicates.is_none());
    }

    #[test]
    fn test_cross_run_actions_leave_every_copy_in_place() {
        // All in-tree copies share the out-of-tree canonical's storage name;
        // none of them may be mistaken for it and detached.
        let prior = file_entry("old.txt", "old.txt", b"hello");
        let mut registry = DedupRegistry::new();
        registry.preregister(prior);

        let mut root = tree(vec![
            file_entry("one.txt", "one.txt", b"hello"),
            file_entry("two.txt", "two.txt", b"hello"),
        ]);
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();
        assert_eq!(actions.len(), 2);

        let merged = apply(&mut root, &actions);
        assert_eq!(merged, 0);
        let children = root.children.as_ref().unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.duplicates.is_none()));
    }

    #[test]
    fn test_scan_cancelled() {
        let root = tree(vec![file_entry("a.txt", "a.txt", b"hello")]);
        let cancel = CancelFlag::new();
        cancel.cancel();

        let mut registry = DedupRegistry::new();
        let result = scan(&root, &mut registry, &cancel, None);
        assert!(matches!(result, Err(crate::Error::Cancelled)));
    }

    #[test]
    fn test_progress_fires_once_per_file() {
        use std::cell::Cell;
        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"one"),
            file_entry("b.txt", "b.txt", b"two"),
        ]);

        let seen = Cell::new(0u32);
        let callback = |_: &Entry| seen.set(seen.get() + 1);
        let mut registry = DedupRegistry::new();
        scan(&root, &mut registry, &CancelFlag::new(), Some(&callback)).unwrap();
        assert_eq!(seen.get(), 2);
    }

    #[test]
    fn test_apply_missing_duplicate_is_skipped() {
        let mut root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);

        let mut registry = DedupRegistry::new();
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();

        // remove the duplicate out from under the batch
        root.children.as_mut().unwrap().truncate(1);
        let merged = apply(&mut root, &actions);
        assert_eq!(merged, 0);
        assert_eq!(root.children.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_duplicate_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("b.txt.stow.json"), b"{}").unwrap();

        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);
        let mut registry = DedupRegistry::new();
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();

        // dry run leaves everything on disk
        let stats = delete_duplicate_files(&actions, dir.path(), true);
        assert_eq!(stats.deleted, 1);
        assert!(dir.path().join("b.txt").exists());

        let stats = delete_duplicate_files(&actions, dir.path(), false);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.sidecars_deleted, 1);
        assert_eq!(stats.bytes_freed, 5);
        assert!(!dir.path().join("b.txt").exists());
        assert!(!dir.path().join("b.txt.stow.json").exists());
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_delete_missing_file_is_logged_not_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = tree(vec![
            file_entry("a.txt", "a.txt", b"hello"),
            file_entry("b.txt", "b.txt", b"hello"),
        ]);
        let mut registry = DedupRegistry::new();
        let (actions, _) = scan(&root, &mut registry, &CancelFlag::new(), None).unwrap();

        let stats = delete_duplicate_files(&actions, dir.path(), false);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.deleted, 0);
    }

    #[test]
    fn test_registry_kinds() {
        let mut registry = DedupRegistry::new();
        assert!(registry.is_empty());
        registry.preregister(file_entry("a.txt", "a.txt", b"x"));
        assert_eq!(registry.len(), 1);
        assert_eq!(
            registry
                .canonical(&file_entry("b.txt", "b.txt", b"x").attributes.storage_name)
                .unwrap()
                .kind,
            EntryKind::File
        );
    }
}
