//! Loading persisted index records for rollback.
//!
//! Accepts the three persisted shapes: a single per-file record, an
//! aggregate tree record, or a directory holding a batch of records. All
//! shapes flatten to one list of file entries. Entries nested in a
//! canonical's duplicates list are lifted into the flat list, with their
//! provenance kept in a side table keyed by flat-list index rather than on
//! the entries themselves.

use crate::entry::{Entry, SCHEMA_VERSION};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

/// A flattened, restorable view of one or more persisted records.
#[derive(Debug, Default)]
pub struct LoadedIndex {
    /// File entries in record order, duplicates lifted in place behind
    /// their canonical.
    pub entries: Vec<Entry>,
    /// Flat-list index of a lifted duplicate, mapped to the storage name of
    /// the canonical that carried it. Rebuilt on every load; never persisted.
    pub duplicate_of: HashMap<usize, String>,
    /// Distinct record sources contributing entries. More than one means the
    /// planner is mixing indexing sessions and warns.
    pub sessions: usize,
}

impl LoadedIndex {
    /// Whether the entry at a flat-list index was lifted from a duplicates
    /// list.
    pub fn is_duplicate(&self, index: usize) -> bool {
        self.duplicate_of.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Load records from a path that is either a single record file or a
/// directory of record files.
///
/// For a directory, every `.json` file directly inside it is loaded, in
/// name order; `recursive` also descends into subdirectories. Any record
/// whose declared schema version is not the supported one fails the whole
/// load before anything else happens.
pub fn load_path(path: &Path, recursive: bool) -> Result<LoadedIndex> {
    let mut index = LoadedIndex::default();

    if path.is_file() {
        load_record_file(path, &mut index)?;
    } else {
        load_record_dir(path, recursive, &mut index)?;
    }

    debug!(
        entries = index.entries.len(),
        duplicates = index.duplicate_of.len(),
        sessions = index.sessions,
        "loaded index records"
    );
    Ok(index)
}

fn load_record_dir(dir: &Path, recursive: bool, index: &mut LoadedIndex) -> Result<()> {
    let mut paths: Vec<_> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    paths.sort();

    let mut saw_standalone = false;
    for path in paths {
        if path.is_dir() {
            if recursive {
                load_record_dir(&path, true, index)?;
            }
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }

        let entry = parse_record(&path)?;
        if entry.is_file() {
            // a batch of per-file records in one directory is one session
            if !saw_standalone {
                index.sessions += 1;
                saw_standalone = true;
            }
        } else {
            index.sessions += 1;
        }
        flatten(entry, index);
    }
    Ok(())
}

/// Parse one record file and flatten its entries into the index.
fn load_record_file(path: &Path, index: &mut LoadedIndex) -> Result<()> {
    let entry = parse_record(path)?;
    index.sessions += 1;
    flatten(entry, index);
    Ok(())
}

/// Parse and schema-gate a single record.
///
/// The version is checked on the raw JSON value before the full record is
/// deserialized, so an incompatible record fails with the migration error
/// rather than an opaque field mismatch.
fn parse_record(path: &Path) -> Result<Entry> {
    let text = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Error::invalid_record(path, format!("not valid JSON: {}", e)))?;

    let found = value
        .get("schema_version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::invalid_record(path, "missing schema_version"))?;
    if found != u64::from(SCHEMA_VERSION) {
        return Err(Error::unsupported_schema_version(found, SCHEMA_VERSION));
    }

    serde_json::from_value(value).map_err(|e| Error::invalid_record(path, e.to_string()))
}

/// Flatten a record tree into restorable file entries.
///
/// Directories contribute their descendants; each file contributes itself
/// followed by its lifted duplicates. Lifted copies are stripped of nesting
/// so they stand alone in the flat list.
fn flatten(entry: Entry, index: &mut LoadedIndex) {
    if entry.is_directory() {
        if let Some(children) = entry.children {
            for child in children {
                flatten(child, index);
            }
        }
        return;
    }

    let mut canonical = entry;
    let duplicates = canonical.duplicates.take();
    let canonical_storage = canonical.storage_name().to_string();
    index.entries.push(canonical);

    if let Some(duplicates) = duplicates {
        for mut dup in duplicates {
            dup.duplicates = None;
            dup.children = None;
            index
                .duplicate_of
                .insert(index.entries.len(), canonical_storage.clone());
            index.entries.push(dup);
        }
    }
}
