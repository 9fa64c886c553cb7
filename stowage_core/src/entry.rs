//! The indexed-entry tree model.
//!
//! An [`Entry`] is the recursive record for one file or directory. Entries
//! are built once per index run, live in memory or as persisted JSON records,
//! and are the only thing the dedup, rename and rollback engines operate on.
//!
//! Invariants:
//! - `attributes.storage_name == identity [+ "." + extension]`
//! - `name` and `name_digest` are co-null
//! - a present `duplicates` list is never empty and every member shares the
//!   owner's storage name
//! - files carry a content digest set and no children; directories carry no
//!   content digest set and their size is the sum of descendant sizes

use crate::error::{Error, Result};
use crate::hash::{
    Algorithm, DigestSet, Identity, IdentityPrefix, digest_directory_identity, digest_text,
    select_identity,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;

/// Current persisted-record schema version. Strictly checked on load; there
/// is no best-effort parsing of other versions.
pub const SCHEMA_VERSION: u32 = 4;

/// Suffix of an in-place sidecar record written beside its content file.
pub const SIDECAR_SUFFIX: &str = ".stow.json";

/// Entry type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One timestamp persisted as a calendar string plus exact epoch millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampPair {
    pub calendar: String,
    pub millis: i64,
}

impl TimestampPair {
    /// Build from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        let calendar = DateTime::<Utc>::from_timestamp_millis(millis)
            .map(|dt| dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
            .unwrap_or_default();
        Self { calendar, millis }
    }

    /// Build from a filesystem timestamp.
    pub fn from_system_time(time: SystemTime) -> Self {
        let millis = DateTime::<Utc>::from(time).timestamp_millis();
        Self::from_millis(millis)
    }

    /// Now, for entries whose source exposes no usable timestamp.
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }
}

/// Size persisted as display text plus the exact byte count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub display: String,
    pub bytes: u64,
}

impl SizeInfo {
    pub fn from_bytes(bytes: u64) -> Self {
        Self {
            display: human_size(bytes),
            bytes,
        }
    }
}

/// Human-readable size, 1024-based.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Where an entry sits in the indexed tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Path relative to the indexing root.
    pub relative: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_id: Option<Identity>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent_name: Option<String>,
}

/// On-disk attributes of the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    pub is_link: bool,
    /// Deterministic content-addressed filename: identity plus extension.
    pub storage_name: String,
}

/// Origin of a metadata record attached to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataOrigin {
    /// Extracted from inside the content file.
    Embedded,
    /// Absorbed from a sidecar file that sat beside the content file.
    Sidecar,
}

/// Declared payload format of a metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Structured data, restored as formatted JSON text.
    Json,
    /// Plain text, passed through.
    Text,
    /// Base64-encoded binary, restored as raw bytes.
    Binary,
    /// Array of lines, restored newline-joined.
    Lines,
}

/// A metadata record carried by an entry, restorable on rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub origin: MetadataOrigin,
    pub format: PayloadFormat,
    /// Filename the record restores to, relative to its owner's directory.
    pub target_name: String,
    pub payload: serde_json::Value,
}

impl MetadataRecord {
    /// Decode the payload to the bytes written on restoration, per the
    /// declared format.
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        match self.format {
            PayloadFormat::Json => {
                let text = serde_json::to_string_pretty(&self.payload)
                    .map_err(|e| Error::invalid_entry(format!("unencodable payload: {}", e)))?;
                Ok(text.into_bytes())
            }
            PayloadFormat::Text => match &self.payload {
                serde_json::Value::String(s) => Ok(s.clone().into_bytes()),
                other => Err(Error::invalid_entry(format!(
                    "text payload is not a string: {}",
                    other
                ))),
            },
            PayloadFormat::Binary => match &self.payload {
                serde_json::Value::String(s) => BASE64
                    .decode(s.as_bytes())
                    .map_err(|e| Error::invalid_entry(format!("invalid base64 payload: {}", e))),
                other => Err(Error::invalid_entry(format!(
                    "binary payload is not a string: {}",
                    other
                ))),
            },
            PayloadFormat::Lines => match &self.payload {
                serde_json::Value::Array(items) => {
                    let mut lines = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            serde_json::Value::String(s) => lines.push(s.as_str()),
                            other => {
                                return Err(Error::invalid_entry(format!(
                                    "line payload item is not a string: {}",
                                    other
                                )));
                            }
                        }
                    }
                    Ok(lines.join("\n").into_bytes())
                }
                other => Err(Error::invalid_entry(format!(
                    "lines payload is not an array: {}",
                    other
                ))),
            },
        }
    }
}

/// The recursive record for one indexed file or directory.
///
/// Serde field order is the persisted record layout; the top-level key is
/// always `schema_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub schema_version: u32,
    pub id: Identity,
    pub id_algorithm: Algorithm,
    pub kind: EntryKind,
    pub name: Option<String>,
    pub name_digest: Option<String>,
    pub extension: Option<String>,
    pub size: SizeInfo,
    /// Content digest set. Always null for directories.
    pub content: Option<DigestSet>,
    pub location: Location,
    pub created: TimestampPair,
    pub modified: TimestampPair,
    pub accessed: TimestampPair,
    pub attributes: Attributes,
    /// Null for files; `None` on a directory also means a shallow scan.
    pub children: Option<Vec<Entry>>,
    pub metadata: Option<Vec<MetadataRecord>>,
    /// Byte-identical entries folded into this canonical. Never present empty.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub duplicates: Option<Vec<Entry>>,
}

/// Derive the storage name from an identity and an optional extension.
pub fn storage_name_for(id: &Identity, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !ext.is_empty() => format!("{}.{}", id, ext),
        _ => id.to_string(),
    }
}

/// Extension of a filename, without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_string())
}

impl Entry {
    /// Build a file entry from a content digest set.
    ///
    /// Timestamps default to now; callers with real filesystem metadata
    /// overwrite them.
    pub fn new_file(
        name: &str,
        relative: &str,
        size_bytes: u64,
        content: DigestSet,
        algorithm: Algorithm,
    ) -> Result<Self> {
        let id = select_identity(&content, algorithm, IdentityPrefix::File)?;
        let extension = extension_of(name);
        let storage_name = storage_name_for(&id, extension.as_deref());
        let name_digest = digest_text(Some(name), &[algorithm])
            .get(algorithm)
            .map(|d| d.to_string());
        let now = TimestampPair::now();

        Ok(Entry {
            schema_version: SCHEMA_VERSION,
            id,
            id_algorithm: algorithm,
            kind: EntryKind::File,
            name: Some(name.to_string()),
            name_digest,
            extension,
            size: SizeInfo::from_bytes(size_bytes),
            content: Some(content),
            location: Location {
                relative: relative.to_string(),
                parent_id: None,
                parent_name: None,
            },
            created: now.clone(),
            modified: now.clone(),
            accessed: now,
            attributes: Attributes {
                is_link: false,
                storage_name,
            },
            children: None,
            metadata: None,
            duplicates: None,
        })
    }

    /// Build a directory entry. Identity derives from the name and parent
    /// name, never from the directory's contents.
    pub fn new_directory(
        name: &str,
        relative: &str,
        parent_name: Option<&str>,
        algorithm: Algorithm,
    ) -> Result<Self> {
        let digests = digest_directory_identity(name, parent_name, &[algorithm]);
        let id = select_identity(&digests, algorithm, IdentityPrefix::Directory)?;
        let storage_name = storage_name_for(&id, None);
        let name_digest = digest_text(Some(name), &[algorithm])
            .get(algorithm)
            .map(|d| d.to_string());
        let now = TimestampPair::now();

        Ok(Entry {
            schema_version: SCHEMA_VERSION,
            id,
            id_algorithm: algorithm,
            kind: EntryKind::Directory,
            name: Some(name.to_string()),
            name_digest,
            extension: None,
            size: SizeInfo::from_bytes(0),
            content: None,
            location: Location {
                relative: relative.to_string(),
                parent_id: None,
                parent_name: parent_name.map(|p| p.to_string()),
            },
            created: now.clone(),
            modified: now.clone(),
            accessed: now,
            attributes: Attributes {
                is_link: false,
                storage_name,
            },
            children: Some(Vec::new()),
            metadata: None,
            duplicates: None,
        })
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// The deterministic on-disk filename this entry renames to.
    pub fn storage_name(&self) -> &str {
        &self.attributes.storage_name
    }

    /// Append a duplicate, creating the list lazily.
    pub fn push_duplicate(&mut self, duplicate: Entry) {
        self.duplicates.get_or_insert_with(Vec::new).push(duplicate);
    }

    /// Recompute this directory's size as the sum of its descendants.
    /// No-op for files.
    pub fn recompute_size(&mut self) {
        if let Some(children) = &mut self.children {
            let mut total = 0u64;
            for child in children.iter_mut() {
                child.recompute_size();
                total += child.size.bytes;
            }
            self.size = SizeInfo::from_bytes(total);
        }
    }

    /// Validate the tree-model invariants on this entry and its subtree.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(Error::invalid_entry(format!(
                "schema version {} on in-memory entry",
                self.schema_version
            )));
        }

        if self.name.is_some() != self.name_digest.is_some() {
            return Err(Error::invalid_entry(
                "name and name digest must both be present or both absent",
            ));
        }

        let expected = storage_name_for(&self.id, self.extension.as_deref());
        if self.attributes.storage_name != expected {
            return Err(Error::invalid_entry(format!(
                "storage name {} does not match identity-derived {}",
                self.attributes.storage_name, expected
            )));
        }

        match self.kind {
            EntryKind::File => {
                if self.content.is_none() {
                    return Err(Error::invalid_entry("file entry without content digests"));
                }
                if self.children.is_some() {
                    return Err(Error::invalid_entry("file entry with children"));
                }
            }
            EntryKind::Directory => {
                if self.content.is_some() {
                    return Err(Error::invalid_entry("directory entry with content digests"));
                }
            }
        }

        if let Some(duplicates) = &self.duplicates {
            if duplicates.is_empty() {
                return Err(Error::invalid_entry("present duplicates list is empty"));
            }
            for dup in duplicates {
                if dup.attributes.storage_name != self.attributes.storage_name {
                    return Err(Error::invalid_entry(format!(
                        "duplicate {} does not share storage name {}",
                        dup.attributes.storage_name, self.attributes.storage_name
                    )));
                }
                dup.validate()?;
            }
        }

        if let Some(children) = &self.children {
            for child in children {
                child.validate()?;
            }
        }

        Ok(())
    }
}
