//! Building entry trees from the filesystem.
//!
//! A build is one indexing pass over a file or directory, producing the
//! in-memory [`Entry`] tree the other engines operate on. The pass reads
//! content exactly once per file, feeding all configured digest algorithms
//! in the same streaming pass.

use crate::cancel::CancelFlag;
use crate::dedup::sidecar_path;
use crate::entry::{
    Entry, MetadataOrigin, MetadataRecord, PayloadFormat, SIDECAR_SUFFIX, TimestampPair,
};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, DEFAULT_ALGORITHMS, digest_content, digest_text};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// Build configuration.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Digest algorithms fed in the single content pass. Always contains at
    /// least the defaults.
    pub algorithms: Vec<Algorithm>,
    /// The algorithm identities derive from.
    pub identity: Algorithm,
    /// Absorb `.stow.json` sidecars into their owner's metadata instead of
    /// indexing them as files.
    pub absorb_sidecars: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            algorithms: DEFAULT_ALGORITHMS.to_vec(),
            identity: Algorithm::Md5,
            absorb_sidecars: true,
        }
    }
}

impl BuildOptions {
    /// Ensure the mandatory algorithms and the identity algorithm are
    /// present in the configured set.
    pub fn normalized(mut self) -> Self {
        for required in DEFAULT_ALGORITHMS {
            if !self.algorithms.contains(required) {
                self.algorithms.push(*required);
            }
        }
        if !self.algorithms.contains(&self.identity) {
            self.algorithms.push(self.identity);
        }
        self
    }
}

/// Index a file or directory into an entry tree.
///
/// The cancellation flag is checked once per visited item and once per
/// content chunk. The progress callback, when supplied, fires synchronously
/// once per indexed file. Only the root path itself must be readable; an
/// item inside a directory that cannot be walked, named, or statted is
/// logged and skipped.
pub fn build_path(
    path: &Path,
    options: &BuildOptions,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&Path)>,
) -> Result<Entry> {
    if !path.exists() {
        return Err(Error::invalid_target(path, "path does not exist"));
    }

    let name = file_name_of(path)?;
    let metadata = fs::symlink_metadata(path)?;

    let mut root = if metadata.is_dir() {
        build_directory(path, &name, "", None, options, cancel, progress)?
    } else {
        build_file(path, &name, &name, options, cancel, progress)?
    };
    root.recompute_size();
    Ok(root)
}

fn build_directory(
    path: &Path,
    name: &str,
    relative: &str,
    parent_name: Option<&str>,
    options: &BuildOptions,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&Path)>,
) -> Result<Entry> {
    cancel.check()?;

    let mut dir = Entry::new_directory(name, relative, parent_name, options.identity)?;
    apply_timestamps(&mut dir, path);

    let walker = ignore::WalkBuilder::new(path)
        .max_depth(Some(1))
        .hidden(false)
        .git_ignore(true)
        .sort_by_file_name(std::ffi::OsStr::cmp)
        .build();

    for item in walker {
        let item = match item {
            Ok(item) => item,
            Err(e) => {
                warn!(error = %e, "skipping unwalkable item");
                continue;
            }
        };
        let item_path = item.path();
        if item_path == path {
            continue;
        }

        cancel.check()?;

        let item_name = match file_name_of(item_path) {
            Ok(item_name) => item_name,
            Err(e) => {
                warn!(path = %item_path.display(), error = %e, "skipping item");
                continue;
            }
        };
        if options.absorb_sidecars && item_name.ends_with(SIDECAR_SUFFIX) {
            continue;
        }

        let item_relative = join_relative(relative, &item_name);
        let metadata = match fs::symlink_metadata(item_path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %item_path.display(), error = %e, "skipping unstatable item");
                continue;
            }
        };

        let built = if metadata.is_dir() {
            build_directory(
                item_path,
                &item_name,
                &item_relative,
                Some(name),
                options,
                cancel,
                progress,
            )
        } else {
            build_file(item_path, &item_name, &item_relative, options, cancel, progress)
        };
        let mut child = match built {
            Ok(child) => child,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(path = %item_path.display(), error = %e, "skipping item");
                continue;
            }
        };
        child.location.parent_id = Some(dir.id.clone());
        child.location.parent_name = Some(name.to_string());
        dir.children.get_or_insert_with(Vec::new).push(child);
    }

    Ok(dir)
}

fn build_file(
    path: &Path,
    name: &str,
    relative: &str,
    options: &BuildOptions,
    cancel: &CancelFlag,
    progress: Option<&dyn Fn(&Path)>,
) -> Result<Entry> {
    cancel.check()?;
    if let Some(callback) = progress {
        callback(path);
    }

    let metadata = fs::symlink_metadata(path)?;
    let is_link = metadata.file_type().is_symlink();

    let content = match digest_content(path, &options.algorithms, cancel) {
        Ok(digests) => digests,
        Err(Error::Cancelled) => return Err(Error::Cancelled),
        Err(e) => {
            // unreadable content falls back to a name-derived digest so the
            // rest of the pass continues
            warn!(path = %path.display(), error = %e, "content unreadable; using name digest");
            digest_text(Some(name), &options.algorithms)
        }
    };

    let mut entry = Entry::new_file(name, relative, metadata.len(), content, options.identity)?;
    entry.attributes.is_link = is_link;
    apply_timestamps(&mut entry, path);

    if options.absorb_sidecars {
        absorb_sidecar(&mut entry, path);
    }

    Ok(entry)
}

/// Absorb a sidecar sitting beside the content file into the entry's
/// metadata. JSON sidecars keep their structure; anything else is carried
/// as text.
fn absorb_sidecar(entry: &mut Entry, content_path: &Path) {
    let sidecar = sidecar_path(content_path);
    let Ok(text) = fs::read_to_string(&sidecar) else {
        return;
    };
    debug!(path = %sidecar.display(), "absorbing sidecar");

    let target_name = sidecar
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let record = match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(value) => MetadataRecord {
            origin: MetadataOrigin::Sidecar,
            format: PayloadFormat::Json,
            target_name,
            payload: value,
        },
        Err(_) => MetadataRecord {
            origin: MetadataOrigin::Sidecar,
            format: PayloadFormat::Text,
            target_name,
            payload: serde_json::Value::String(text),
        },
    };
    entry.metadata.get_or_insert_with(Vec::new).push(record);
}

fn apply_timestamps(entry: &mut Entry, path: &Path) {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return;
    };
    if let Ok(modified) = metadata.modified() {
        entry.modified = TimestampPair::from_system_time(modified);
    }
    if let Ok(accessed) = metadata.accessed() {
        entry.accessed = TimestampPair::from_system_time(accessed);
    }
    // not every filesystem records creation time
    match metadata.created() {
        Ok(created) => entry.created = TimestampPair::from_system_time(created),
        Err(_) => entry.created = entry.modified.clone(),
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_string())
        .ok_or_else(|| Error::invalid_target(path, "not a valid UTF-8 filename"))
}

fn join_relative(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Persist one record per file entry, beside the file it describes.
///
/// The record path is the file's path under `base` plus the sidecar suffix.
/// Returns the number of records written.
pub fn write_sidecar_records(root: &Entry, base: &Path, dry_run: bool) -> Result<u64> {
    let mut written = 0;
    write_sidecar_records_inner(root, base, dry_run, &mut written)?;
    Ok(written)
}

fn write_sidecar_records_inner(
    node: &Entry,
    base: &Path,
    dry_run: bool,
    written: &mut u64,
) -> Result<()> {
    if node.is_file() {
        if !dry_run {
            let record_path = sidecar_path(&base.join(&node.location.relative));
            let json = serde_json::to_string_pretty(node)
                .map_err(|e| Error::invalid_entry(format!("unencodable record: {}", e)))?;
            fs::write(record_path, json)?;
        }
        *written += 1;
        return Ok(());
    }
    if let Some(children) = &node.children {
        for child in children {
            write_sidecar_records_inner(child, base, dry_run, written)?;
        }
    }
    Ok(())
}
