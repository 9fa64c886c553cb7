//! # Stowage Core
//!
//! Content-addressed file indexing with provenance-preserving deduplication
//! and rollback.
//!
//! Files and directories are indexed into a recursive entry tree whose
//! identities derive from content (files) or name and placement
//! (directories). From that tree the library can fold byte-identical files
//! into a single canonical entry without losing any duplicate's own record,
//! rename files to their deterministic storage names, and later reconstruct
//! the original names, layout, timestamps and attached metadata from the
//! persisted records alone.
//!
//! ## Example
//!
//! ```no_run
//! use stowage_core::{BuildOptions, CancelFlag, DedupRegistry, build_path, dedup};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancelFlag::new();
//!
//! // Index a directory into an entry tree
//! let mut tree = build_path(Path::new("./photos"), &BuildOptions::default(), &cancel, None)?;
//!
//! // Fold byte-identical files into canonicals, keeping full provenance
//! let mut registry = DedupRegistry::new();
//! let (actions, stats) = dedup::scan(&tree, &mut registry, &cancel, None)?;
//! dedup::apply(&mut tree, &actions);
//! println!("{} duplicates folded", stats.duplicates_found);
//! # Ok(())
//! # }
//! ```

mod builder;
mod cancel;
pub mod dedup;
mod entry;
mod error;
pub mod hash;
pub mod rename;
pub mod rollback;

pub use builder::{BuildOptions, build_path, write_sidecar_records};
pub use cancel::CancelFlag;
pub use dedup::{DedupAction, DedupRegistry, DedupStats, DeleteStats};
pub use entry::{
    Entry, EntryKind, Location, MetadataOrigin, MetadataRecord, PayloadFormat, SCHEMA_VERSION,
    SIDECAR_SUFFIX, SizeInfo, TimestampPair,
};
pub use error::{Error, Result};
pub use hash::{Algorithm, DigestSet, Identity, IdentityPrefix};
pub use rollback::{
    ActionKind, LoadedIndex, LocalResolver, PlanOptions, RollbackPlan, RollbackResult, SkipReason,
    SourceResolver, TargetMode,
};
