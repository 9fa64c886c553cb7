//! The rollback engine: reconstruct original names, placement, timestamps
//! and attached metadata from persisted index records.
//!
//! Rollback is a strict plan-then-execute pipeline:
//!
//! 1. [`load`] parses persisted records into a flat list of restorable
//!    entries, lifting nested duplicates into the list with their provenance
//!    tracked out-of-band.
//! 2. [`plan`] resolves content sources, computes and validates targets, and
//!    produces an ordered action list without touching the filesystem beyond
//!    reads.
//! 3. [`execute`] applies the plan in phase order, with per-action
//!    best-effort error handling and cooperative cancellation.
//!
//! Nothing in this module ever writes during planning; auditing a plan is
//! always safe.

mod execute;
mod load;
mod plan;

pub use execute::{RollbackResult, execute};
pub use load::{LoadedIndex, load_path};
pub use plan::{
    ActionKind, LocalResolver, PlanOptions, PlanStats, RollbackAction, RollbackPlan, SkipReason,
    SourceResolver, TargetMode, plan,
};
