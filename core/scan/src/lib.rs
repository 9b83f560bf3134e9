//! Snapshot model and change-set generation.
//!
//! A snapshot is an ordered, content-addressed view of every tracked file
//! under a base directory. The generator walks a configured tree, diffs the
//! new snapshot against the previous baseline, and emits a versioned change
//! set tagged with add/change/delete entries.

pub mod changeset;
pub mod filter;
pub mod scanner;
pub mod snapshot;

pub use changeset::{ChangeSet, ChangeSetCategory, ChangeSetId};
pub use filter::PathFilter;
pub use scanner::{Baseline, DriftScanner, GeneratedChangeSet};
pub use snapshot::{DriftCategory, DriftEntry, Snapshot};
