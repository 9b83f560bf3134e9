//! Durable local persistence of change sets.
//!
//! Change sets are packaged as zip archives (a machine-readable manifest
//! plus content-addressed file blobs) and laid out on disk per resource and
//! configuration, together with the current diff baseline and a small gate
//! marker that survives process restarts.

pub mod archive;
pub mod store;

pub use archive::{ArchiveManifest, CONTENT_PREFIX, MANIFEST_NAME};
pub use store::{
    ChangeSetHandle, ChangeSetStore, GateMarker, GateStatus, PendingChangeSet, MARKER_FILENAME,
    SNAPSHOT_FILENAME,
};
