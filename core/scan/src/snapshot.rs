//! Snapshot: an ordered, comparable view of a directory tree.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use driftwatch_digest::ContentDigest;

/// Change category for a single snapshot entry.
///
/// A closed set: entries in a full coverage snapshot are always `Unchanged`;
/// entries in a drift delta carry one of the other three tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriftCategory {
    Added,
    Changed,
    Deleted,
    Unchanged,
}

/// One tracked file within a snapshot or change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftEntry {
    /// Path relative to the configuration's base directory.
    pub relative_path: String,
    /// Content digest. The digest, not the timestamp, is authoritative.
    pub digest: ContentDigest,
    /// Last modification time observed at scan time.
    pub last_modified: DateTime<Utc>,
    /// Change category of this entry.
    pub category: DriftCategory,
}

impl DriftEntry {
    /// Create an entry tagged `Unchanged`.
    pub fn new(
        relative_path: impl Into<String>,
        digest: ContentDigest,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            relative_path: relative_path.into(),
            digest,
            last_modified,
            category: DriftCategory::Unchanged,
        }
    }

    /// Copy of this entry with a different category tag.
    pub fn with_category(&self, category: DriftCategory) -> Self {
        Self {
            category,
            ..self.clone()
        }
    }
}

/// A point-in-time snapshot of all tracked files under a base directory.
///
/// Entries are kept sorted by relative path (byte-wise ascending) so that
/// serialization and diffing are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    entries: Vec<DriftEntry>,
}

impl Snapshot {
    /// Create a snapshot from entries, sorting them by relative path.
    pub fn new(mut entries: Vec<DriftEntry>) -> Self {
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Self { entries }
    }

    /// Create an empty snapshot.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of tracked files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the snapshot tracks no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The ordered entries.
    pub fn entries(&self) -> &[DriftEntry] {
        &self.entries
    }

    /// Look up an entry by relative path.
    pub fn get(&self, relative_path: &str) -> Option<&DriftEntry> {
        self.entries
            .binary_search_by(|e| e.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Diff this snapshot (the previous state) against a newer one.
    ///
    /// A merge-style walk over both sorted entry lists, O(n) in entry count.
    /// Paths only in `newer` become `Added`, paths only in `self` become
    /// `Deleted` (carrying the previously observed digest), and paths in both
    /// with differing digests become `Changed`. Identical digests are omitted
    /// even if the modification time moved.
    pub fn diff(&self, newer: &Snapshot) -> Vec<DriftEntry> {
        let old = &self.entries;
        let new = &newer.entries;
        let mut delta = Vec::new();
        let (mut i, mut j) = (0, 0);

        while i < old.len() && j < new.len() {
            match old[i].relative_path.cmp(&new[j].relative_path) {
                Ordering::Less => {
                    delta.push(old[i].with_category(DriftCategory::Deleted));
                    i += 1;
                }
                Ordering::Greater => {
                    delta.push(new[j].with_category(DriftCategory::Added));
                    j += 1;
                }
                Ordering::Equal => {
                    if old[i].digest != new[j].digest {
                        delta.push(new[j].with_category(DriftCategory::Changed));
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        while i < old.len() {
            delta.push(old[i].with_category(DriftCategory::Deleted));
            i += 1;
        }
        while j < new.len() {
            delta.push(new[j].with_category(DriftCategory::Added));
            j += 1;
        }

        delta
    }

    /// Apply a delta to this snapshot, producing the resulting snapshot.
    ///
    /// `Added`/`Changed` entries replace or insert (normalized back to
    /// `Unchanged`); `Deleted` entries remove. Applying `a.diff(&b)` to `a`
    /// reproduces `b`'s tracked content.
    pub fn apply(&self, delta: &[DriftEntry]) -> Snapshot {
        let mut map: BTreeMap<String, DriftEntry> = self
            .entries
            .iter()
            .map(|e| (e.relative_path.clone(), e.clone()))
            .collect();

        for entry in delta {
            match entry.category {
                DriftCategory::Added | DriftCategory::Changed | DriftCategory::Unchanged => {
                    map.insert(
                        entry.relative_path.clone(),
                        entry.with_category(DriftCategory::Unchanged),
                    );
                }
                DriftCategory::Deleted => {
                    map.remove(&entry.relative_path);
                }
            }
        }

        Snapshot {
            entries: map.into_values().collect(),
        }
    }
}
