//! Change sets: versioned, ordered drift deltas and coverage snapshots.

use std::fmt;

use serde::{Deserialize, Serialize};

use driftwatch_common::{Error, ResourceId, Result};

use crate::snapshot::{DriftCategory, DriftEntry};

/// Category of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeSetCategory {
    /// A full, resynchronized state: every tracked file, version 0.
    Coverage,
    /// A delta against the previous coverage plus subsequent drifts.
    Drift,
}

impl ChangeSetCategory {
    /// Stable lowercase name, used in archive filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeSetCategory::Coverage => "coverage",
            ChangeSetCategory::Drift => "drift",
        }
    }

    /// Parse the stable name back into a category.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "coverage" => Ok(ChangeSetCategory::Coverage),
            "drift" => Ok(ChangeSetCategory::Drift),
            other => Err(Error::InvalidInput(format!(
                "Unknown change set category: {}",
                other
            ))),
        }
    }

    /// The category a change set of the given version must have.
    pub fn for_version(version: u64) -> Self {
        if version == 0 {
            ChangeSetCategory::Coverage
        } else {
            ChangeSetCategory::Drift
        }
    }
}

impl fmt::Display for ChangeSetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Archive identity of a change set.
///
/// This quadruple is the idempotency key at the transport boundary: the peer
/// deduplicates redelivered archives by it and by nothing else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeSetId {
    pub resource_id: ResourceId,
    pub config_name: String,
    pub category: ChangeSetCategory,
    pub version: u64,
}

impl ChangeSetId {
    /// Identity of the change set this one supersedes, if any.
    pub fn predecessor(&self) -> Option<ChangeSetId> {
        if self.version == 0 {
            return None;
        }
        let version = self.version - 1;
        Some(ChangeSetId {
            resource_id: self.resource_id,
            config_name: self.config_name.clone(),
            category: ChangeSetCategory::for_version(version),
            version,
        })
    }
}

impl fmt::Display for ChangeSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}-{}",
            self.resource_id, self.config_name, self.category, self.version
        )
    }
}

/// An ordered sequence of tagged entries for one configuration at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub resource_id: ResourceId,
    pub config_name: String,
    pub category: ChangeSetCategory,
    /// Monotonically increasing, gap-free once coverage (version 0) exists.
    pub version: u64,
    /// Entries ordered by relative path ascending.
    pub entries: Vec<DriftEntry>,
}

impl ChangeSet {
    /// The archive identity of this change set.
    pub fn id(&self) -> ChangeSetId {
        ChangeSetId {
            resource_id: self.resource_id,
            config_name: self.config_name.clone(),
            category: self.category,
            version: self.version,
        }
    }

    /// Whether an entry's file bytes travel with the archive.
    ///
    /// Added and changed entries always carry content; a coverage change set
    /// carries content for every entry, since it establishes the baseline the
    /// peer resynchronizes from.
    pub fn carries_content(&self, entry: &DriftEntry) -> bool {
        matches!(
            entry.category,
            DriftCategory::Added | DriftCategory::Changed
        ) || self.category == ChangeSetCategory::Coverage
    }

    /// Whether this change set carries any file content.
    pub fn has_content(&self) -> bool {
        self.entries.iter().any(|e| self.carries_content(e))
    }

    /// Digests of all entries whose content travels with the archive.
    pub fn content_digests(&self) -> Vec<driftwatch_digest::ContentDigest> {
        self.entries
            .iter()
            .filter(|e| self.carries_content(e))
            .map(|e| e.digest)
            .collect()
    }
}
