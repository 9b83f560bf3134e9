//! Change-set generation: walk the tree, digest files, diff against the
//! previous baseline.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};

use driftwatch_common::{DriftConfiguration, Error, ResourceId, Result};
use driftwatch_digest::ContentDigest;

use crate::changeset::{ChangeSet, ChangeSetCategory};
use crate::filter::PathFilter;
use crate::snapshot::{DriftEntry, Snapshot};

/// The diff baseline for one configuration: the last durably persisted
/// snapshot and the version of the change set that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub version: u64,
    pub snapshot: Snapshot,
}

/// Output of a detection run that emitted a change set.
#[derive(Debug, Clone)]
pub struct GeneratedChangeSet {
    /// The change set to persist and ship.
    pub change_set: ChangeSet,
    /// The baseline the next run must diff against. Callers advance to it
    /// only after the change set has been durably written.
    pub baseline: Baseline,
}

/// Produces the next change set for one drift configuration run.
///
/// The configuration is captured by value at construction; a concurrent
/// configuration update never affects an in-flight run.
pub struct DriftScanner {
    resource_id: ResourceId,
    config: DriftConfiguration,
    basedir: PathBuf,
}

impl DriftScanner {
    /// Create a scanner, resolving the configuration's base directory
    /// against the agent install directory.
    pub fn new(resource_id: ResourceId, config: DriftConfiguration, install_dir: &Path) -> Self {
        let basedir = config.resolve_basedir(install_dir);
        Self {
            resource_id,
            config,
            basedir,
        }
    }

    /// The resolved base directory this scanner walks.
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Walk the base directory and build a full snapshot of tracked files.
    ///
    /// Only regular files are tracked; symbolic links and special files are
    /// excluded by policy. Any unreadable directory or file fails the whole
    /// run — a partial snapshot is never returned.
    ///
    /// # Errors
    /// `Error::Scan` if the base directory is missing, is not a directory,
    /// or the walk fails; `Error::Digest` if a file cannot be read.
    pub fn take_snapshot(&self) -> Result<Snapshot> {
        if !self.basedir.is_dir() {
            return Err(Error::Scan(format!(
                "Base directory {} does not exist or is not a directory",
                self.basedir.display()
            )));
        }

        let filter = PathFilter::new(&self.config.includes, &self.config.excludes, &self.basedir)?;
        let mut entries = Vec::new();

        let walker = WalkBuilder::new(&self.basedir)
            .standard_filters(false)
            .follow_links(false)
            .build();

        for result in walker {
            let entry = result.map_err(|e| Error::Scan(e.to_string()))?;

            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            let path = entry.path();
            let relative = path
                .strip_prefix(&self.basedir)
                .map_err(|e| Error::Scan(e.to_string()))?;
            if !filter.is_tracked(relative) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| Error::Scan(e.to_string()))?;
            let last_modified: DateTime<Utc> = metadata
                .modified()
                .map_err(|e| Error::Scan(e.to_string()))?
                .into();

            let digest = ContentDigest::from_file(path)
                .map_err(|e| Error::Digest(format!("{}: {}", relative.display(), e)))?;

            entries.push(DriftEntry::new(
                relative.to_string_lossy().into_owned(),
                digest,
                last_modified,
            ));
        }

        Ok(Snapshot::new(entries))
    }

    /// Run detection and produce the next change set, if any.
    ///
    /// With no prior baseline the new snapshot itself becomes a COVERAGE
    /// change set at version 0 (every entry `Unchanged`, possibly empty).
    /// With a baseline, an empty diff produces `None` — no drift occurred
    /// and no change set is emitted, though the schedule still advances.
    pub fn generate(&self, previous: Option<&Baseline>) -> Result<Option<GeneratedChangeSet>> {
        let snapshot = self.take_snapshot()?;

        let (category, version, delta) = match previous {
            None => (
                ChangeSetCategory::Coverage,
                0,
                snapshot.entries().to_vec(),
            ),
            Some(baseline) => {
                let delta = baseline.snapshot.diff(&snapshot);
                if delta.is_empty() {
                    return Ok(None);
                }
                (ChangeSetCategory::Drift, baseline.version + 1, delta)
            }
        };

        let change_set = ChangeSet {
            resource_id: self.resource_id,
            config_name: self.config.name.clone(),
            category,
            version,
            entries: delta,
        };

        Ok(Some(GeneratedChangeSet {
            change_set,
            baseline: Baseline { version, snapshot },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::DriftCategory;
    use std::fs;
    use tempfile::TempDir;

    fn scanner_for(dir: &TempDir, config: DriftConfiguration) -> DriftScanner {
        DriftScanner::new(ResourceId::new(1), config, dir.path())
    }

    fn config_for(dir: &TempDir) -> DriftConfiguration {
        DriftConfiguration::new("test-config", dir.path().to_string_lossy())
    }

    #[test]
    fn test_empty_dir_produces_empty_coverage() {
        let dir = TempDir::new().unwrap();
        let scanner = scanner_for(&dir, config_for(&dir));

        let generated = scanner.generate(None).unwrap().unwrap();
        assert_eq!(generated.change_set.category, ChangeSetCategory::Coverage);
        assert_eq!(generated.change_set.version, 0);
        assert!(generated.change_set.entries.is_empty());
        assert!(generated.baseline.snapshot.is_empty());
    }

    #[test]
    fn test_coverage_tags_all_entries_unchanged() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), "y").unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let generated = scanner.generate(None).unwrap().unwrap();

        assert_eq!(generated.change_set.entries.len(), 2);
        assert!(generated
            .change_set
            .entries
            .iter()
            .all(|e| e.category == DriftCategory::Unchanged));
        assert_eq!(generated.change_set.entries[0].relative_path, "a.txt");
        assert_eq!(generated.change_set.entries[1].relative_path, "sub/b.txt");
    }

    #[test]
    fn test_content_change_produces_drift() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let coverage = scanner.generate(None).unwrap().unwrap();

        fs::write(dir.path().join("a.txt"), "y").unwrap();
        let drift = scanner
            .generate(Some(&coverage.baseline))
            .unwrap()
            .unwrap();

        assert_eq!(drift.change_set.category, ChangeSetCategory::Drift);
        assert_eq!(drift.change_set.version, 1);
        assert_eq!(drift.change_set.entries.len(), 1);
        assert_eq!(drift.change_set.entries[0].relative_path, "a.txt");
        assert_eq!(drift.change_set.entries[0].category, DriftCategory::Changed);
        assert_eq!(
            drift.change_set.entries[0].digest,
            ContentDigest::from_bytes(b"y")
        );
    }

    #[test]
    fn test_deleted_file_produces_single_delete_entry() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();
        fs::write(dir.path().join("b.txt"), "y").unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let coverage = scanner.generate(None).unwrap().unwrap();

        fs::remove_file(dir.path().join("b.txt")).unwrap();
        let drift = scanner
            .generate(Some(&coverage.baseline))
            .unwrap()
            .unwrap();

        assert_eq!(drift.change_set.entries.len(), 1);
        assert_eq!(drift.change_set.entries[0].relative_path, "b.txt");
        assert_eq!(drift.change_set.entries[0].category, DriftCategory::Deleted);
    }

    #[test]
    fn test_no_drift_emits_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "x").unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let coverage = scanner.generate(None).unwrap().unwrap();

        assert!(scanner.generate(Some(&coverage.baseline)).unwrap().is_none());
    }

    #[test]
    fn test_missing_basedir_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let config = DriftConfiguration::new(
            "test-config",
            dir.path().join("no-such-dir").to_string_lossy(),
        );
        let scanner = scanner_for(&dir, config);

        let result = scanner.generate(None);
        assert!(matches!(result, Err(Error::Scan(_))));
    }

    #[test]
    fn test_filters_applied_during_walk() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.conf"), "conf").unwrap();
        fs::write(dir.path().join("app.log"), "log").unwrap();
        fs::create_dir(dir.path().join("secret")).unwrap();
        fs::write(dir.path().join("secret/key.conf"), "key").unwrap();

        let config = config_for(&dir)
            .with_include("**/*.conf")
            .with_exclude("secret/**");
        let scanner = scanner_for(&dir, config);

        let snapshot = scanner.take_snapshot().unwrap();
        let paths: Vec<_> = snapshot
            .entries()
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["app.conf"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_tracked() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("real.txt"), "data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.txt"), dir.path().join("link.txt"))
            .unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let snapshot = scanner.take_snapshot().unwrap();

        let paths: Vec<_> = snapshot
            .entries()
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(paths, vec!["real.txt"]);
    }

    #[test]
    fn test_reappearing_identical_content_is_not_drift() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "same").unwrap();

        let scanner = scanner_for(&dir, config_for(&dir));
        let coverage = scanner.generate(None).unwrap().unwrap();

        // Delete and recreate with identical content; mtime moves but the
        // digest is authoritative.
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        fs::write(dir.path().join("a.txt"), "same").unwrap();

        assert!(scanner.generate(Some(&coverage.baseline)).unwrap().is_none());
    }
}
