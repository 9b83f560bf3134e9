//! The change-set store: durable, restart-safe local persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use driftwatch_common::{Error, ResourceId, Result};
use driftwatch_digest::ContentDigest;
use driftwatch_scan::{Baseline, ChangeSet, ChangeSetCategory, ChangeSetId};

use crate::archive;

/// Filename of the persisted diff baseline within a configuration directory.
pub const SNAPSHOT_FILENAME: &str = "snapshot.json";

/// Filename of the persisted gate marker within a configuration directory.
pub const MARKER_FILENAME: &str = "gate.json";

/// Synchronization-gate state for one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateStatus {
    /// No change set in flight; detection may run.
    Idle,
    /// A change set was shipped; waiting for the metadata acknowledgment.
    AwaitingMetadataAck,
    /// Metadata acknowledged; waiting for the content acknowledgment.
    AwaitingContentAck,
    /// Fully acknowledged.
    Acked,
}

/// The small persisted record from which gate state is reconstructed on
/// restart, without contacting the peer first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateMarker {
    pub status: GateStatus,
    /// Identity of the change set awaiting acknowledgment, if any.
    pub pending: Option<ChangeSetId>,
    /// Token the peer must quote when acknowledging content.
    pub content_token: Option<String>,
    /// Identity of the superseded change set to purge once acked.
    pub superseded: Option<ChangeSetId>,
}

impl GateMarker {
    /// Marker for a configuration with nothing in flight.
    pub fn idle() -> Self {
        Self {
            status: GateStatus::Idle,
            pending: None,
            content_token: None,
            superseded: None,
        }
    }
}

/// Handle to one durably written change-set archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetHandle {
    pub id: ChangeSetId,
    pub path: PathBuf,
}

/// A change set found awaiting acknowledgment on restart.
#[derive(Debug, Clone)]
pub struct PendingChangeSet {
    pub handle: ChangeSetHandle,
    pub marker: GateMarker,
}

/// Durable, file-based storage of change sets.
///
/// Layout: one directory per resource, one subdirectory per configuration
/// name, containing numbered archives (`coverage-0.zip`, `drift-<v>.zip`),
/// the current baseline (`snapshot.json`), and the gate marker (`gate.json`).
/// Access is serialized per configuration key; unrelated configurations are
/// never serialized against each other.
pub struct ChangeSetStore {
    root: PathBuf,
    locks: StdMutex<HashMap<(ResourceId, String), Arc<Mutex<()>>>>,
}

impl ChangeSetStore {
    /// Create a store rooted at the given directory, creating it if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn config_dir(&self, resource_id: ResourceId, config_name: &str) -> PathBuf {
        self.root.join(resource_id.to_string()).join(config_name)
    }

    fn archive_path(&self, id: &ChangeSetId) -> PathBuf {
        self.config_dir(id.resource_id, &id.config_name)
            .join(format!("{}-{}.zip", id.category.as_str(), id.version))
    }

    fn key_lock(&self, resource_id: ResourceId, config_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("store lock registry poisoned");
        locks
            .entry((resource_id, config_name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Durably write a change set and the baseline it established.
    ///
    /// The archive goes through a temp file and an atomic rename, and is
    /// fsynced before the rename; `snapshot.json` follows the same pattern
    /// afterwards. A `write` that returns `Ok` survives process restart, so
    /// callers may only then advance their in-memory baseline.
    pub async fn write(
        &self,
        change_set: &ChangeSet,
        basedir: &Path,
        baseline: &Baseline,
    ) -> Result<ChangeSetHandle> {
        let id = change_set.id();
        let lock = self.key_lock(id.resource_id, &id.config_name);
        let _guard = lock.lock().await;

        let dir = self.config_dir(id.resource_id, &id.config_name);
        let target = self.archive_path(&id);

        let change_set = change_set.clone();
        let basedir = basedir.to_path_buf();
        let baseline = baseline.clone();
        let blocking_dir = dir.clone();
        let blocking_target = target.clone();

        run_blocking(move || {
            std::fs::create_dir_all(&blocking_dir)?;

            let tmp = blocking_target.with_extension("zip.tmp");
            if let Err(e) = archive::write_archive(&tmp, &change_set, &basedir) {
                let _ = std::fs::remove_file(&tmp);
                return Err(e);
            }
            std::fs::rename(&tmp, &blocking_target)?;

            let json = serde_json::to_vec_pretty(&baseline)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            let snapshot_tmp = blocking_dir.join(format!("{}.tmp", SNAPSHOT_FILENAME));
            std::fs::write(&snapshot_tmp, json)?;
            std::fs::rename(&snapshot_tmp, blocking_dir.join(SNAPSHOT_FILENAME))?;
            Ok(())
        })
        .await?;

        debug!("Wrote change set {} to {}", id, target.display());
        Ok(ChangeSetHandle { id, path: target })
    }

    /// Find the latest archive of the given category for a configuration.
    pub async fn find_latest(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        category: ChangeSetCategory,
    ) -> Result<Option<ChangeSetHandle>> {
        let dir = self.config_dir(resource_id, config_name);
        if !dir.is_dir() {
            return Ok(None);
        }

        let prefix = format!("{}-", category.as_str());
        let mut latest: Option<u64> = None;

        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(version) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".zip"))
                .and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            latest = Some(latest.map_or(version, |v: u64| v.max(version)));
        }

        Ok(latest.map(|version| {
            let id = ChangeSetId {
                resource_id,
                config_name: config_name.to_string(),
                category,
                version,
            };
            ChangeSetHandle {
                path: self.archive_path(&id),
                id,
            }
        }))
    }

    /// Check whether any archive of the given category exists.
    pub async fn exists(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        category: ChangeSetCategory,
    ) -> Result<bool> {
        Ok(self
            .find_latest(resource_id, config_name, category)
            .await?
            .is_some())
    }

    /// Resolve an archive identity to a handle, if the archive exists.
    pub async fn lookup(&self, id: &ChangeSetId) -> Result<Option<ChangeSetHandle>> {
        let path = self.archive_path(id);
        if fs::try_exists(&path).await? {
            Ok(Some(ChangeSetHandle {
                id: id.clone(),
                path,
            }))
        } else {
            Ok(None)
        }
    }

    /// Load the persisted diff baseline for a configuration.
    pub async fn load_baseline(
        &self,
        resource_id: ResourceId,
        config_name: &str,
    ) -> Result<Option<Baseline>> {
        let path = self
            .config_dir(resource_id, config_name)
            .join(SNAPSHOT_FILENAME);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = fs::read(&path).await?;
        let baseline =
            serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Some(baseline))
    }

    /// Delete an archive. Content blobs live inside the archive, so removing
    /// it also releases any file content no other archive carries.
    pub async fn purge(&self, handle: &ChangeSetHandle) -> Result<()> {
        let lock = self.key_lock(handle.id.resource_id, &handle.id.config_name);
        let _guard = lock.lock().await;

        if fs::try_exists(&handle.path).await? {
            fs::remove_file(&handle.path).await?;
            debug!("Purged change set {}", handle.id);
        }
        Ok(())
    }

    /// Persist the gate marker for a configuration.
    pub async fn write_marker(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        marker: &GateMarker,
    ) -> Result<()> {
        let dir = self.config_dir(resource_id, config_name);
        fs::create_dir_all(&dir).await?;

        let json = serde_json::to_vec_pretty(marker)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let tmp = dir.join(format!("{}.tmp", MARKER_FILENAME));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, dir.join(MARKER_FILENAME)).await?;
        Ok(())
    }

    /// Read the gate marker for a configuration, if one was persisted.
    pub async fn read_marker(
        &self,
        resource_id: ResourceId,
        config_name: &str,
    ) -> Result<Option<GateMarker>> {
        let path = self
            .config_dir(resource_id, config_name)
            .join(MARKER_FILENAME);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let json = fs::read(&path).await?;
        let marker =
            serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Some(marker))
    }

    /// Enumerate all change sets still awaiting acknowledgment.
    ///
    /// Used on process restart to rehydrate the synchronization gate without
    /// contacting the peer first.
    pub async fn list_pending(&self) -> Result<Vec<PendingChangeSet>> {
        let mut pending = Vec::new();

        let mut resources = fs::read_dir(&self.root).await?;
        while let Some(resource_entry) = resources.next_entry().await? {
            if !resource_entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(resource_id) = resource_entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
                .map(ResourceId::new)
            else {
                continue;
            };

            let mut configs = fs::read_dir(resource_entry.path()).await?;
            while let Some(config_entry) = configs.next_entry().await? {
                if !config_entry.file_type().await?.is_dir() {
                    continue;
                }
                let Some(config_name) = config_entry.file_name().to_str().map(String::from)
                else {
                    continue;
                };

                let Some(marker) = self.read_marker(resource_id, &config_name).await? else {
                    continue;
                };
                if !matches!(
                    marker.status,
                    GateStatus::AwaitingMetadataAck | GateStatus::AwaitingContentAck
                ) {
                    continue;
                }
                let Some(id) = marker.pending.clone() else {
                    warn!(
                        "Marker for {}/{} has awaiting status but no pending identity; skipping",
                        resource_id, config_name
                    );
                    continue;
                };

                match self.lookup(&id).await? {
                    Some(handle) => pending.push(PendingChangeSet { handle, marker }),
                    None => warn!(
                        "Pending change set {} has no archive on disk; skipping",
                        id
                    ),
                }
            }
        }

        Ok(pending)
    }

    /// Extract content blobs from an archived change set.
    pub async fn read_content(
        &self,
        handle: &ChangeSetHandle,
        digests: &[ContentDigest],
    ) -> Result<Vec<(ContentDigest, Vec<u8>)>> {
        let path = handle.path.clone();
        let digests = digests.to_vec();
        run_blocking(move || archive::read_content(&path, &digests)).await
    }

    /// Write a standalone content archive for a peer file request and return
    /// its path.
    pub async fn write_content_archive(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        token: &str,
        blobs: Vec<(ContentDigest, Vec<u8>)>,
    ) -> Result<PathBuf> {
        let dir = self.config_dir(resource_id, config_name);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("files-{}.zip", token));

        let blocking_path = path.clone();
        run_blocking(move || archive::write_content_archive(&blocking_path, &blobs)).await?;
        Ok(path)
    }

    /// Remove a previously written content archive, if present.
    pub async fn remove_content_archive(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        token: &str,
    ) -> Result<()> {
        let path = self
            .config_dir(resource_id, config_name)
            .join(format!("files-{}.zip", token));
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Run blocking archive I/O off the async runtime.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Persistence(format!("Archive task failed: {}", e)))?
}
