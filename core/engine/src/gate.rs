//! The synchronization gate: per-configuration flow control.
//!
//! Protocol per configuration: after a change set is durably written the
//! gate enters `AwaitingMetadataAck` and hands the archive to the transport.
//! The metadata acknowledgment moves it to `AwaitingContentAck` when file
//! content travels (else straight to acked); the content acknowledgment,
//! quoting the content token, completes the exchange. Only then is the
//! superseded change set purged and the schedule released. The gate never
//! resends on timeout — redelivery is the transport's responsibility; its
//! only obligation is to refuse new detection runs while un-acked.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use driftwatch_common::{Error, ResourceId, Result};
use driftwatch_digest::ContentDigest;
use driftwatch_scan::ChangeSet;
use driftwatch_store::{ChangeSetHandle, ChangeSetStore, GateMarker, GateStatus};

use crate::schedule::ScheduleKey;
use crate::scheduler::DetectionScheduler;
use crate::transport::{ChangeSetHeaders, ChangeSetTransport};

#[derive(Debug, Clone)]
struct GateEntry {
    status: GateStatus,
    pending: Option<ChangeSetHandle>,
    content_token: Option<String>,
    superseded: Option<ChangeSetHandle>,
}

impl GateEntry {
    fn idle() -> Self {
        Self {
            status: GateStatus::Idle,
            pending: None,
            content_token: None,
            superseded: None,
        }
    }

    fn marker(&self) -> GateMarker {
        GateMarker {
            status: self.status,
            pending: self.pending.as_ref().map(|h| h.id.clone()),
            content_token: self.content_token.clone(),
            superseded: self.superseded.as_ref().map(|h| h.id.clone()),
        }
    }
}

/// Per-configuration acknowledgment state machine.
pub struct SyncGate {
    store: Arc<ChangeSetStore>,
    transport: Arc<dyn ChangeSetTransport>,
    scheduler: DetectionScheduler,
    states: Mutex<HashMap<ScheduleKey, GateEntry>>,
}

impl SyncGate {
    pub(crate) fn new(
        store: Arc<ChangeSetStore>,
        transport: Arc<dyn ChangeSetTransport>,
        scheduler: DetectionScheduler,
    ) -> Self {
        Self {
            store,
            transport,
            scheduler,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Current gate state for a configuration (`Idle` if never shipped).
    pub async fn status(&self, resource_id: ResourceId, config_name: &str) -> GateStatus {
        let key = ScheduleKey::new(resource_id, config_name);
        let states = self.states.lock().await;
        states.get(&key).map(|e| e.status).unwrap_or(GateStatus::Idle)
    }

    /// Whether a change set for this configuration is awaiting any ack.
    pub(crate) async fn is_pending(&self, key: &ScheduleKey) -> bool {
        let states = self.states.lock().await;
        matches!(
            states.get(key).map(|e| e.status),
            Some(GateStatus::AwaitingMetadataAck) | Some(GateStatus::AwaitingContentAck)
        )
    }

    /// Take a durably written change set in flight.
    ///
    /// Persists the marker before handing the archive to the transport, so
    /// a crash after this point resumes delivery rather than regenerating.
    /// Delivery errors are logged, not propagated: the configuration stays
    /// blocked either way.
    pub(crate) async fn ship(&self, handle: &ChangeSetHandle, change_set: &ChangeSet) -> Result<()> {
        let key = ScheduleKey::new(handle.id.resource_id, &handle.id.config_name);

        let content_token = change_set
            .has_content()
            .then(|| Uuid::new_v4().to_string());
        let superseded = match handle.id.predecessor() {
            Some(prev) => self.store.lookup(&prev).await?,
            None => None,
        };

        let entry = GateEntry {
            status: GateStatus::AwaitingMetadataAck,
            pending: Some(handle.clone()),
            content_token: content_token.clone(),
            superseded,
        };
        self.store
            .write_marker(key.resource_id, &key.config_name, &entry.marker())
            .await?;
        {
            let mut states = self.states.lock().await;
            states.insert(key.clone(), entry);
        }

        info!("Shipping change set {}", handle.id);
        let headers = ChangeSetHeaders::new(&handle.id, content_token);
        if let Err(e) = self
            .transport
            .send_change_set(headers, handle.path.clone())
            .await
        {
            warn!(
                "Delivery of change set {} failed: {}; awaiting redelivery by the transport",
                handle.id, e
            );
        }
        Ok(())
    }

    /// Peer confirmed durable receipt of the latest change-set metadata.
    pub async fn ack_change_set(&self, resource_id: ResourceId, config_name: &str) -> Result<()> {
        let key = ScheduleKey::new(resource_id, config_name);

        let entry = {
            let states = self.states.lock().await;
            states
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("No change set in flight for {}", key)))?
        };

        if entry.status != GateStatus::AwaitingMetadataAck {
            warn!(
                "Unexpected metadata ack for {} in state {:?}; ignoring",
                key, entry.status
            );
            return Ok(());
        }

        if entry.content_token.is_some() {
            let updated = GateEntry {
                status: GateStatus::AwaitingContentAck,
                ..entry
            };
            self.store
                .write_marker(key.resource_id, &key.config_name, &updated.marker())
                .await?;
            let mut states = self.states.lock().await;
            states.insert(key.clone(), updated);
            debug!("Metadata acknowledged for {}; awaiting content ack", key);
            return Ok(());
        }

        self.finish_ack(&key, entry).await
    }

    /// Peer confirmed durable receipt of a content unit.
    pub async fn ack_change_set_content(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        content_token: &str,
    ) -> Result<()> {
        let key = ScheduleKey::new(resource_id, config_name);

        let entry = {
            let states = self.states.lock().await;
            states
                .get(&key)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("No change set in flight for {}", key)))?
        };

        if entry.status != GateStatus::AwaitingContentAck {
            warn!(
                "Unexpected content ack for {} in state {:?}; ignoring",
                key, entry.status
            );
            return Ok(());
        }
        if entry.content_token.as_deref() != Some(content_token) {
            return Err(Error::InvalidInput(format!(
                "Content ack for {} quotes unknown token {}",
                key, content_token
            )));
        }

        self.finish_ack(&key, entry).await
    }

    /// Complete the acknowledgment: purge the superseded change set, clear
    /// the marker, and release the schedule.
    async fn finish_ack(&self, key: &ScheduleKey, entry: GateEntry) -> Result<()> {
        if let Some(superseded) = &entry.superseded {
            self.store.purge(superseded).await?;
        }
        if let Some(token) = &entry.content_token {
            self.store
                .remove_content_archive(key.resource_id, &key.config_name, token)
                .await?;
        }
        self.store
            .write_marker(key.resource_id, &key.config_name, &GateMarker::idle())
            .await?;

        {
            let mut states = self.states.lock().await;
            states.insert(key.clone(), GateEntry::idle());
        }

        if let Some(pending) = &entry.pending {
            info!(
                "Change set {} fully acknowledged; releasing detection",
                pending.id
            );
        }
        self.scheduler.release(key.clone()).await
    }

    /// Package the named content blobs out of the pending change set and
    /// ship them as a separately acknowledged unit. Returns the fresh
    /// content token the peer must quote in `ack_change_set_content`.
    pub async fn request_drift_files(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        digests: &[ContentDigest],
    ) -> Result<String> {
        let key = ScheduleKey::new(resource_id, config_name);

        let (handle, previous_token) = {
            let states = self.states.lock().await;
            let entry = states
                .get(&key)
                .ok_or_else(|| Error::NotFound(format!("No change set in flight for {}", key)))?;
            let handle = entry.pending.clone().ok_or_else(|| {
                Error::NotFound(format!("No pending change set archive for {}", key))
            })?;
            (handle, entry.content_token.clone())
        };

        let blobs = self.store.read_content(&handle, digests).await?;
        let token = Uuid::new_v4().to_string();
        let path = self
            .store
            .write_content_archive(resource_id, config_name, &token, blobs)
            .await?;

        // A stale content archive from an earlier request is superseded.
        if let Some(previous) = &previous_token {
            self.store
                .remove_content_archive(resource_id, config_name, previous)
                .await?;
        }

        let updated = {
            let mut states = self.states.lock().await;
            let entry = states
                .get_mut(&key)
                .ok_or_else(|| Error::NotFound(format!("No change set in flight for {}", key)))?;
            entry.content_token = Some(token.clone());
            entry.clone()
        };
        self.store
            .write_marker(resource_id, config_name, &updated.marker())
            .await?;

        info!(
            "Shipping {} requested content blobs for {} under token {}",
            digests.len(),
            key,
            token
        );
        if let Err(e) = self
            .transport
            .send_files_zip(resource_id, config_name, &token, path)
            .await
        {
            warn!(
                "Delivery of content archive for {} failed: {}; awaiting redelivery by the transport",
                key, e
            );
        }
        Ok(token)
    }

    /// Rehydrate gate state from the store after a restart and re-initiate
    /// delivery of every pending archive under its original identity.
    ///
    /// Per the protocol, every pending configuration resumes at
    /// `AwaitingMetadataAck` regardless of how far the exchange had
    /// progressed; redelivery is idempotent on the peer by archive identity.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.store.list_pending().await?;
        let count = pending.len();

        for item in pending {
            let handle = item.handle;
            let key = ScheduleKey::new(handle.id.resource_id, &handle.id.config_name);

            let superseded = match &item.marker.superseded {
                Some(id) => self.store.lookup(id).await?,
                None => None,
            };
            let entry = GateEntry {
                status: GateStatus::AwaitingMetadataAck,
                pending: Some(handle.clone()),
                content_token: item.marker.content_token.clone(),
                superseded,
            };
            self.store
                .write_marker(key.resource_id, &key.config_name, &entry.marker())
                .await?;

            let content_token = entry.content_token.clone();
            {
                let mut states = self.states.lock().await;
                states.insert(key.clone(), entry);
            }

            info!("Resuming delivery of pending change set {}", handle.id);
            let headers = ChangeSetHeaders::new(&handle.id, content_token);
            if let Err(e) = self
                .transport
                .send_change_set(headers, handle.path.clone())
                .await
            {
                warn!(
                    "Redelivery of change set {} failed: {}; awaiting redelivery by the transport",
                    handle.id, e
                );
            }
        }

        Ok(count)
    }
}
