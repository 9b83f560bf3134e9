//! The drift manager facade.
//!
//! One instance owns the scheduler, gate, and store for an agent; there is
//! no ambient global state. The configuration-management collaborator drives
//! it through the schedule/unschedule/update/detect operations, and the
//! transport layer feeds acknowledgments back through the ack operations.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use driftwatch_common::{DriftConfiguration, ResourceId, Result};
use driftwatch_digest::ContentDigest;
use driftwatch_store::{ChangeSetStore, GateStatus};

use crate::gate::SyncGate;
use crate::scheduler::{DetectionRunner, DetectionScheduler, DetectionSchedulerHandle};
use crate::transport::ChangeSetTransport;

/// Construction parameters for a [`DriftManager`].
#[derive(Debug, Clone)]
pub struct DriftManagerConfig {
    /// Root directory for the change-set store.
    pub store_root: PathBuf,
    /// Agent install directory, used to resolve relative base directories.
    pub install_dir: PathBuf,
}

/// The agent-side drift subsystem.
pub struct DriftManager {
    scheduler: DetectionScheduler,
    gate: Arc<SyncGate>,
    store: Arc<ChangeSetStore>,
    scheduler_task: JoinHandle<()>,
}

impl DriftManager {
    /// Create the subsystem and spawn its scheduler loop.
    ///
    /// Call [`resume_pending`](Self::resume_pending) afterwards to re-initiate
    /// delivery of change sets left unacknowledged by a previous process.
    pub fn new(config: DriftManagerConfig, transport: Arc<dyn ChangeSetTransport>) -> Result<Self> {
        let store = Arc::new(ChangeSetStore::new(&config.store_root)?);

        let (command_tx, command_rx) = mpsc::channel(100);
        let scheduler = DetectionScheduler::new(command_tx.clone());
        let gate = Arc::new(SyncGate::new(
            store.clone(),
            transport,
            scheduler.clone(),
        ));
        let runner = Arc::new(DetectionRunner::new(
            store.clone(),
            gate.clone(),
            config.install_dir,
        ));
        let handle = DetectionSchedulerHandle::new(command_rx, command_tx, runner);
        let scheduler_task = tokio::spawn(handle.run());

        Ok(Self {
            scheduler,
            gate,
            store,
            scheduler_task,
        })
    }

    /// Rehydrate the gate from disk and re-initiate delivery of every
    /// change set still awaiting acknowledgment. Returns how many were
    /// resumed.
    pub async fn resume_pending(&self) -> Result<usize> {
        self.gate.resume_pending().await
    }

    /// Start periodic drift detection for a configuration.
    pub async fn schedule_drift_detection(
        &self,
        resource_id: ResourceId,
        config: DriftConfiguration,
    ) -> Result<()> {
        self.scheduler.schedule(resource_id, config).await
    }

    /// Stop drift detection for a configuration.
    pub async fn unschedule_drift_detection(
        &self,
        resource_id: ResourceId,
        config: &DriftConfiguration,
    ) -> Result<()> {
        self.scheduler.unschedule(resource_id, &config.name).await
    }

    /// Apply an updated configuration: interval and filters are replaced
    /// without resetting the elapsed wait; disabling unschedules.
    pub async fn update_drift_detection(
        &self,
        resource_id: ResourceId,
        config: DriftConfiguration,
    ) -> Result<()> {
        self.scheduler.update(resource_id, config).await
    }

    /// Execute drift detection ahead of the interval. The request only
    /// orders the configuration in front of later-due entries; a running
    /// scan is not interrupted and a blocked configuration stays blocked.
    pub async fn detect_drift(
        &self,
        resource_id: ResourceId,
        config: DriftConfiguration,
    ) -> Result<()> {
        self.scheduler.request_immediate(resource_id, config).await
    }

    /// Peer acknowledgment of the latest change-set metadata.
    pub async fn ack_change_set(&self, resource_id: ResourceId, config_name: &str) -> Result<()> {
        self.gate.ack_change_set(resource_id, config_name).await
    }

    /// Peer acknowledgment of a content unit, quoting its token.
    pub async fn ack_change_set_content(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        content_token: &str,
    ) -> Result<()> {
        self.gate
            .ack_change_set_content(resource_id, config_name, content_token)
            .await
    }

    /// Peer request for the content of specific digests out of the pending
    /// change set; returns the content token the peer must quote back.
    pub async fn request_drift_files(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        digests: &[ContentDigest],
    ) -> Result<String> {
        self.gate
            .request_drift_files(resource_id, config_name, digests)
            .await
    }

    /// Current gate state for a configuration.
    pub async fn gate_status(&self, resource_id: ResourceId, config_name: &str) -> GateStatus {
        self.gate.status(resource_id, config_name).await
    }

    /// The underlying change-set store.
    pub fn store(&self) -> Arc<ChangeSetStore> {
        self.store.clone()
    }

    /// Stop the scheduler loop and wait for it to exit. In-flight detection
    /// runs complete on their own tasks.
    pub async fn shutdown(self) {
        self.scheduler.shutdown().await;
        let _ = self.scheduler_task.await;
    }
}
