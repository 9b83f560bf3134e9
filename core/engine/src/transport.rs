//! The transport boundary toward the remote peer.
//!
//! Delivery is treated as an opaque "send reliably once" RPC channel.
//! Acknowledgments flow back asynchronously through
//! [`DriftManager::ack_change_set`](crate::DriftManager::ack_change_set) and
//! [`DriftManager::ack_change_set_content`](crate::DriftManager::ack_change_set_content);
//! redelivery on timeout is the transport's responsibility, not the gate's.

use std::path::PathBuf;

use async_trait::async_trait;

use driftwatch_common::{ResourceId, Result};
use driftwatch_scan::{ChangeSetCategory, ChangeSetId};

/// Identifying headers that accompany a change-set archive.
///
/// `(resource_id, config_name, category, version)` is the idempotency key
/// the peer deduplicates redelivered archives by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSetHeaders {
    pub resource_id: ResourceId,
    pub config_name: String,
    pub category: ChangeSetCategory,
    pub version: u64,
    /// Token the peer quotes when acknowledging content, if any travels.
    pub content_token: Option<String>,
}

impl ChangeSetHeaders {
    /// Headers for the given archive identity.
    pub fn new(id: &ChangeSetId, content_token: Option<String>) -> Self {
        Self {
            resource_id: id.resource_id,
            config_name: id.config_name.clone(),
            category: id.category,
            version: id.version,
            content_token,
        }
    }

    /// The archive identity these headers describe.
    pub fn id(&self) -> ChangeSetId {
        ChangeSetId {
            resource_id: self.resource_id,
            config_name: self.config_name.clone(),
            category: self.category,
            version: self.version,
        }
    }
}

/// Outbound channel for change-set delivery.
#[async_trait]
pub trait ChangeSetTransport: Send + Sync {
    /// Hand a change-set archive to the peer for delivery.
    async fn send_change_set(&self, headers: ChangeSetHeaders, archive: PathBuf) -> Result<()>;

    /// Hand a content archive for a peer file request to the peer.
    async fn send_files_zip(
        &self,
        resource_id: ResourceId,
        config_name: &str,
        token: &str,
        archive: PathBuf,
    ) -> Result<()>;
}
