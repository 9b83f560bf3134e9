//! Common types used throughout driftwatch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a monitored resource.
///
/// Resources own drift configurations; every schedule entry, change set, and
/// store directory is keyed by the owning resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Create a new ResourceId.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the inner numeric value.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ResourceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}
