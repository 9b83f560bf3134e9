//! Drift detection configuration model.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default detection interval (30 minutes).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1800);

/// How a configuration's base-directory path is resolved to a filesystem root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaseDirContext {
    /// The path is an absolute filesystem path.
    FileSystem,
    /// The path is resolved relative to the agent install directory.
    InstallDir,
}

/// Identifies one monitored directory tree for one resource.
///
/// A configuration is immutable during a single detection run; the run
/// captures a value snapshot of it at start. Creation, update, and removal
/// are driven by an external configuration API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfiguration {
    /// Configuration name, unique per resource.
    pub name: String,
    /// How to resolve the base directory.
    pub basedir_context: BaseDirContext,
    /// The base directory path, interpreted per the context.
    pub basedir_path: String,
    /// Detection period.
    pub interval: Duration,
    /// Glob filter rules selecting tracked paths. Empty means "everything".
    pub includes: Vec<String>,
    /// Glob filter rules excluding paths. Excludes win over includes.
    pub excludes: Vec<String>,
    /// Whether detection is enabled for this configuration.
    pub enabled: bool,
}

impl DriftConfiguration {
    /// Create a configuration with an absolute filesystem base directory
    /// and default interval.
    pub fn new(name: impl Into<String>, basedir_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            basedir_context: BaseDirContext::FileSystem,
            basedir_path: basedir_path.into(),
            interval: DEFAULT_INTERVAL,
            includes: Vec::new(),
            excludes: Vec::new(),
            enabled: true,
        }
    }

    /// Set the base-directory resolution context.
    pub fn with_basedir_context(mut self, context: BaseDirContext) -> Self {
        self.basedir_context = context;
        self
    }

    /// Set the detection interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Add an include filter rule.
    pub fn with_include(mut self, pattern: impl Into<String>) -> Self {
        self.includes.push(pattern.into());
        self
    }

    /// Add an exclude filter rule.
    pub fn with_exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Enable or disable detection.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Resolve the base directory against the agent install directory.
    pub fn resolve_basedir(&self, install_dir: &Path) -> PathBuf {
        match self.basedir_context {
            BaseDirContext::FileSystem => PathBuf::from(&self.basedir_path),
            BaseDirContext::InstallDir => install_dir.join(&self.basedir_path),
        }
    }

    /// Compare against another configuration for material differences.
    ///
    /// With `ignore_filters` set, include/exclude rules are not considered;
    /// the caller only cares whether name, base directory, interval, or
    /// enablement changed.
    pub fn differs_from(&self, other: &Self, ignore_filters: bool) -> bool {
        if self.name != other.name
            || self.basedir_context != other.basedir_context
            || self.basedir_path != other.basedir_path
            || self.interval != other.interval
            || self.enabled != other.enabled
        {
            return true;
        }
        if ignore_filters {
            return false;
        }
        self.includes != other.includes || self.excludes != other.excludes
    }
}
