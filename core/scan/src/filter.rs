//! Include/exclude filter rules for tracked paths.

use std::path::Path;

use ignore::overrides::{Override, OverrideBuilder};

use driftwatch_common::{Error, Result};

/// Compiled filter rules for one configuration.
///
/// Exclude rules take precedence over include rules. A non-empty include
/// list acts as a whitelist: a path matching no include rule is skipped.
/// With no include rules, everything not excluded is tracked.
pub struct PathFilter {
    includes: Option<Override>,
    excludes: Option<Override>,
}

impl PathFilter {
    /// Compile glob rules rooted at the base directory.
    ///
    /// # Errors
    /// Returns an error if any glob pattern fails to parse.
    pub fn new(includes: &[String], excludes: &[String], root: &Path) -> Result<Self> {
        Ok(Self {
            includes: Self::build_matcher(includes, root)?,
            excludes: Self::build_matcher(excludes, root)?,
        })
    }

    fn build_matcher(patterns: &[String], root: &Path) -> Result<Option<Override>> {
        if patterns.is_empty() {
            return Ok(None);
        }

        let mut builder = OverrideBuilder::new(root);
        for pattern in patterns {
            builder
                .add(pattern)
                .map_err(|e| Error::InvalidInput(format!("Bad filter rule {:?}: {}", pattern, e)))?;
        }
        let matcher = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("Bad filter rules: {}", e)))?;
        Ok(Some(matcher))
    }

    /// Decide whether a relative file path is tracked.
    pub fn is_tracked(&self, relative: &Path) -> bool {
        if let Some(excludes) = &self.excludes {
            if excludes.matched(relative, false).is_whitelist() {
                return false;
            }
        }
        match &self.includes {
            Some(includes) => includes.matched(relative, false).is_whitelist(),
            None => true,
        }
    }
}
