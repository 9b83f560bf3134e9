//! Zip archive codec for change sets.
//!
//! An archive holds one `manifest.json` entry listing the ordered change-set
//! entries, plus the raw bytes of every added or changed file stored under a
//! name derived from its digest. Content addressing deduplicates identical
//! blobs within an archive.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use driftwatch_common::{Error, ResourceId, Result};
use driftwatch_digest::ContentDigest;
use driftwatch_scan::{ChangeSet, ChangeSetCategory, ChangeSetId, DriftEntry};

/// Name of the manifest entry inside a change-set archive.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Prefix under which content blobs are stored, keyed by hex digest.
pub const CONTENT_PREFIX: &str = "content/";

/// The machine-readable manifest stored inside every archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub resource_id: ResourceId,
    pub config_name: String,
    pub category: ChangeSetCategory,
    pub version: u64,
    pub entries: Vec<DriftEntry>,
}

impl ArchiveManifest {
    /// The archive identity recorded in this manifest.
    pub fn id(&self) -> ChangeSetId {
        ChangeSetId {
            resource_id: self.resource_id,
            config_name: self.config_name.clone(),
            category: self.category,
            version: self.version,
        }
    }

    /// Reconstruct the change set this manifest describes.
    pub fn into_change_set(self) -> ChangeSet {
        ChangeSet {
            resource_id: self.resource_id,
            config_name: self.config_name,
            category: self.category,
            version: self.version,
            entries: self.entries,
        }
    }
}

impl From<&ChangeSet> for ArchiveManifest {
    fn from(change_set: &ChangeSet) -> Self {
        Self {
            resource_id: change_set.resource_id,
            config_name: change_set.config_name.clone(),
            category: change_set.category,
            version: change_set.version,
            entries: change_set.entries.clone(),
        }
    }
}

fn zip_err(e: zip::result::ZipError) -> Error {
    Error::Persistence(e.to_string())
}

/// Write a change-set archive to `path`.
///
/// Content for added/changed entries is read from `basedir` and verified
/// against the digest recorded at scan time; a mismatch fails the write so
/// an inconsistent archive is never produced. The archive is fsynced before
/// returning.
pub fn write_archive(path: &Path, change_set: &ChangeSet, basedir: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    let manifest = ArchiveManifest::from(change_set);
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    zip.start_file(MANIFEST_NAME, options).map_err(zip_err)?;
    zip.write_all(&manifest_json)?;

    let mut written: HashSet<ContentDigest> = HashSet::new();
    for entry in &change_set.entries {
        if !change_set.carries_content(entry) {
            continue;
        }
        if !written.insert(entry.digest) {
            continue;
        }

        let source = basedir.join(&entry.relative_path);
        let bytes = std::fs::read(&source)?;
        if ContentDigest::from_bytes(&bytes) != entry.digest {
            return Err(Error::Persistence(format!(
                "Content of {} changed between scan and archive write",
                entry.relative_path
            )));
        }

        let name = format!("{}{}", CONTENT_PREFIX, entry.digest.to_hex());
        zip.start_file(name, options).map_err(zip_err)?;
        zip.write_all(&bytes)?;
    }

    let file = zip.finish().map_err(zip_err)?;
    file.sync_all()?;
    Ok(())
}

/// Read the manifest out of a change-set archive.
pub fn read_manifest(path: &Path) -> Result<ArchiveManifest> {
    let file = File::open(path)?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;

    let mut entry = zip.by_name(MANIFEST_NAME).map_err(zip_err)?;
    let mut json = Vec::new();
    entry.read_to_end(&mut json)?;

    serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))
}

/// Extract the named content blobs from a change-set archive.
///
/// # Errors
/// `Error::NotFound` if a requested digest is not present in the archive.
pub fn read_content(path: &Path, digests: &[ContentDigest]) -> Result<Vec<(ContentDigest, Vec<u8>)>> {
    let file = File::open(path)?;
    let mut zip = ZipArchive::new(file).map_err(zip_err)?;

    let mut blobs = Vec::with_capacity(digests.len());
    for digest in digests {
        let name = format!("{}{}", CONTENT_PREFIX, digest.to_hex());
        let mut entry = zip.by_name(&name).map_err(|_| {
            Error::NotFound(format!("No content for digest {} in {}", digest, path.display()))
        })?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        blobs.push((*digest, bytes));
    }

    Ok(blobs)
}

/// Write a standalone content archive: one entry per blob, named by digest.
///
/// Used when the peer requests specific file content out of a pending
/// change set as a separately acknowledged unit.
pub fn write_content_archive(path: &Path, blobs: &[(ContentDigest, Vec<u8>)]) -> Result<()> {
    let file = File::create(path)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    for (digest, bytes) in blobs {
        zip.start_file(digest.to_hex(), options).map_err(zip_err)?;
        zip.write_all(bytes)?;
    }

    let file = zip.finish().map_err(zip_err)?;
    file.sync_all()?;
    Ok(())
}
