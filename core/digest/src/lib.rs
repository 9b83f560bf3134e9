//! Content-addressed hashing using SHA-256.
//!
//! Every tracked file is identified by the digest of its bytes; the digest,
//! not the modification time, is authoritative for drift detection.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use driftwatch_common::{Error, Result};

/// A content digest (SHA-256, 256-bit).
///
/// Deterministic and collision-resistant; a pure function of the input bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Digest arbitrary in-memory bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Digest a reader incrementally, without buffering the whole input.
    ///
    /// # Errors
    /// Propagates any read error; a partial digest is never returned.
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self(hasher.finalize().into()))
    }

    /// Digest a file by path, streaming its contents.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or read.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    /// Get the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from a hex string.
    ///
    /// # Errors
    /// Returns an error if the input is not 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidInput(format!("Invalid digest hex: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("Digest must be 32 bytes".to_string()))?;
        Ok(Self(array))
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "ContentDigest({})", hex.get(..16).unwrap_or(&hex))
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Digests serialize as hex strings so manifests stay human-readable.
impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentDigest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_digest_deterministic() {
        let data = b"hello world";
        let d1 = ContentDigest::from_bytes(data);
        let d2 = ContentDigest::from_bytes(data);
        assert_eq!(d1, d2);
    }

    #[test]
    fn test_digest_different_data() {
        let d1 = ContentDigest::from_bytes(b"hello");
        let d2 = ContentDigest::from_bytes(b"world");
        assert_ne!(d1, d2);
    }

    #[test]
    fn test_known_sha256_vector() {
        // SHA-256 of the empty input.
        let digest = ContentDigest::from_bytes(b"");
        assert_eq!(
            digest.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        let data = vec![0xabu8; 200 * 1024];
        let from_bytes = ContentDigest::from_bytes(&data);
        let from_reader = ContentDigest::from_reader(&data[..]).unwrap();
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn test_digest_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"file content").unwrap();

        let from_file = ContentDigest::from_file(file.path()).unwrap();
        assert_eq!(from_file, ContentDigest::from_bytes(b"file content"));
    }

    #[test]
    fn test_digest_missing_file_fails() {
        assert!(ContentDigest::from_file(Path::new("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = ContentDigest::from_bytes(b"round trip");
        let restored = ContentDigest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, restored);
        assert_eq!(restored.as_bytes(), digest.as_bytes());
    }

    #[test]
    fn test_from_hex_rejects_bad_input() {
        assert!(ContentDigest::from_hex("not hex").is_err());
        assert!(ContentDigest::from_hex("abcd").is_err());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let digest = ContentDigest::from_bytes(b"serde");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", digest.to_hex()));

        let restored: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(digest, restored);
    }
}
