//! Content hashes for heap snapshots.
//!
//! Snapshots are addressed by the SHA-256 of their uncompressed bytes, which is
//! also the `snapshotID` recorded in transcript files.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 snapshot hash (256 bits / 32 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotHash([u8; 32]);

impl SnapshotHash {
    /// The number of bytes in a hash
    pub const LEN: usize = 32;

    /// Compute the hash of a complete snapshot
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = SnapshotHasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    ///
    /// # Errors
    ///
    /// Returns error if hex is invalid or not 32 bytes
    pub fn from_hex(hex: &str) -> Result<Self, HashError> {
        let bytes = hex::decode(hex).map_err(|_| HashError::InvalidHex)?;
        if bytes.len() != Self::LEN {
            return Err(HashError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check if hash matches data
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Display for SnapshotHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for SnapshotHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SnapshotHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for SnapshotHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Incremental hasher for snapshots streamed in chunks
#[derive(Debug, Clone, Default)]
pub struct SnapshotHasher {
    inner: Sha256,
    len: u64,
}

impl SnapshotHasher {
    /// Create an empty hasher
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.len += chunk.len() as u64;
    }

    /// Bytes hashed so far
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been hashed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finish and return the hash
    #[must_use]
    pub fn finalize(self) -> SnapshotHash {
        SnapshotHash(self.inner.finalize().into())
    }
}

/// Hash-related errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashError {
    /// Invalid hex encoding
    InvalidHex,
    /// Invalid length (not 32 bytes)
    InvalidLength(usize),
}

impl std::error::Error for HashError {}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidHex => write!(f, "Invalid hex encoding"),
            Self::InvalidLength(len) => write!(f, "Invalid hash length: {} (expected 32)", len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        // sha256("abc")
        let hash = SnapshotHash::compute(b"abc");
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = SnapshotHasher::new();
        hasher.update(b"heap ");
        hasher.update(b"bytes");
        assert_eq!(hasher.len(), 10);
        assert_eq!(hasher.finalize(), SnapshotHash::compute(b"heap bytes"));
    }

    #[test]
    fn test_hex_parse_errors() {
        assert_eq!(SnapshotHash::from_hex("zz"), Err(HashError::InvalidHex));
        assert_eq!(SnapshotHash::from_hex("abcd"), Err(HashError::InvalidLength(2)));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let hash = SnapshotHash::compute(b"snapshot");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: SnapshotHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
        assert!(back.verify(b"snapshot"));
    }
}
