//! Content-addressed heap snapshot storage.
//!
//! Snapshots are keyed by the SHA-256 of their bytes. A store also remembers
//! the latest snapshot written for each vat so a warehouse can restore a vat
//! without knowing the hash up front.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use vatworks_core::{CoreError, CoreResult, DeliveryNum, SnapshotHash, VatId};

/// Result of writing a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSnapshot {
    /// Content hash
    pub hash: SnapshotHash,
    /// Uncompressed size
    pub raw_byte_count: u64,
    /// Time spent hashing and writing
    pub save_duration: Duration,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Snapshots currently held
    pub snapshot_count: usize,
    /// Bytes currently held
    pub total_bytes: u64,
    /// Number of loads
    pub load_count: u64,
    /// Number of saves, including duplicates
    pub save_count: u64,
}

/// Heap snapshot store
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot of `vat_id` taken after delivery `end_pos`
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be persisted
    fn save_snapshot(
        &self,
        vat_id: &VatId,
        end_pos: DeliveryNum,
        bytes: &[u8],
    ) -> CoreResult<SavedSnapshot>;

    /// Load the latest snapshot saved for a vat
    ///
    /// # Errors
    ///
    /// Returns error if the vat has no snapshot
    fn load_snapshot(&self, vat_id: &VatId) -> CoreResult<Vec<u8>>;

    /// Load a snapshot by hash
    ///
    /// # Errors
    ///
    /// Returns error if the hash is unknown or the bytes fail verification
    fn load_by_hash(&self, hash: &SnapshotHash) -> CoreResult<Vec<u8>>;

    /// Delete a snapshot, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if removal fails
    fn delete(&self, hash: &SnapshotHash) -> CoreResult<bool>;

    /// Whether a snapshot is held
    fn contains(&self, hash: &SnapshotHash) -> bool;
}

/// In-memory snapshot store
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<SnapshotHash, Arc<Vec<u8>>>>,
    latest: RwLock<HashMap<VatId, (SnapshotHash, DeliveryNum)>>,
    stats: RwLock<StoreStats>,
}

impl MemorySnapshotStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get store statistics
    #[must_use]
    pub fn stats(&self) -> StoreStats {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Latest snapshot recorded for a vat
    #[must_use]
    pub fn latest(&self, vat_id: &VatId) -> Option<(SnapshotHash, DeliveryNum)> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vat_id)
            .copied()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(
        &self,
        vat_id: &VatId,
        end_pos: DeliveryNum,
        bytes: &[u8],
    ) -> CoreResult<SavedSnapshot> {
        let started = Instant::now();
        let hash = SnapshotHash::compute(bytes);
        {
            let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
            let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
            if !snapshots.contains_key(&hash) {
                snapshots.insert(hash, Arc::new(bytes.to_vec()));
                stats.snapshot_count += 1;
                stats.total_bytes += bytes.len() as u64;
            }
            stats.save_count += 1;
        }
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vat_id.clone(), (hash, end_pos));
        debug!(vat_id = %vat_id, end_pos, hash = %hash, "snapshot saved");
        Ok(SavedSnapshot {
            hash,
            raw_byte_count: bytes.len() as u64,
            save_duration: started.elapsed(),
        })
    }

    fn load_snapshot(&self, vat_id: &VatId) -> CoreResult<Vec<u8>> {
        let (hash, _) = self.latest(vat_id).ok_or_else(|| StoreError::SnapshotNotFound {
            id: vat_id.to_string(),
        })?;
        self.load_by_hash(&hash)
    }

    fn load_by_hash(&self, hash: &SnapshotHash) -> CoreResult<Vec<u8>> {
        let bytes = self
            .snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::SnapshotNotFound {
                id: hash.to_hex(),
            })?;
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .load_count += 1;
        Ok(bytes.as_ref().clone())
    }

    fn delete(&self, hash: &SnapshotHash) -> CoreResult<bool> {
        let removed = self
            .snapshots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash);
        match removed {
            Some(bytes) => {
                let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
                stats.snapshot_count -= 1;
                stats.total_bytes -= bytes.len() as u64;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn contains(&self, hash: &SnapshotHash) -> bool {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hash)
    }
}

/// Snapshot store backed by a directory of `<hash>.xss` files
///
/// Files are written to a temporary file in the same directory and renamed
/// into place, so a reader never sees a partial snapshot.
#[derive(Debug)]
pub struct FsSnapshotStore {
    dir: PathBuf,
    latest: RwLock<HashMap<VatId, (SnapshotHash, DeliveryNum)>>,
}

impl FsSnapshotStore {
    /// Open (creating if needed) a snapshot directory
    ///
    /// # Errors
    ///
    /// Returns error if directory creation fails
    pub fn new(dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            reason: format!("failed to create snapshot directory {}: {}", dir.display(), e),
        })?;
        Ok(Self {
            dir,
            latest: RwLock::new(HashMap::new()),
        })
    }

    /// Snapshot directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a snapshot is stored under
    #[must_use]
    pub fn snapshot_path(&self, hash: &SnapshotHash) -> PathBuf {
        self.dir.join(format!("{}.xss", hash.to_hex()))
    }
}

impl SnapshotStore for FsSnapshotStore {
    fn save_snapshot(
        &self,
        vat_id: &VatId,
        end_pos: DeliveryNum,
        bytes: &[u8],
    ) -> CoreResult<SavedSnapshot> {
        let started = Instant::now();
        let hash = SnapshotHash::compute(bytes);
        let path = self.snapshot_path(&hash);
        if path.exists() {
            debug!(hash = %hash, "snapshot already on disk");
        } else {
            let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            tmp.write_all(bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| StoreError::Io {
                reason: format!("failed to persist {}: {}", path.display(), e.error),
            })?;
        }
        self.latest
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(vat_id.clone(), (hash, end_pos));
        debug!(vat_id = %vat_id, end_pos, hash = %hash, path = %path.display(), "snapshot saved");
        Ok(SavedSnapshot {
            hash,
            raw_byte_count: bytes.len() as u64,
            save_duration: started.elapsed(),
        })
    }

    fn load_snapshot(&self, vat_id: &VatId) -> CoreResult<Vec<u8>> {
        let latest = self
            .latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(vat_id)
            .copied();
        let (hash, _) = latest.ok_or_else(|| StoreError::SnapshotNotFound {
            id: vat_id.to_string(),
        })?;
        self.load_by_hash(&hash)
    }

    fn load_by_hash(&self, hash: &SnapshotHash) -> CoreResult<Vec<u8>> {
        let path = self.snapshot_path(hash);
        let bytes = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CoreError::from(StoreError::SnapshotNotFound { id: hash.to_hex() })
            } else {
                CoreError::from(e)
            }
        })?;
        if !hash.verify(&bytes) {
            let actual = SnapshotHash::compute(&bytes);
            warn!(hash = %hash, actual = %actual, path = %path.display(), "snapshot file does not match its name");
            return Err(StoreError::Corrupt {
                hash: hash.to_hex(),
                actual: actual.to_hex(),
            }
            .into());
        }
        Ok(bytes)
    }

    fn delete(&self, hash: &SnapshotHash) -> CoreResult<bool> {
        match std::fs::remove_file(self.snapshot_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn contains(&self, hash: &SnapshotHash) -> bool {
        self.snapshot_path(hash).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_save_load() {
        let store = MemorySnapshotStore::new();
        let vat = VatId::new("v1");
        let saved = store.save_snapshot(&vat, 4, b"heap-4").unwrap();
        assert_eq!(saved.hash, SnapshotHash::compute(b"heap-4"));
        assert_eq!(saved.raw_byte_count, 6);

        assert_eq!(store.load_snapshot(&vat).unwrap(), b"heap-4");
        assert_eq!(store.load_by_hash(&saved.hash).unwrap(), b"heap-4");
        assert_eq!(store.latest(&vat), Some((saved.hash, 4)));
    }

    #[test]
    fn test_memory_latest_wins() {
        let store = MemorySnapshotStore::new();
        let vat = VatId::new("v1");
        store.save_snapshot(&vat, 2, b"old").unwrap();
        store.save_snapshot(&vat, 9, b"new").unwrap();
        assert_eq!(store.load_snapshot(&vat).unwrap(), b"new");
        assert_eq!(store.stats().snapshot_count, 2);
    }

    #[test]
    fn test_memory_duplicate_counted_once() {
        let store = MemorySnapshotStore::new();
        store.save_snapshot(&VatId::new("a"), 1, b"same").unwrap();
        store.save_snapshot(&VatId::new("b"), 1, b"same").unwrap();
        let stats = store.stats();
        assert_eq!(stats.snapshot_count, 1);
        assert_eq!(stats.save_count, 2);
        assert_eq!(stats.total_bytes, 4);
    }

    #[test]
    fn test_memory_delete() {
        let store = MemorySnapshotStore::new();
        let saved = store.save_snapshot(&VatId::new("v1"), 1, b"gone").unwrap();
        assert!(store.delete(&saved.hash).unwrap());
        assert!(!store.contains(&saved.hash));
        assert!(!store.delete(&saved.hash).unwrap());
        assert!(store.load_by_hash(&saved.hash).is_err());
    }

    #[test]
    fn test_missing_vat_snapshot() {
        let store = MemorySnapshotStore::new();
        let err = store.load_snapshot(&VatId::new("v3")).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path()).unwrap();
        let vat = VatId::new("v2");
        let saved = store.save_snapshot(&vat, 3, b"disk heap").unwrap();

        let path = store.snapshot_path(&saved.hash);
        assert!(path.exists());
        assert!(path.to_string_lossy().ends_with(".xss"));
        assert_eq!(store.load_snapshot(&vat).unwrap(), b"disk heap");
        assert!(store.delete(&saved.hash).unwrap());
        assert!(!store.contains(&saved.hash));
    }

    #[test]
    fn test_fs_store_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path()).unwrap();
        let saved = store.save_snapshot(&VatId::new("v2"), 3, b"original").unwrap();
        std::fs::write(store.snapshot_path(&saved.hash), b"tampered").unwrap();
        let err = store.load_by_hash(&saved.hash).unwrap_err();
        assert_eq!(
            err,
            CoreError::HashMismatch {
                expected: saved.hash.to_hex(),
                actual: SnapshotHash::compute(b"tampered").to_hex(),
            }
        );
    }
}
