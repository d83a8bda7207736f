//! JSONL log of snapshot loads and saves made during a replay.

use crate::error::ReplayError;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use vatworks_core::{DeliveryNum, SnapshotHash, VatId};

/// What happened to a replica's heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    /// Started from a bundle
    Create,
    /// Started from a snapshot
    Load,
    /// Wrote a snapshot
    Save,
}

/// One line of the activity log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Transcript being replayed
    pub transcript_file: String,
    /// Event kind
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    /// Worker process id, if the worker is a process
    pub pid: Option<u32>,
    /// Vat being replayed
    #[serde(rename = "vatID")]
    pub vat_id: VatId,
    /// Last delivery applied when the event happened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_num: Option<DeliveryNum>,
    /// Snapshot the replica started from
    #[serde(rename = "snapshotID", skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotHash>,
    /// Snapshot written by a save
    #[serde(rename = "saveSnapshotID", skip_serializing_if = "Option::is_none")]
    pub save_snapshot_id: Option<SnapshotHash>,
    /// Snapshot the saving replica was itself loaded from
    #[serde(rename = "loadSnapshotID", skip_serializing_if = "Option::is_none")]
    pub load_snapshot_id: Option<SnapshotHash>,
}

/// Append-only activity log
#[derive(Debug)]
pub struct SnapshotActivityLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotActivityLog {
    /// Log to `path`, creating parent directories
    ///
    /// # Errors
    ///
    /// Returns error if the parent directory cannot be created
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Log file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// Returns error if the record cannot be written
    pub fn append(&self, record: &ActivityRecord) -> Result<(), ReplayError> {
        let line = serde_json::to_string(record).map_err(|e| ReplayError::Io {
            reason: e.to_string(),
        })?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}
