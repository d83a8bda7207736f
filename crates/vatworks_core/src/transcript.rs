//! Transcript entry types.
//!
//! A vat's transcript is a sequence of entries, one per delivery, grouped into
//! spans. A span opens with `initialize-worker` (fresh worker) or
//! `load-snapshot` (worker restored from a heap snapshot) and closes with
//! `save-snapshot` or `shutdown-worker`. Replaying a span from its opening
//! entry reconstructs the worker's heap.

use crate::error::{CoreError, CoreResult};
use crate::hash::SnapshotHash;
use crate::id::{BundleId, DeliveryNum};
use crate::protocol::{DeliveryResult, MeterUsage, VatDelivery, VatSyscall, VatSyscallResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

/// A heap snapshot checkpoint taken after delivery `end_pos`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Content hash of the snapshot bytes
    pub hash: SnapshotHash,
    /// Transcript position the snapshot reflects
    pub end_pos: DeliveryNum,
}

/// Options recorded when a fresh worker is started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkerOptions {
    /// Bundle the worker evaluates
    #[serde(rename = "bundleID", default, skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<BundleId>,
    /// Worker flavour (e.g. `xsnap`, `local`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_kind: Option<String>,
    /// Incarnation the worker belongs to
    #[serde(default)]
    pub incarnation: u64,
}

/// A transcript entry's delivery: real work or a span boundary
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptDelivery {
    /// A delivery sent to the vat
    Deliver(VatDelivery),
    /// A fresh worker was started
    InitializeWorker(InitializeWorkerOptions),
    /// A heap snapshot was written
    SaveSnapshot,
    /// A worker was restored from a snapshot
    LoadSnapshot(SnapshotInfo),
    /// The worker was shut down (upgrade or termination)
    ShutdownWorker,
}

impl TranscriptDelivery {
    /// Whether this is a span boundary rather than a real delivery
    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        !matches!(self, Self::Deliver(_))
    }

    /// Whether this entry can open a span
    #[must_use]
    pub fn opens_span(&self) -> bool {
        matches!(self, Self::InitializeWorker(_) | Self::LoadSnapshot(_))
    }

    /// Encode as a tagged array
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Deliver(d) => d.to_wire(),
            Self::InitializeWorker(options) => json!([
                "initialize-worker",
                serde_json::to_value(options).unwrap_or(Value::Null)
            ]),
            Self::SaveSnapshot => json!(["save-snapshot"]),
            Self::LoadSnapshot(info) => json!([
                "load-snapshot",
                {"snapshotID": info.hash.to_hex(), "snapPos": info.end_pos}
            ]),
            Self::ShutdownWorker => json!(["shutdown-worker"]),
        }
    }

    /// Decode from a tagged array
    ///
    /// # Errors
    ///
    /// Returns error if neither a pseudo-delivery nor a vat delivery
    pub fn from_wire(value: &Value) -> CoreResult<Self> {
        let tag = value.get(0).and_then(Value::as_str);
        match tag {
            Some("initialize-worker") => {
                let options = match value.get(1) {
                    None | Some(Value::Null) => InitializeWorkerOptions::default(),
                    Some(v) => serde_json::from_value(v.clone())?,
                };
                Ok(Self::InitializeWorker(options))
            }
            Some("save-snapshot") => Ok(Self::SaveSnapshot),
            Some("shutdown-worker") => Ok(Self::ShutdownWorker),
            Some("load-snapshot") => {
                let record = value.get(1).ok_or_else(|| CoreError::InvalidEncoding {
                    reason: "load-snapshot lacks its record".to_string(),
                })?;
                let hash = record
                    .get("snapshotID")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidEncoding {
                        reason: "load-snapshot lacks snapshotID".to_string(),
                    })?;
                let hash = SnapshotHash::from_hex(hash).map_err(|e| CoreError::InvalidHash {
                    reason: e.to_string(),
                })?;
                let end_pos = record
                    .get("snapPos")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CoreError::InvalidEncoding {
                        reason: "load-snapshot lacks snapPos".to_string(),
                    })?;
                Ok(Self::LoadSnapshot(SnapshotInfo { hash, end_pos }))
            }
            _ => Ok(Self::Deliver(VatDelivery::from_wire(value)?)),
        }
    }
}

impl Serialize for TranscriptDelivery {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TranscriptDelivery {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_wire(&value).map_err(serde::de::Error::custom)
    }
}

/// One syscall and the answer it received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyscallRecord {
    /// The syscall
    pub s: VatSyscall,
    /// The answer
    pub r: VatSyscallResult,
}

impl SyscallRecord {
    /// Create a record
    #[must_use]
    pub fn new(s: VatSyscall, r: VatSyscallResult) -> Self {
        Self { s, r }
    }
}

/// Summary of a delivery's outcome kept in the transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryResultSummary {
    /// `ok` or `error`
    pub status: String,
    /// Meter usage, if recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metering: Option<MeterUsage>,
    /// Hash written by a `save-snapshot` entry
    #[serde(rename = "snapshotID", default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotHash>,
}

impl DeliveryResultSummary {
    /// Plain `ok`
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            metering: None,
            snapshot_id: None,
        }
    }
}

impl From<&DeliveryResult> for DeliveryResultSummary {
    fn from(result: &DeliveryResult) -> Self {
        Self {
            status: result.status_str().to_string(),
            metering: result.meter_usage.clone(),
            snapshot_id: None,
        }
    }
}

/// One transcript entry: `{d, sc, r}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Delivery (or span boundary)
    pub d: TranscriptDelivery,
    /// Syscalls made, in order
    #[serde(default)]
    pub sc: Vec<SyscallRecord>,
    /// Outcome summary
    pub r: DeliveryResultSummary,
}

impl TranscriptEntry {
    /// Entry for a real delivery
    #[must_use]
    pub fn delivery(d: VatDelivery, sc: Vec<SyscallRecord>, result: &DeliveryResult) -> Self {
        Self {
            d: TranscriptDelivery::Deliver(d),
            sc,
            r: DeliveryResultSummary::from(result),
        }
    }

    /// Entry for a span boundary
    #[must_use]
    pub fn pseudo(d: TranscriptDelivery) -> Self {
        Self {
            d,
            sc: Vec::new(),
            r: DeliveryResultSummary::ok(),
        }
    }

    /// Whether this is a span boundary
    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        self.d.is_pseudo()
    }
}
