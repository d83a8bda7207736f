//! Kernel keeper: vat records, transcripts and snapshot metadata.
//!
//! Transcript positions count every entry, pseudo-deliveries included. The
//! current span runs from the most recent `initialize-worker` or
//! `load-snapshot` entry to the end of the transcript.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;
use vatworks_core::{
    BundleId, CoreError, CoreResult, DeliveryNum, DeliveryResultSummary, SnapshotInfo,
    TranscriptDelivery, TranscriptEntry, VatId,
};

/// Per-vat options fixed at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatOptions {
    /// Human-readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Whether deliveries are recorded and replayed
    pub use_transcript: bool,
    /// Critical vats panic the kernel on failure
    #[serde(default)]
    pub critical: bool,
    /// Parameters passed in `startVat`
    #[serde(default)]
    pub vat_parameters: Value,
}

impl Default for VatOptions {
    fn default() -> Self {
        Self {
            name: None,
            use_transcript: true,
            critical: false,
            vat_parameters: Value::Null,
        }
    }
}

impl VatOptions {
    /// Set the vat name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Enable or disable transcript recording
    #[must_use]
    pub fn with_transcript(mut self, use_transcript: bool) -> Self {
        self.use_transcript = use_transcript;
        self
    }
}

/// What the kernel knows about a vat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VatRecord {
    /// Source bundle
    pub source: BundleId,
    /// Creation options
    pub options: VatOptions,
    /// Created at runtime rather than at kernel boot
    pub dynamic: bool,
}

/// Persistence layer for vats and their transcripts
pub trait KernelKeeper: Send + Sync {
    /// Register a vat
    ///
    /// # Errors
    ///
    /// Returns error if the vat already exists
    fn add_vat(&self, vat_id: &VatId, record: VatRecord) -> CoreResult<()>;

    /// Whether the vat exists and has not been terminated
    fn vat_is_alive(&self, vat_id: &VatId) -> bool;

    /// Mark a vat terminated
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn mark_vat_dead(&self, vat_id: &VatId) -> CoreResult<()>;

    /// Source and options of a vat
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn vat_record(&self, vat_id: &VatId) -> CoreResult<VatRecord>;

    /// Replace a vat's source bundle (upgrade)
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn set_vat_source(&self, vat_id: &VatId, source: BundleId) -> CoreResult<()>;

    /// Live static vats, in creation order
    fn static_vat_ids(&self) -> Vec<VatId>;

    /// Live dynamic vats, in creation order
    fn dynamic_vat_ids(&self) -> Vec<VatId>;

    /// Entries of the current span with their positions
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn transcript_span(&self, vat_id: &VatId) -> CoreResult<Vec<(DeliveryNum, TranscriptEntry)>>;

    /// Append an entry, returning its position
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn append_transcript(&self, vat_id: &VatId, entry: TranscriptEntry) -> CoreResult<DeliveryNum>;

    /// Position the next entry will take
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn next_delivery_num(&self, vat_id: &VatId) -> CoreResult<DeliveryNum>;

    /// Number of real deliveries in the current span
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn transcript_span_deliveries(&self, vat_id: &VatId) -> CoreResult<u64>;

    /// Latest snapshot of the vat's current incarnation
    fn snapshot_info(&self, vat_id: &VatId) -> Option<SnapshotInfo>;

    /// Record a snapshot: close the span with `save-snapshot` and open the
    /// next one with `load-snapshot`
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn record_snapshot(&self, vat_id: &VatId, info: SnapshotInfo) -> CoreResult<()>;

    /// Close the span with `shutdown-worker`, forget the snapshot and bump
    /// the incarnation, returning the new incarnation number
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn begin_new_incarnation(&self, vat_id: &VatId) -> CoreResult<u64>;

    /// Current incarnation
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    fn incarnation(&self, vat_id: &VatId) -> CoreResult<u64>;

    /// Deliveries before the first snapshot
    fn snapshot_initial(&self) -> u64;

    /// Deliveries between later snapshots
    fn snapshot_interval(&self) -> u64;

    /// Change the snapshot interval
    fn set_snapshot_interval(&self, interval: u64);
}

#[derive(Debug)]
struct VatState {
    record: VatRecord,
    alive: bool,
    entries: Vec<TranscriptEntry>,
    span_start: usize,
    snapshot: Option<SnapshotInfo>,
    incarnation: u64,
}

impl VatState {
    fn span_deliveries(&self) -> u64 {
        self.entries[self.span_start..]
            .iter()
            .filter(|e| !e.is_pseudo())
            .count() as u64
    }
}

#[derive(Debug)]
struct KeeperState {
    vats: HashMap<VatId, VatState>,
    order: Vec<VatId>,
    snapshot_initial: u64,
    snapshot_interval: u64,
}

impl KeeperState {
    fn vat(&self, vat_id: &VatId) -> CoreResult<&VatState> {
        self.vats.get(vat_id).ok_or_else(|| unknown_vat(vat_id))
    }

    fn vat_mut(&mut self, vat_id: &VatId) -> CoreResult<&mut VatState> {
        self.vats.get_mut(vat_id).ok_or_else(|| unknown_vat(vat_id))
    }
}

fn unknown_vat(vat_id: &VatId) -> CoreError {
    StoreError::UnknownVat {
        vat_id: vat_id.to_string(),
    }
    .into()
}

/// In-memory kernel keeper
#[derive(Debug)]
pub struct MemoryKernelKeeper {
    state: Mutex<KeeperState>,
}

impl MemoryKernelKeeper {
    /// Create a keeper with the given snapshot schedule
    #[must_use]
    pub fn new(snapshot_initial: u64, snapshot_interval: u64) -> Self {
        Self {
            state: Mutex::new(KeeperState {
                vats: HashMap::new(),
                order: Vec::new(),
                snapshot_initial,
                snapshot_interval,
            }),
        }
    }

    /// Full transcript of a vat, every span
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown
    pub fn full_transcript(&self, vat_id: &VatId) -> CoreResult<Vec<TranscriptEntry>> {
        let state = self.lock();
        Ok(state.vat(vat_id)?.entries.clone())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, KeeperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_ids(&self, dynamic: bool) -> Vec<VatId> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter(|id| {
                state
                    .vats
                    .get(*id)
                    .is_some_and(|v| v.alive && v.record.dynamic == dynamic)
            })
            .cloned()
            .collect()
    }
}

impl Default for MemoryKernelKeeper {
    fn default() -> Self {
        Self::new(2, 200)
    }
}

impl KernelKeeper for MemoryKernelKeeper {
    fn add_vat(&self, vat_id: &VatId, record: VatRecord) -> CoreResult<()> {
        let mut state = self.lock();
        if state.vats.contains_key(vat_id) {
            return Err(CoreError::AlreadyExists {
                kind: "Vat".to_string(),
                id: vat_id.to_string(),
            });
        }
        state.vats.insert(
            vat_id.clone(),
            VatState {
                record,
                alive: true,
                entries: Vec::new(),
                span_start: 0,
                snapshot: None,
                incarnation: 0,
            },
        );
        state.order.push(vat_id.clone());
        Ok(())
    }

    fn vat_is_alive(&self, vat_id: &VatId) -> bool {
        self.lock().vats.get(vat_id).is_some_and(|v| v.alive)
    }

    fn mark_vat_dead(&self, vat_id: &VatId) -> CoreResult<()> {
        self.lock().vat_mut(vat_id)?.alive = false;
        Ok(())
    }

    fn vat_record(&self, vat_id: &VatId) -> CoreResult<VatRecord> {
        Ok(self.lock().vat(vat_id)?.record.clone())
    }

    fn set_vat_source(&self, vat_id: &VatId, source: BundleId) -> CoreResult<()> {
        self.lock().vat_mut(vat_id)?.record.source = source;
        Ok(())
    }

    fn static_vat_ids(&self) -> Vec<VatId> {
        self.live_ids(false)
    }

    fn dynamic_vat_ids(&self) -> Vec<VatId> {
        self.live_ids(true)
    }

    fn transcript_span(&self, vat_id: &VatId) -> CoreResult<Vec<(DeliveryNum, TranscriptEntry)>> {
        let state = self.lock();
        let vat = state.vat(vat_id)?;
        Ok(vat.entries[vat.span_start..]
            .iter()
            .enumerate()
            .map(|(i, e)| ((vat.span_start + i) as DeliveryNum, e.clone()))
            .collect())
    }

    fn append_transcript(&self, vat_id: &VatId, entry: TranscriptEntry) -> CoreResult<DeliveryNum> {
        let mut state = self.lock();
        let vat = state.vat_mut(vat_id)?;
        let pos = vat.entries.len() as DeliveryNum;
        vat.entries.push(entry);
        Ok(pos)
    }

    fn next_delivery_num(&self, vat_id: &VatId) -> CoreResult<DeliveryNum> {
        Ok(self.lock().vat(vat_id)?.entries.len() as DeliveryNum)
    }

    fn transcript_span_deliveries(&self, vat_id: &VatId) -> CoreResult<u64> {
        Ok(self.lock().vat(vat_id)?.span_deliveries())
    }

    fn snapshot_info(&self, vat_id: &VatId) -> Option<SnapshotInfo> {
        self.lock().vats.get(vat_id).and_then(|v| v.snapshot)
    }

    fn record_snapshot(&self, vat_id: &VatId, info: SnapshotInfo) -> CoreResult<()> {
        let mut state = self.lock();
        let vat = state.vat_mut(vat_id)?;
        let mut save = TranscriptEntry::pseudo(TranscriptDelivery::SaveSnapshot);
        save.r = DeliveryResultSummary {
            snapshot_id: Some(info.hash),
            ..DeliveryResultSummary::ok()
        };
        vat.entries.push(save);
        vat.span_start = vat.entries.len();
        vat.entries
            .push(TranscriptEntry::pseudo(TranscriptDelivery::LoadSnapshot(info)));
        vat.snapshot = Some(info);
        debug!(vat_id = %vat_id, end_pos = info.end_pos, hash = %info.hash, "snapshot recorded");
        Ok(())
    }

    fn begin_new_incarnation(&self, vat_id: &VatId) -> CoreResult<u64> {
        let mut state = self.lock();
        let vat = state.vat_mut(vat_id)?;
        vat.entries
            .push(TranscriptEntry::pseudo(TranscriptDelivery::ShutdownWorker));
        vat.span_start = vat.entries.len();
        vat.snapshot = None;
        vat.incarnation += 1;
        Ok(vat.incarnation)
    }

    fn incarnation(&self, vat_id: &VatId) -> CoreResult<u64> {
        Ok(self.lock().vat(vat_id)?.incarnation)
    }

    fn snapshot_initial(&self) -> u64 {
        self.lock().snapshot_initial
    }

    fn snapshot_interval(&self) -> u64 {
        self.lock().snapshot_interval
    }

    fn set_snapshot_interval(&self, interval: u64) {
        self.lock().snapshot_interval = interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vatworks_core::{DeliveryResult, SnapshotHash, VatDelivery};

    fn keeper_with(vat: &str, dynamic: bool) -> MemoryKernelKeeper {
        let keeper = MemoryKernelKeeper::default();
        keeper
            .add_vat(
                &VatId::new(vat),
                VatRecord {
                    source: BundleId::new("b1-src"),
                    options: VatOptions::default(),
                    dynamic,
                },
            )
            .unwrap();
        keeper
    }

    fn boyd() -> TranscriptEntry {
        TranscriptEntry::delivery(VatDelivery::BringOutYourDead, vec![], &DeliveryResult::ok())
    }

    #[test]
    fn test_add_vat_twice_fails() {
        let keeper = keeper_with("v1", false);
        let err = keeper
            .add_vat(
                &VatId::new("v1"),
                VatRecord {
                    source: BundleId::new("b"),
                    options: VatOptions::default(),
                    dynamic: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::AlreadyExists { .. }));
    }

    #[test]
    fn test_static_and_dynamic_lists() {
        let keeper = keeper_with("v1", false);
        keeper
            .add_vat(
                &VatId::new("v2"),
                VatRecord {
                    source: BundleId::new("b"),
                    options: VatOptions::default().with_name("zoe"),
                    dynamic: true,
                },
            )
            .unwrap();
        assert_eq!(keeper.static_vat_ids(), vec![VatId::new("v1")]);
        assert_eq!(keeper.dynamic_vat_ids(), vec![VatId::new("v2")]);

        keeper.mark_vat_dead(&VatId::new("v2")).unwrap();
        assert!(keeper.dynamic_vat_ids().is_empty());
        assert!(!keeper.vat_is_alive(&VatId::new("v2")));
    }

    #[test]
    fn test_span_counts_real_deliveries() {
        let vat = VatId::new("v1");
        let keeper = keeper_with("v1", false);
        keeper
            .append_transcript(
                &vat,
                TranscriptEntry::pseudo(TranscriptDelivery::InitializeWorker(Default::default())),
            )
            .unwrap();
        assert_eq!(keeper.append_transcript(&vat, boyd()).unwrap(), 1);
        keeper.append_transcript(&vat, boyd()).unwrap();
        assert_eq!(keeper.transcript_span_deliveries(&vat).unwrap(), 2);
        assert_eq!(keeper.next_delivery_num(&vat).unwrap(), 3);
    }

    #[test]
    fn test_record_snapshot_rolls_span() {
        let vat = VatId::new("v1");
        let keeper = keeper_with("v1", false);
        keeper.append_transcript(&vat, boyd()).unwrap();
        keeper.append_transcript(&vat, boyd()).unwrap();
        let info = SnapshotInfo {
            hash: SnapshotHash::compute(b"h"),
            end_pos: 2,
        };
        keeper.record_snapshot(&vat, info).unwrap();

        let span = keeper.transcript_span(&vat).unwrap();
        assert_eq!(span.len(), 1);
        assert_eq!(span[0].0, 3);
        assert_eq!(span[0].1.d, TranscriptDelivery::LoadSnapshot(info));
        assert_eq!(keeper.transcript_span_deliveries(&vat).unwrap(), 0);
        assert_eq!(keeper.snapshot_info(&vat), Some(info));

        let full = keeper.full_transcript(&vat).unwrap();
        assert_eq!(full[2].d, TranscriptDelivery::SaveSnapshot);
        assert_eq!(full[2].r.snapshot_id, Some(info.hash));
    }

    #[test]
    fn test_new_incarnation_clears_snapshot() {
        let vat = VatId::new("v1");
        let keeper = keeper_with("v1", false);
        keeper
            .record_snapshot(
                &vat,
                SnapshotInfo {
                    hash: SnapshotHash::compute(b"h"),
                    end_pos: 0,
                },
            )
            .unwrap();
        assert_eq!(keeper.begin_new_incarnation(&vat).unwrap(), 1);
        assert_eq!(keeper.snapshot_info(&vat), None);
        assert!(keeper.transcript_span(&vat).unwrap().is_empty());
        assert_eq!(keeper.incarnation(&vat).unwrap(), 1);
    }

    #[test]
    fn test_unknown_vat() {
        let keeper = MemoryKernelKeeper::default();
        assert!(keeper.transcript_span(&VatId::new("v9")).is_err());
        assert!(keeper.snapshot_info(&VatId::new("v9")).is_none());
    }

    #[test]
    fn test_snapshot_settings() {
        let keeper = MemoryKernelKeeper::new(3, 10);
        assert_eq!(keeper.snapshot_initial(), 3);
        keeper.set_snapshot_interval(50);
        assert_eq!(keeper.snapshot_interval(), 50);
    }
}
