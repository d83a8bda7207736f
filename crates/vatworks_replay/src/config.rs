//! Replay run options.

use crate::error::ReplayError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use vatworks_core::{DeliveryNum, SnapshotHash};
use vatworks_transcript::RelaxedSyscalls;

/// Options for a multi-replica replay run
///
/// Loadable from JSON; every field is optional and falls back to its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Warn instead of failing when a snapshot hash differs from the
    /// recording or between replicas
    pub ignore_snapshot_hash_difference: bool,
    /// Warn instead of failing when replicas make different syscalls
    pub ignore_concurrent_worker_divergences: bool,
    /// Warn instead of failing when a replica deviates from the recording
    pub ignore_transcript_violations: bool,
    /// First delivery after which a snapshot is forced
    pub forced_snapshot_initial: DeliveryNum,
    /// Deliveries between forced snapshots; 0 disables them
    pub forced_snapshot_interval: DeliveryNum,
    /// Start a new replica from every snapshot taken
    pub forced_reload_from_snapshot: bool,
    /// Keep every snapshot made during the run
    pub keep_all_snapshots: bool,
    /// Keep no snapshot made during the run
    pub keep_no_snapshots: bool,
    /// Never retire the first n replicas
    pub keep_worker_initial: usize,
    /// Never retire the n most recent replicas
    pub keep_worker_recent: usize,
    /// Never retire replicas started at a multiple of this many snapshot
    /// intervals from the first delivery replayed; 0 disables
    pub keep_worker_interval: u64,
    /// Never retire replicas loaded on an explicit instruction
    pub keep_worker_explicit_load: bool,
    /// Never retire replicas loaded from divergent snapshots
    pub keep_worker_hash_difference: bool,
    /// Never retire replicas started at these deliveries
    pub keep_worker_transaction_nums: Vec<DeliveryNum>,
    /// Skip recorded metadata syscalls a replica does not make
    pub skip_extra_vc_syscalls: bool,
    /// Simulate metadata syscalls the recording lacks
    pub simulate_vc_syscalls: bool,
    /// Accept mismatches on recorded error serializations
    pub tolerate_error_serialization: bool,
    /// Snapshots to load after the given delivery
    pub load_snapshots: BTreeMap<DeliveryNum, Vec<SnapshotHash>>,
    /// Where to append snapshot activity records; `None` disables
    pub snapshot_activity_log: Option<PathBuf>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            ignore_snapshot_hash_difference: true,
            ignore_concurrent_worker_divergences: true,
            ignore_transcript_violations: true,
            forced_snapshot_initial: 2,
            forced_snapshot_interval: 1000,
            forced_reload_from_snapshot: true,
            keep_all_snapshots: false,
            keep_no_snapshots: false,
            keep_worker_initial: 0,
            keep_worker_recent: 10,
            keep_worker_interval: 10,
            keep_worker_explicit_load: true,
            keep_worker_hash_difference: true,
            keep_worker_transaction_nums: Vec::new(),
            skip_extra_vc_syscalls: true,
            simulate_vc_syscalls: true,
            tolerate_error_serialization: true,
            load_snapshots: BTreeMap::new(),
            snapshot_activity_log: Some(PathBuf::from("snapshot-activity.jsonl")),
        }
    }
}

impl ReplayConfig {
    /// Read options from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ReplayError::Config {
            reason: format!("{}: {}", path.display(), e),
        })
    }

    /// Check that the options are consistent
    ///
    /// # Errors
    ///
    /// Returns error if mutually exclusive options are both set
    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.keep_all_snapshots && self.keep_no_snapshots {
            return Err(ReplayError::Config {
                reason: "keep_all_snapshots and keep_no_snapshots are mutually exclusive".to_string(),
            });
        }
        Ok(())
    }

    /// Relaxed syscall handling for replica comparison
    #[must_use]
    pub fn relaxed_syscalls(&self) -> RelaxedSyscalls {
        RelaxedSyscalls::default()
            .with_skip_extra_vc(self.skip_extra_vc_syscalls)
            .with_simulate_vc(self.simulate_vc_syscalls)
            .with_tolerate_error_serialization(self.tolerate_error_serialization)
    }

    /// Whether a snapshot is forced after `delivery_num`
    #[must_use]
    pub fn forces_snapshot_after(&self, delivery_num: DeliveryNum) -> bool {
        if self.forced_snapshot_interval == 0 {
            return false;
        }
        let offset = i128::from(delivery_num) - i128::from(self.forced_snapshot_initial);
        offset % i128::from(self.forced_snapshot_interval) == 0
    }

    /// Set the forced snapshot schedule
    #[must_use]
    pub fn with_forced_snapshots(mut self, initial: DeliveryNum, interval: DeliveryNum) -> Self {
        self.forced_snapshot_initial = initial;
        self.forced_snapshot_interval = interval;
        self
    }

    /// Set whether snapshots spawn new replicas
    #[must_use]
    pub fn with_forced_reload(mut self, enabled: bool) -> Self {
        self.forced_reload_from_snapshot = enabled;
        self
    }

    /// Set the recent replica window
    #[must_use]
    pub fn with_keep_worker_recent(mut self, recent: usize) -> Self {
        self.keep_worker_recent = recent;
        self
    }

    /// Fail on replica divergence instead of warning
    #[must_use]
    pub fn with_strict_divergence(mut self, strict: bool) -> Self {
        self.ignore_concurrent_worker_divergences = !strict;
        self
    }

    /// Fail on transcript violations instead of warning
    #[must_use]
    pub fn with_strict_transcript(mut self, strict: bool) -> Self {
        self.ignore_transcript_violations = !strict;
        self
    }

    /// Fail on snapshot hash differences instead of warning
    #[must_use]
    pub fn with_strict_snapshot_hashes(mut self, strict: bool) -> Self {
        self.ignore_snapshot_hash_difference = !strict;
        self
    }

    /// Set the activity log path
    #[must_use]
    pub fn with_activity_log(mut self, path: Option<PathBuf>) -> Self {
        self.snapshot_activity_log = path;
        self
    }

    /// Schedule snapshot loads after a delivery
    #[must_use]
    pub fn with_load_snapshots(mut self, delivery_num: DeliveryNum, hashes: Vec<SnapshotHash>) -> Self {
        self.load_snapshots.insert(delivery_num, hashes);
        self
    }
}
