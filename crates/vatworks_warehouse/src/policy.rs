//! Warehouse and snapshot scheduling settings.

use serde::{Deserialize, Serialize};
use vatworks_storage::KernelKeeper;
use vatworks_transcript::RelaxedSyscalls;

/// Warehouse settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehousePolicy {
    /// Vats kept online before the least recently used is evicted
    pub max_vats_online: usize,
    /// Replace a worker with one loaded from its fresh snapshot
    pub restart_worker_on_snapshot: bool,
    /// Relaxed syscall handling during reactivation replay
    pub relaxed_syscalls: RelaxedSyscalls,
}

impl Default for WarehousePolicy {
    fn default() -> Self {
        Self {
            max_vats_online: 50,
            restart_worker_on_snapshot: true,
            relaxed_syscalls: RelaxedSyscalls::default(),
        }
    }
}

impl WarehousePolicy {
    /// Set the online bound
    #[must_use]
    pub fn with_max_vats_online(mut self, max: usize) -> Self {
        self.max_vats_online = max;
        self
    }

    /// Set whether snapshots restart the worker
    #[must_use]
    pub fn with_restart_worker_on_snapshot(mut self, restart: bool) -> Self {
        self.restart_worker_on_snapshot = restart;
        self
    }

    /// Set relaxed syscall handling
    #[must_use]
    pub fn with_relaxed_syscalls(mut self, relaxed: RelaxedSyscalls) -> Self {
        self.relaxed_syscalls = relaxed;
        self
    }

    /// Vats brought online by `start`
    #[must_use]
    pub fn preload_limit(&self) -> usize {
        self.max_vats_online / 2
    }
}

/// Why a snapshot is due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotReason {
    /// First snapshot of the incarnation
    Initial,
    /// Regular checkpoint
    Interval,
}

/// When to checkpoint a vat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    /// Deliveries before the first snapshot
    pub initial: u64,
    /// Deliveries between later snapshots
    pub interval: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            initial: 2,
            interval: 200,
        }
    }
}

impl SnapshotPolicy {
    /// Policy with explicit settings
    #[must_use]
    pub fn new(initial: u64, interval: u64) -> Self {
        Self { initial, interval }
    }

    /// Policy currently configured in the keeper
    #[must_use]
    pub fn from_keeper(keeper: &dyn KernelKeeper) -> Self {
        Self::new(keeper.snapshot_initial(), keeper.snapshot_interval())
    }

    /// Decide from the deliveries in the current span and whether the
    /// incarnation already has a snapshot
    #[must_use]
    pub fn due(&self, span_deliveries: u64, has_snapshot: bool) -> Option<SnapshotReason> {
        if !has_snapshot && span_deliveries >= self.initial {
            Some(SnapshotReason::Initial)
        } else if self.interval > 0 && span_deliveries >= self.interval {
            Some(SnapshotReason::Interval)
        } else {
            None
        }
    }
}
