//! What a replay run found.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use vatworks_core::{DeliveryNum, SnapshotHash};
use vatworks_transcript::{SyscallStatus, ViolationKind};

/// Replica identifier, unique within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Per-replica counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStats {
    /// Replica
    pub replica: ReplicaId,
    /// Worker process id, if any
    pub pid: Option<u32>,
    /// First delivery the replica handled
    pub start_delivery: Option<DeliveryNum>,
    /// Deliveries handled
    pub deliveries_up: u64,
    /// Time spent in deliveries
    pub delivery_time_total: Duration,
    /// Time spent in deliveries since the last snapshot
    pub delivery_time_since_snapshot: Duration,
}

impl ReplicaStats {
    /// Fresh counters
    #[must_use]
    pub fn new(replica: ReplicaId, pid: Option<u32>) -> Self {
        Self {
            replica,
            pid,
            start_delivery: None,
            deliveries_up: 0,
            delivery_time_total: Duration::ZERO,
            delivery_time_since_snapshot: Duration::ZERO,
        }
    }

    /// Account for one delivery
    pub fn record_delivery(&mut self, delivery_num: DeliveryNum, elapsed: Duration) {
        self.start_delivery.get_or_insert(delivery_num);
        self.deliveries_up += 1;
        self.delivery_time_total += elapsed;
        self.delivery_time_since_snapshot += elapsed;
    }
}

/// A replica deviated from the recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    /// Replica
    pub replica: ReplicaId,
    /// Delivery
    pub delivery_num: DeliveryNum,
    /// First problem seen
    pub kind: ViolationKind,
    /// Position of the first problem
    pub position: usize,
}

/// Replicas that agreed with each other at one position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceGroup {
    /// Status, `None` if these replicas had no syscall at this position
    pub kind: Option<SyscallStatus>,
    /// Syscall made, canonical JSON
    pub syscall: Option<String>,
    /// Answer received, canonical JSON
    pub response: Option<String>,
    /// Members
    pub replicas: Vec<ReplicaId>,
}

/// Replicas disagreed at one syscall position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivergenceReport {
    /// Delivery
    pub delivery_num: DeliveryNum,
    /// Syscall position
    pub position: usize,
    /// One group per distinct behavior
    pub groups: Vec<DivergenceGroup>,
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delivery {} syscall {}: {} groups",
            self.delivery_num,
            self.position,
            self.groups.len()
        )?;
        for group in &self.groups {
            let members: Vec<String> = group.replicas.iter().map(ToString::to_string).collect();
            write!(f, "\n  [{}]", members.join(", "))?;
            match (&group.kind, &group.syscall) {
                (Some(kind), Some(syscall)) => write!(f, " {} {}", kind, syscall)?,
                (Some(kind), None) => write!(f, " {}", kind)?,
                _ => write!(f, " (none)")?,
            }
        }
        Ok(())
    }
}

/// Snapshot hashes disagreed after a save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashMismatch {
    /// Last delivery before the snapshot
    pub delivery_num: DeliveryNum,
    /// Recorded hash, if the transcript had one
    pub expected: Option<SnapshotHash>,
    /// Distinct hashes the replicas produced
    pub actual: Vec<SnapshotHash>,
}

/// Result of a replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySummary {
    /// Transcript lines read
    pub lines_read: usize,
    /// Delivery lines replayed
    pub deliveries_replayed: u64,
    /// Transcript violations, in order
    pub violations: Vec<ViolationRecord>,
    /// Cross-replica divergences, in order
    pub divergences: Vec<DivergenceReport>,
    /// Snapshot hash mismatches, in order
    pub hash_mismatches: Vec<HashMismatch>,
    /// Final counters of every replica that ran
    pub replicas: Vec<ReplicaStats>,
}

impl ReplaySummary {
    /// Whether the run found nothing wrong
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.divergences.is_empty() && self.hash_mismatches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replica_stats() {
        let mut stats = ReplicaStats::new(ReplicaId(3), Some(99));
        stats.record_delivery(5, Duration::from_millis(2));
        stats.record_delivery(6, Duration::from_millis(3));
        assert_eq!(stats.start_delivery, Some(5));
        assert_eq!(stats.deliveries_up, 2);
        assert_eq!(stats.delivery_time_total, Duration::from_millis(5));
    }

    #[test]
    fn test_divergence_display() {
        let report = DivergenceReport {
            delivery_num: 4,
            position: 1,
            groups: vec![
                DivergenceGroup {
                    kind: Some(SyscallStatus::Ok),
                    syscall: Some(r#"["vatstoreGet","a"]"#.to_string()),
                    response: None,
                    replicas: vec![ReplicaId(0), ReplicaId(2)],
                },
                DivergenceGroup {
                    kind: None,
                    syscall: None,
                    response: None,
                    replicas: vec![ReplicaId(1)],
                },
            ],
        };
        let text = report.to_string();
        assert!(text.starts_with("delivery 4 syscall 1: 2 groups"));
        assert!(text.contains("[#0, #2] ok"));
        assert!(text.contains("[#1] (none)"));
    }

    #[test]
    fn test_clean_summary() {
        assert!(ReplaySummary::default().is_clean());
    }
}
