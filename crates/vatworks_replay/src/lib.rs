//! Vatworks Multi-Replica Replay
//!
//! Replays one exported transcript through several workers for the same vat
//! in lockstep. Every replica is checked against the recording, and the
//! replicas are checked against each other, so nondeterminism that a single
//! replay cannot see shows up as a divergence report.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod activity;
pub mod config;
pub mod coordinator;
pub mod divergence;
pub mod error;
pub mod keep;
pub mod summary;

pub use activity::{ActivityKind, ActivityRecord, SnapshotActivityLog};
pub use config::ReplayConfig;
pub use coordinator::ReplayCoordinator;
pub use divergence::detect_divergence;
pub use error::ReplayError;
pub use keep::{KeepCandidate, KeepPolicy};
pub use summary::{
    DivergenceGroup, DivergenceReport, HashMismatch, ReplicaId, ReplicaStats, ReplaySummary,
    ViolationRecord,
};
