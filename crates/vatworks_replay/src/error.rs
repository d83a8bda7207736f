//! Replay run errors.

use vatworks_core::CoreError;
use vatworks_transcript::TranscriptError;
use vatworks_transport::TransportError;

/// Errors that end a replay run
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// Options are inconsistent
    #[error("Invalid configuration: {reason}")]
    Config {
        /// What is wrong
        reason: String,
    },

    /// Transcript file does not have the expected shape
    #[error("Bad transcript at line {line}: {reason}")]
    BadTranscript {
        /// 1-based line number
        line: usize,
        /// What is wrong
        reason: String,
    },

    /// A replica's snapshot differs from the recorded hash
    #[error("Snapshot hash does not match: {actual} != {expected} for replica {replica}")]
    SnapshotHashMismatch {
        /// Recorded hash
        expected: String,
        /// Replica's hash
        actual: String,
        /// Replica
        replica: String,
    },

    /// Replicas produced different snapshots of the same delivery
    #[error("Snapshot hashes do not match each other after delivery {delivery_num}: {hashes}")]
    SnapshotHashesDiverge {
        /// Delivery
        delivery_num: u64,
        /// Distinct hashes, comma separated
        hashes: String,
    },

    /// Replicas made different syscalls for the same delivery
    #[error("Divergent execution between workers at delivery {delivery_num}")]
    Divergence {
        /// Delivery
        delivery_num: u64,
    },

    /// Transcript reading or a replica's transcript violation
    #[error("{0}")]
    Transcript(#[from] TranscriptError),

    /// A replica's worker failed
    #[error("Worker failure: {0}")]
    Transport(#[from] TransportError),

    /// Snapshot store or bundle failure
    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),

    /// Activity log write failure
    #[error("IO error: {reason}")]
    Io {
        /// Underlying error
        reason: String,
    },
}

impl From<std::io::Error> for ReplayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
