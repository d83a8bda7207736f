//! Transport errors.
//!
//! Everything here is a worker-fatal condition or a caller bug. Vat-level
//! failures travel inside `DeliveryResult` instead.

use vatworks_core::CoreError;

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// A delivery or snapshot is already outstanding on this worker
    #[error("Delivery already in flight")]
    DeliveryInFlight,

    /// The transport was closed
    #[error("Worker transport closed")]
    Closed,

    /// Worker killed by a signal
    #[error("Worker terminated by signal {signal}")]
    Signal {
        /// Signal number
        signal: i32,
    },

    /// Worker exited with a non-zero code
    #[error("Worker exited with code {code}")]
    ExitCode {
        /// Exit code
        code: i32,
    },

    /// Worker exited cleanly while work was outstanding
    #[error("Worker exited unexpectedly")]
    Exited,

    /// Uncaught exception inside the worker
    #[error("Worker exception: {message}")]
    WorkerException {
        /// Exception text
        message: String,
    },

    /// Malformed frame or message
    #[error("Protocol error: {reason}")]
    Protocol {
        /// What was wrong
        reason: String,
    },

    /// Worker process could not be started
    #[error("Failed to spawn {program}: {reason}")]
    Spawn {
        /// Program path
        program: String,
        /// Underlying error
        reason: String,
    },

    /// Pipe or file I/O failure
    #[error("IO error: {reason}")]
    Io {
        /// Underlying error
        reason: String,
    },

    /// This worker kind cannot snapshot
    #[error("Worker does not support snapshots")]
    SnapshotsUnsupported,

    /// Snapshot store failure
    #[error("Snapshot store error: {0}")]
    Storage(#[from] CoreError),
}

impl TransportError {
    /// Whether the worker process died
    #[must_use]
    pub fn is_worker_death(&self) -> bool {
        matches!(self, Self::Signal { .. } | Self::ExitCode { .. } | Self::Exited)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
