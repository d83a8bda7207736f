//! Transcript errors and the replay mismatch report.

use serde::{Deserialize, Serialize};
use std::fmt;
use vatworks_core::{CoreError, DeliveryNum, VatId};
use vatworks_transport::TransportError;

/// How one syscall position compared against the recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyscallStatus {
    /// Matched the recording
    Ok,
    /// Differed from the recording at the same position
    Wrong,
    /// Made by the worker past the end of the recording
    Extra,
    /// Recorded but never made by the worker
    Missing,
    /// Recorded metadata syscall the worker did not make, passed over
    Skipped,
    /// Metadata syscall the recording lacks, answered from the side table
    Simulated,
    /// Mismatch on a recorded error serialization, accepted
    Tolerated,
}

impl SyscallStatus {
    /// Whether this status breaks replay
    #[must_use]
    pub fn is_violation(self) -> bool {
        matches!(self, Self::Wrong | Self::Extra | Self::Missing)
    }

    /// Lowercase name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Wrong => "wrong",
            Self::Extra => "extra",
            Self::Missing => "missing",
            Self::Skipped => "skipped",
            Self::Simulated => "simulated",
            Self::Tolerated => "tolerated",
        }
    }
}

impl fmt::Display for SyscallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One line of the side-by-side replay dump
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionDump {
    /// Syscall index within the delivery
    pub position: usize,
    /// Classification
    pub status: SyscallStatus,
    /// Recorded syscall, canonical JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    /// Syscall the worker made, canonical JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    /// Answer handed to the worker, canonical JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Kind of transcript violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    /// Different syscall at the same position
    Wrong,
    /// Worker made more syscalls than recorded
    Extra,
    /// Worker made fewer syscalls than recorded
    Missing,
    /// Simulated metadata read with nothing recorded for its key
    Unsimulatable,
}

/// A replayed delivery disagreed with its recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptViolation {
    /// Vat being replayed
    pub vat_id: VatId,
    /// Delivery being replayed
    pub delivery_num: DeliveryNum,
    /// First problem seen
    pub kind: ViolationKind,
    /// Syscall position of the first problem
    pub position: usize,
    /// Every position compared so far
    pub dump: Vec<PositionDump>,
}

impl fmt::Display for TranscriptViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replay mismatch in vat {} delivery {}: {:?} syscall at position {}",
            self.vat_id, self.delivery_num, self.kind, self.position
        )?;
        for line in &self.dump {
            write!(f, "\n  #{} {:>9}", line.position, line.status)?;
            if let Some(expected) = &line.expected {
                write!(f, "  expected {}", expected)?;
            }
            if let Some(actual) = &line.actual {
                write!(f, "  got {}", actual)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TranscriptViolation {}

/// Transcript engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    /// Replayed syscalls disagreed with the recording
    #[error("{0}")]
    Violation(Box<TranscriptViolation>),

    /// Worker failed during replay
    #[error("Worker failed during replay: {0}")]
    Transport(#[from] TransportError),

    /// Keeper or store failure
    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),

    /// Span does not have the expected shape
    #[error("Malformed transcript span for {vat_id}: {reason}")]
    BadSpan {
        /// Vat
        vat_id: VatId,
        /// What was wrong
        reason: String,
    },

    /// `finish_delivery` or `record_syscall` without `start_delivery`
    #[error("No delivery in progress for {vat_id}")]
    NoDeliveryInProgress {
        /// Vat
        vat_id: VatId,
    },

    /// Transcript file line could not be parsed
    #[error("Transcript line {line}: {reason}")]
    Parse {
        /// 1-based line number
        line: usize,
        /// What was wrong
        reason: String,
    },

    /// Bad relaxed-syscall key pattern
    #[error("Invalid key pattern {pattern}: {reason}")]
    Pattern {
        /// Pattern text
        pattern: String,
        /// Regex error
        reason: String,
    },

    /// File I/O failure
    #[error("IO error: {reason}")]
    Io {
        /// Underlying error
        reason: String,
    },
}

impl From<TranscriptViolation> for TranscriptError {
    fn from(violation: TranscriptViolation) -> Self {
        Self::Violation(Box::new(violation))
    }
}

impl From<std::io::Error> for TranscriptError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            reason: err.to_string(),
        }
    }
}
