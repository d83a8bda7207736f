//! Warehouse errors.

use vatworks_core::{CoreError, VatId};
use vatworks_transcript::TranscriptError;
use vatworks_transport::TransportError;

/// Warehouse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    /// A committed transcript failed to replay; the warehouse refuses
    /// further work
    #[error("Kernel panic: {reason}")]
    Panicked {
        /// What went wrong
        reason: String,
    },

    /// The keeper has no record of the vat
    #[error("Unknown vat: {vat_id}")]
    UnknownVat {
        /// Vat
        vat_id: VatId,
    },

    /// The vat has been terminated
    #[error("Vat {vat_id} is dead")]
    DeadVat {
        /// Vat
        vat_id: VatId,
    },

    /// Worker failure
    #[error("Worker error: {0}")]
    Transport(#[from] TransportError),

    /// Recording failure
    #[error("Transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    /// Keeper, bundle or snapshot store failure
    #[error("Storage error: {0}")]
    Storage(#[from] CoreError),
}

impl WarehouseError {
    /// Whether this error left the warehouse unusable
    #[must_use]
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked { .. })
    }
}
