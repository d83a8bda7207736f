//! The worker transport contract.

use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use vatworks_core::{
    DeliveryNum, DeliveryResult, SharedSyscallHandler, SnapshotInfo, VatDelivery,
};
use vatworks_storage::{SavedSnapshot, SnapshotStore};

/// Outcome of [`WorkerTransport::make_snapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    /// Hash and position of the checkpoint
    pub info: SnapshotInfo,
    /// What the store reported
    pub saved: SavedSnapshot,
}

/// One live vat worker
///
/// At most one `deliver` or `make_snapshot` may be outstanding at a time; a
/// second call fails immediately with [`TransportError::DeliveryInFlight`].
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// OS process id, if the worker is a process
    fn pid(&self) -> Option<u32>;

    /// Install the handler invoked for every syscall the worker makes
    fn register_syscall_handler(&self, handler: SharedSyscallHandler);

    /// Run one delivery to completion
    ///
    /// # Errors
    ///
    /// Returns error if the worker dies or misbehaves, or a delivery is
    /// already in flight. Vat-level failures are an `error` result, not an
    /// `Err`.
    async fn deliver(&self, delivery: &VatDelivery) -> Result<DeliveryResult, TransportError>;

    /// Whether [`make_snapshot`](Self::make_snapshot) is available
    fn supports_snapshots(&self) -> bool;

    /// Capture the heap after `after_delivery_num` into `store`; with
    /// `restart`, replace the running worker with one loaded from the same
    /// bytes
    ///
    /// # Errors
    ///
    /// Returns error if snapshots are unsupported, the worker dies, or the
    /// store fails
    async fn make_snapshot(
        &self,
        after_delivery_num: DeliveryNum,
        store: &dyn SnapshotStore,
        restart: bool,
    ) -> Result<SnapshotResult, TransportError>;

    /// Release the worker; safe to call more than once
    ///
    /// # Errors
    ///
    /// Returns error if the worker task could not be joined
    async fn close(&self) -> Result<(), TransportError>;
}

/// Non-reentrancy flag shared by transport implementations
#[derive(Debug, Default)]
pub struct InFlight(AtomicBool);

impl InFlight {
    /// Create an idle flag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the worker for one operation
    ///
    /// # Errors
    ///
    /// Returns error if an operation is already outstanding
    pub fn enter(&self) -> Result<InFlightGuard<'_>, TransportError> {
        if self.0.swap(true, Ordering::AcqRel) {
            return Err(TransportError::DeliveryInFlight);
        }
        Ok(InFlightGuard(&self.0))
    }

    /// Whether an operation is outstanding
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Clears the in-flight flag on drop, including when a delivery future is
/// dropped before completion
#[derive(Debug)]
pub struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_guard() {
        let flag = InFlight::new();
        {
            let _guard = flag.enter().unwrap();
            assert!(flag.is_busy());
            assert_eq!(flag.enter().unwrap_err(), TransportError::DeliveryInFlight);
        }
        assert!(!flag.is_busy());
        assert!(flag.enter().is_ok());
    }
}
