//! In-process worker.
//!
//! Runs vat code supplied as a [`VatDispatch`] on the caller's runtime. Used
//! for kernel-internal vats and in tests; follows the same contracts as the
//! subprocess worker.

use crate::error::TransportError;
use crate::transport::{InFlight, SnapshotResult, WorkerTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::debug;
use vatworks_core::{
    DeliveryNum, DeliveryResult, SharedSyscallHandler, SnapshotInfo, SyscallHandler, VatDelivery,
    VatId, VatSyscall, VatSyscallResult,
};
use vatworks_storage::SnapshotStore;

/// Vat code running in-process
pub trait VatDispatch: Send {
    /// Handle one delivery, making syscalls through `syscall`
    fn dispatch(&mut self, delivery: &VatDelivery, syscall: &dyn SyscallHandler) -> DeliveryResult;

    /// Serialize the heap, or `None` if this vat cannot snapshot
    fn snapshot(&self) -> Option<Vec<u8>>;
}

struct NoHandler;

impl SyscallHandler for NoHandler {
    fn handle(&self, syscall: VatSyscall) -> VatSyscallResult {
        VatSyscallResult::Error(format!("no syscall handler for {}", syscall.kind()))
    }
}

/// In-process worker transport
pub struct LocalWorker {
    vat_id: VatId,
    dispatch: Mutex<Box<dyn VatDispatch>>,
    handler: RwLock<Option<SharedSyscallHandler>>,
    in_flight: InFlight,
    closed: AtomicBool,
}

impl LocalWorker {
    /// Wrap vat code
    #[must_use]
    pub fn new(vat_id: VatId, dispatch: Box<dyn VatDispatch>) -> Self {
        Self {
            vat_id,
            dispatch: Mutex::new(dispatch),
            handler: RwLock::new(None),
            in_flight: InFlight::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Vat this worker runs
    #[must_use]
    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LocalWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalWorker")
            .field("vat_id", &self.vat_id)
            .field("busy", &self.in_flight.is_busy())
            .finish()
    }
}

#[async_trait]
impl WorkerTransport for LocalWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn register_syscall_handler(&self, handler: SharedSyscallHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn deliver(&self, delivery: &VatDelivery) -> Result<DeliveryResult, TransportError> {
        let _guard = self.in_flight.enter()?;
        self.check_open()?;
        // Give other tasks a chance to observe the busy flag.
        tokio::task::yield_now().await;
        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut dispatch = self.dispatch.lock().await;
        let result = match &handler {
            Some(handler) => dispatch.dispatch(delivery, handler.as_ref()),
            None => dispatch.dispatch(delivery, &NoHandler),
        };
        debug!(vat_id = %self.vat_id, kind = delivery.kind(), status = result.status_str(), "local delivery");
        Ok(result)
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn make_snapshot(
        &self,
        after_delivery_num: DeliveryNum,
        store: &dyn SnapshotStore,
        _restart: bool,
    ) -> Result<SnapshotResult, TransportError> {
        let _guard = self.in_flight.enter()?;
        self.check_open()?;
        let bytes = self
            .dispatch
            .lock()
            .await
            .snapshot()
            .ok_or(TransportError::SnapshotsUnsupported)?;
        let saved = store.save_snapshot(&self.vat_id, after_delivery_num, &bytes)?;
        Ok(SnapshotResult {
            info: SnapshotInfo {
                hash: saved.hash,
                end_pos: after_delivery_num,
            },
            saved,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
