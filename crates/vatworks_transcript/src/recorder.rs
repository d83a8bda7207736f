//! Transcript recording for live deliveries.

use crate::error::TranscriptError;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};
use vatworks_core::{
    DeliveryNum, DeliveryResult, SharedSyscallHandler, SyscallHandler, SyscallRecord,
    TranscriptEntry, VatDelivery, VatId, VatSyscall, VatSyscallResult,
};
use vatworks_storage::KernelKeeper;

#[derive(Debug)]
struct Pending {
    delivery: VatDelivery,
    syscalls: Vec<SyscallRecord>,
}

/// Collects the syscalls of the delivery in progress and appends the
/// finished entry to the vat's transcript
pub struct TranscriptRecorder {
    vat_id: VatId,
    keeper: Arc<dyn KernelKeeper>,
    enabled: bool,
    current: Mutex<Option<Pending>>,
}

impl TranscriptRecorder {
    /// Recorder for a vat; `enabled` is false for vats without a transcript
    #[must_use]
    pub fn new(vat_id: VatId, keeper: Arc<dyn KernelKeeper>, enabled: bool) -> Self {
        Self {
            vat_id,
            keeper,
            enabled,
            current: Mutex::new(None),
        }
    }

    /// Whether finished deliveries are appended
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Begin collecting syscalls for a delivery
    ///
    /// # Errors
    ///
    /// Returns error if another delivery is still open
    pub fn start_delivery(&self, delivery: &VatDelivery) -> Result<(), TranscriptError> {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if current.is_some() {
            return Err(TranscriptError::BadSpan {
                vat_id: self.vat_id.clone(),
                reason: "delivery started while another is open".to_string(),
            });
        }
        *current = Some(Pending {
            delivery: delivery.clone(),
            syscalls: Vec::new(),
        });
        Ok(())
    }

    /// Record one syscall and its answer
    pub fn record_syscall(&self, syscall: VatSyscall, result: VatSyscallResult) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        match current.as_mut() {
            Some(pending) => {
                trace!(vat_id = %self.vat_id, kind = syscall.kind(), "syscall recorded");
                pending.syscalls.push(SyscallRecord::new(syscall, result));
            }
            None => debug!(vat_id = %self.vat_id, kind = syscall.kind(), "syscall outside delivery"),
        }
    }

    /// Close the open delivery and append it, returning its position
    ///
    /// # Errors
    ///
    /// Returns error if no delivery is open or the keeper rejects the entry
    pub fn finish_delivery(&self, result: &DeliveryResult) -> Result<Option<DeliveryNum>, TranscriptError> {
        let pending = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TranscriptError::NoDeliveryInProgress {
                vat_id: self.vat_id.clone(),
            })?;
        if !self.enabled {
            return Ok(None);
        }
        let syscall_count = pending.syscalls.len();
        let entry = TranscriptEntry::delivery(pending.delivery, pending.syscalls, result);
        let pos = self.keeper.append_transcript(&self.vat_id, entry)?;
        debug!(vat_id = %self.vat_id, delivery_num = pos, syscall_count, "delivery recorded");
        Ok(Some(pos))
    }

    /// Drop the open delivery without recording it
    pub fn abandon_delivery(&self) {
        if self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            debug!(vat_id = %self.vat_id, "delivery abandoned");
        }
    }
}

impl std::fmt::Debug for TranscriptRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptRecorder")
            .field("vat_id", &self.vat_id)
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// Syscall handler that forwards to the kernel and records each exchange
pub struct RecordingSyscallHandler {
    inner: SharedSyscallHandler,
    recorder: Arc<TranscriptRecorder>,
}

impl RecordingSyscallHandler {
    /// Wrap a kernel syscall handler
    #[must_use]
    pub fn new(inner: SharedSyscallHandler, recorder: Arc<TranscriptRecorder>) -> Self {
        Self { inner, recorder }
    }
}

impl SyscallHandler for RecordingSyscallHandler {
    fn handle(&self, syscall: VatSyscall) -> VatSyscallResult {
        let result = self.inner.handle(syscall.clone());
        self.recorder.record_syscall(syscall, result.clone());
        result
    }
}
