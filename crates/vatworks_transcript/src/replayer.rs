//! Span replay.
//!
//! Brings a fresh worker up to date by re-sending the deliveries of the vat's
//! current transcript span. The worker's syscalls are answered from the
//! recording, never from the kernel.

use crate::error::{TranscriptError, TranscriptViolation};
use crate::simulator::{RelaxedPolicy, ReplayReport, SyscallSimulator, VcSideTable};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use vatworks_core::{
    DeliveryNum, DeliveryResult, SyscallHandler, SyscallRecord, TranscriptDelivery,
    TranscriptEntry, VatDelivery, VatId, VatSyscall, VatSyscallResult,
};
use vatworks_transport::WorkerTransport;

/// Syscall handler that answers from a delivery's recording
#[derive(Debug)]
pub struct ReplayHandler {
    simulator: Mutex<SyscallSimulator>,
}

impl ReplayHandler {
    /// Wrap a comparator
    #[must_use]
    pub fn new(simulator: SyscallSimulator) -> Self {
        Self {
            simulator: Mutex::new(simulator),
        }
    }

    /// Whether a violation has been seen so far
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.simulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_broken()
    }

    /// Close the delivery
    ///
    /// # Errors
    ///
    /// Returns the first violation
    pub fn finish(&self) -> Result<ReplayReport, TranscriptViolation> {
        self.simulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish()
    }
}

impl SyscallHandler for ReplayHandler {
    fn handle(&self, syscall: VatSyscall) -> VatSyscallResult {
        self.simulator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .compare(&syscall)
            .response
    }
}

/// Totals for a replayed span
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySpanReport {
    /// Deliveries re-sent
    pub deliveries: u64,
    /// Last delivery re-sent
    pub last_delivery: Option<DeliveryNum>,
    /// Recorded metadata syscalls passed over
    pub skipped: usize,
    /// Metadata syscalls answered from the side table
    pub simulated: usize,
    /// Error serialization mismatches accepted
    pub tolerated: usize,
    /// Deliveries whose outcome differed from the recorded status
    pub status_mismatches: u64,
}

impl ReplaySpanReport {
    fn add(&mut self, report: &ReplayReport) {
        self.deliveries += 1;
        self.last_delivery = Some(report.delivery_num);
        self.skipped += report.skipped;
        self.simulated += report.simulated;
        self.tolerated += report.tolerated;
    }
}

/// Replays recorded deliveries into a worker
#[derive(Debug, Clone)]
pub struct TranscriptReplayer {
    vat_id: VatId,
    policy: Arc<RelaxedPolicy>,
    side_table: Arc<VcSideTable>,
}

impl TranscriptReplayer {
    /// Replayer for one vat
    #[must_use]
    pub fn new(vat_id: VatId, policy: Arc<RelaxedPolicy>, side_table: Arc<VcSideTable>) -> Self {
        Self {
            vat_id,
            policy,
            side_table,
        }
    }

    /// Vat being replayed
    #[must_use]
    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    /// Comparator for one recorded delivery
    #[must_use]
    pub fn simulator(&self, delivery_num: DeliveryNum, expected: Vec<SyscallRecord>) -> SyscallSimulator {
        SyscallSimulator::new(
            self.vat_id.clone(),
            delivery_num,
            expected,
            self.policy.clone(),
            self.side_table.clone(),
        )
    }

    /// Re-send one delivery and check its syscalls against the recording
    ///
    /// # Errors
    ///
    /// Returns error if the worker fails or its syscalls deviate
    pub async fn replay_delivery(
        &self,
        worker: &dyn WorkerTransport,
        delivery_num: DeliveryNum,
        delivery: &VatDelivery,
        expected: &[SyscallRecord],
    ) -> Result<(ReplayReport, DeliveryResult), TranscriptError> {
        let handler = Arc::new(ReplayHandler::new(self.simulator(delivery_num, expected.to_vec())));
        worker.register_syscall_handler(handler.clone());
        let result = worker.deliver(delivery).await?;
        let report = handler.finish()?;
        Ok((report, result))
    }

    /// Replay a whole span, in order, stopping at the first violation
    ///
    /// # Errors
    ///
    /// Returns error on a malformed span, a worker failure, or a violation
    pub async fn replay_span(
        &self,
        worker: &dyn WorkerTransport,
        span: &[(DeliveryNum, TranscriptEntry)],
    ) -> Result<ReplaySpanReport, TranscriptError> {
        let mut totals = ReplaySpanReport::default();
        for (index, (num, entry)) in span.iter().enumerate() {
            let delivery = match &entry.d {
                TranscriptDelivery::Deliver(delivery) => delivery,
                opener if index == 0 && opener.opens_span() => continue,
                other => {
                    return Err(TranscriptError::BadSpan {
                        vat_id: self.vat_id.clone(),
                        reason: format!("unexpected {} at position {}", other.to_wire()[0], num),
                    });
                }
            };
            let (report, result) = self.replay_delivery(worker, *num, delivery, &entry.sc).await?;
            if result.status_str() != entry.r.status {
                totals.status_mismatches += 1;
                warn!(
                    vat_id = %self.vat_id,
                    delivery_num = num,
                    recorded = %entry.r.status,
                    replayed = result.status_str(),
                    "replayed delivery status differs"
                );
            }
            debug!(vat_id = %self.vat_id, delivery_num = num, "delivery replayed");
            totals.add(&report);
        }
        if totals.deliveries > 0 {
            info!(vat_id = %self.vat_id, deliveries = totals.deliveries, "transcript span replayed");
        }
        Ok(totals)
    }
}
