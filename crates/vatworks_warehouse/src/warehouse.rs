//! The vat warehouse.
//!
//! Owns the online vats. `deliver_to_vat` brings a vat online if needed,
//! records the delivery and its syscalls, and reports the result unchanged.
//! Reactivation replays the transcript span recorded since the latest
//! snapshot; a committed transcript that fails to replay is corruption, so
//! the warehouse panics and refuses further work.

use crate::error::WarehouseError;
use crate::lru::Lru;
use crate::policy::{SnapshotPolicy, WarehousePolicy};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use vatworks_core::{
    BundleId, DeliveryResult, InitializeWorkerOptions, SharedSyscallHandler, TranscriptDelivery,
    TranscriptEntry, VatDelivery, VatId,
};
use vatworks_storage::{BundleHandler, KernelKeeper, SnapshotStore, VatOptions, VatRecord};
use vatworks_transcript::{
    RecordingSyscallHandler, RelaxedPolicy, TranscriptRecorder, TranscriptReplayer, VcSideTable,
};
use vatworks_transport::{TransportError, WorkerFactory, WorkerSpec, WorkerTransport};

/// Supplies the kernel's syscall handler for a vat
pub trait KernelSyscalls: Send + Sync {
    /// Handler answering live syscalls of `vat_id`
    fn handler_for(&self, vat_id: &VatId) -> SharedSyscallHandler;
}

impl<F> KernelSyscalls for F
where
    F: Fn(&VatId) -> SharedSyscallHandler + Send + Sync,
{
    fn handler_for(&self, vat_id: &VatId) -> SharedSyscallHandler {
        self(vat_id)
    }
}

struct OnlineVat {
    worker: Arc<dyn WorkerTransport>,
    recorder: Arc<TranscriptRecorder>,
}

/// Bounded pool of online vats
pub struct VatWarehouse {
    keeper: Arc<dyn KernelKeeper>,
    bundles: Arc<dyn BundleHandler>,
    store: Arc<dyn SnapshotStore>,
    factory: Arc<dyn WorkerFactory>,
    kernel: Arc<dyn KernelSyscalls>,
    policy: WarehousePolicy,
    relaxed: Arc<RelaxedPolicy>,
    online: HashMap<VatId, OnlineVat>,
    lru: Lru<VatId>,
    panicked: Option<String>,
}

impl VatWarehouse {
    /// Create a warehouse
    ///
    /// # Errors
    ///
    /// Returns error if the relaxed syscall key pattern is invalid
    pub fn new(
        keeper: Arc<dyn KernelKeeper>,
        bundles: Arc<dyn BundleHandler>,
        store: Arc<dyn SnapshotStore>,
        factory: Arc<dyn WorkerFactory>,
        kernel: Arc<dyn KernelSyscalls>,
        policy: WarehousePolicy,
    ) -> Result<Self, WarehouseError> {
        let relaxed = Arc::new(RelaxedPolicy::new(policy.relaxed_syscalls.clone())?);
        Ok(Self {
            keeper,
            bundles,
            store,
            factory,
            kernel,
            lru: Lru::new(policy.max_vats_online),
            policy,
            relaxed,
            online: HashMap::new(),
            panicked: None,
        })
    }

    /// Settings
    #[must_use]
    pub fn policy(&self) -> &WarehousePolicy {
        &self.policy
    }

    /// Reason for the panic, if the warehouse has panicked
    #[must_use]
    pub fn panic_reason(&self) -> Option<&str> {
        self.panicked.as_deref()
    }

    fn check_alive(&self) -> Result<(), WarehouseError> {
        match &self.panicked {
            Some(reason) => Err(WarehouseError::Panicked {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn panic(&mut self, reason: String) -> WarehouseError {
        error!(reason = %reason, "kernel panic");
        self.panicked = Some(reason.clone());
        WarehouseError::Panicked { reason }
    }

    /// Bring static vats, then dynamic ones, online up to half the bound
    ///
    /// # Errors
    ///
    /// Returns error if any preloaded vat fails to come online
    pub async fn start(&mut self) -> Result<(), WarehouseError> {
        self.check_alive()?;
        let limit = self.policy.preload_limit();
        let bundle_count = self.bundles.current_bundle_ids().len();
        let preload: Vec<VatId> = self
            .keeper
            .static_vat_ids()
            .into_iter()
            .chain(self.keeper.dynamic_vat_ids())
            .take(limit)
            .collect();
        info!(preload = preload.len(), limit, bundle_count, "starting vat warehouse");
        for vat_id in &preload {
            self.ensure_online(vat_id).await?;
        }
        Ok(())
    }

    /// Register a new dynamic vat and bring it online
    ///
    /// # Errors
    ///
    /// Returns error if the vat already exists or fails to start
    pub async fn create_dynamic_vat(
        &mut self,
        vat_id: &VatId,
        source: BundleId,
        options: VatOptions,
    ) -> Result<Arc<dyn WorkerTransport>, WarehouseError> {
        self.check_alive()?;
        self.keeper.add_vat(
            vat_id,
            VatRecord {
                source,
                options,
                dynamic: true,
            },
        )?;
        info!(vat_id = %vat_id, "dynamic vat created");
        self.ensure_online(vat_id).await
    }

    /// Worker of an online vat, without activating it
    #[must_use]
    pub fn lookup(&self, vat_id: &VatId) -> Option<Arc<dyn WorkerTransport>> {
        self.online.get(vat_id).map(|vat| vat.worker.clone())
    }

    /// Online vats, least recently used first
    #[must_use]
    pub fn active_vats(&self) -> Vec<VatId> {
        self.lru
            .iter()
            .filter(|id| self.online.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Worker for a vat, activating it if offline
    ///
    /// # Errors
    ///
    /// Returns error if the vat is unknown or dead, or the worker cannot be
    /// built; replay failure panics the warehouse
    pub async fn ensure_online(&mut self, vat_id: &VatId) -> Result<Arc<dyn WorkerTransport>, WarehouseError> {
        self.check_alive()?;
        if let Some(vat) = self.online.get(vat_id) {
            return Ok(vat.worker.clone());
        }
        if !self.keeper.vat_is_alive(vat_id) {
            return Err(match self.keeper.vat_record(vat_id) {
                Ok(_) => WarehouseError::DeadVat {
                    vat_id: vat_id.clone(),
                },
                Err(_) => WarehouseError::UnknownVat {
                    vat_id: vat_id.clone(),
                },
            });
        }

        if let Some(evicted) = self.lru.touch(vat_id.clone()) {
            self.evict(&evicted).await;
        }
        match self.activate(vat_id).await {
            Ok(worker) => Ok(worker),
            Err(err) => {
                self.lru.remove(vat_id);
                Err(err)
            }
        }
    }

    async fn activate(&mut self, vat_id: &VatId) -> Result<Arc<dyn WorkerTransport>, WarehouseError> {
        let record = self.keeper.vat_record(vat_id)?;
        let spec = match self.keeper.snapshot_info(vat_id) {
            Some(info) => {
                debug!(vat_id = %vat_id, hash = %info.hash, end_pos = info.end_pos, "starting worker from snapshot");
                WorkerSpec::from_snapshot(vat_id.clone(), self.store.load_by_hash(&info.hash)?)
            }
            None => {
                let bundle = self.bundles.bundle(&record.source)?;
                WorkerSpec::from_bundle(vat_id.clone(), bundle, record.options.vat_parameters.clone())
            }
        };
        let worker: Arc<dyn WorkerTransport> = Arc::from(self.factory.create(spec).await?);

        if record.options.use_transcript {
            let span = self.keeper.transcript_span(vat_id)?;
            if span.is_empty() {
                let options = InitializeWorkerOptions {
                    bundle_id: Some(record.source.clone()),
                    worker_kind: None,
                    incarnation: self.keeper.incarnation(vat_id)?,
                };
                self.keeper.append_transcript(
                    vat_id,
                    TranscriptEntry::pseudo(TranscriptDelivery::InitializeWorker(options)),
                )?;
            } else {
                let replayer = TranscriptReplayer::new(vat_id.clone(), self.relaxed.clone(), Arc::new(VcSideTable::new()));
                if let Err(err) = replayer.replay_span(worker.as_ref(), &span).await {
                    if let Err(close_err) = worker.close().await {
                        warn!(vat_id = %vat_id, error = %close_err, "closing worker after failed replay");
                    }
                    return Err(self.panic(format!("vat {} failed to replay its transcript: {}", vat_id, err)));
                }
            }
        }

        let recorder = Arc::new(TranscriptRecorder::new(
            vat_id.clone(),
            self.keeper.clone(),
            record.options.use_transcript,
        ));
        let handler = RecordingSyscallHandler::new(self.kernel.handler_for(vat_id), recorder.clone());
        worker.register_syscall_handler(Arc::new(handler));
        self.online.insert(
            vat_id.clone(),
            OnlineVat {
                worker: worker.clone(),
                recorder,
            },
        );
        info!(vat_id = %vat_id, pid = ?worker.pid(), online = self.online.len(), "vat online");
        Ok(worker)
    }

    async fn evict(&mut self, vat_id: &VatId) -> bool {
        self.lru.remove(vat_id);
        let Some(vat) = self.online.remove(vat_id) else {
            return false;
        };
        vat.recorder.abandon_delivery();
        if let Err(err) = vat.worker.close().await {
            warn!(vat_id = %vat_id, error = %err, "error closing evicted worker");
        }
        debug!(vat_id = %vat_id, "vat evicted");
        true
    }

    async fn worker_failed(&mut self, vat_id: &VatId, err: TransportError) -> WarehouseError {
        if err.is_worker_death() {
            warn!(vat_id = %vat_id, error = %err, "worker died");
            self.evict(vat_id).await;
        }
        err.into()
    }

    /// Run one delivery and record it
    ///
    /// # Errors
    ///
    /// Returns error if the vat cannot be brought online or its worker fails;
    /// vat-level failures come back as an `error` result
    pub async fn deliver_to_vat(
        &mut self,
        vat_id: &VatId,
        delivery: &VatDelivery,
    ) -> Result<DeliveryResult, WarehouseError> {
        let worker = self.ensure_online(vat_id).await?;
        self.lru.touch(vat_id.clone());
        let recorder = match self.online.get(vat_id) {
            Some(vat) => vat.recorder.clone(),
            None => {
                return Err(WarehouseError::UnknownVat {
                    vat_id: vat_id.clone(),
                });
            }
        };

        recorder.start_delivery(delivery)?;
        match worker.deliver(delivery).await {
            Ok(result) => {
                let pos = recorder.finish_delivery(&result)?;
                debug!(vat_id = %vat_id, delivery_num = ?pos, kind = delivery.kind(), status = result.status_str(), "delivered");
                Ok(result)
            }
            Err(err) => {
                recorder.abandon_delivery();
                Err(self.worker_failed(vat_id, err).await)
            }
        }
    }

    /// Checkpoint the vat if its snapshot schedule says so, returning
    /// whether a snapshot was made
    ///
    /// An evicted vat is brought back online first. A `bringOutYourDead`
    /// delivery runs before the snapshot so the heap is collected.
    ///
    /// # Errors
    ///
    /// Returns error if the vat cannot be brought online, or if the cleanup
    /// delivery or the snapshot fails
    pub async fn maybe_save_snapshot(&mut self, vat_id: &VatId) -> Result<bool, WarehouseError> {
        let worker = self.ensure_online(vat_id).await?;
        if !worker.supports_snapshots() || !self.keeper.vat_record(vat_id)?.options.use_transcript {
            return Ok(false);
        }
        let has_snapshot = self.keeper.snapshot_info(vat_id).is_some();
        let span_deliveries = self.keeper.transcript_span_deliveries(vat_id)?;
        let Some(reason) = SnapshotPolicy::from_keeper(self.keeper.as_ref()).due(span_deliveries, has_snapshot) else {
            return Ok(false);
        };

        self.deliver_to_vat(vat_id, &VatDelivery::BringOutYourDead).await?;
        let end_pos = self.keeper.next_delivery_num(vat_id)?;
        let snapshot = match worker
            .make_snapshot(end_pos, self.store.as_ref(), self.policy.restart_worker_on_snapshot)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(err) => return Err(self.worker_failed(vat_id, err).await),
        };
        self.keeper.record_snapshot(vat_id, snapshot.info)?;
        info!(
            vat_id = %vat_id,
            ?reason,
            end_pos,
            hash = %snapshot.info.hash,
            bytes = snapshot.saved.raw_byte_count,
            pid = ?worker.pid(),
            "snapshot saved"
        );
        Ok(true)
    }

    /// Keep a vat online under memory pressure, activating it if needed
    ///
    /// # Errors
    ///
    /// Returns error if the vat cannot be brought online
    pub async fn pin_vat(&mut self, vat_id: &VatId) -> Result<(), WarehouseError> {
        self.ensure_online(vat_id).await?;
        self.lru.pin(vat_id.clone());
        Ok(())
    }

    /// Make a pinned vat evictable again
    pub fn unpin_vat(&mut self, vat_id: &VatId) {
        self.lru.unpin(vat_id);
    }

    /// Change the delivery interval between snapshots
    pub fn set_snapshot_interval(&self, interval: u64) {
        self.keeper.set_snapshot_interval(interval);
    }

    /// Stop the vat's worker and open a fresh incarnation, returning its
    /// number
    ///
    /// # Errors
    ///
    /// Returns error if the keeper has no record of the vat
    pub async fn begin_new_worker_incarnation(&mut self, vat_id: &VatId) -> Result<u64, WarehouseError> {
        self.check_alive()?;
        self.evict(vat_id).await;
        let incarnation = self.keeper.begin_new_incarnation(vat_id)?;
        info!(vat_id = %vat_id, incarnation, "new worker incarnation");
        Ok(incarnation)
    }

    /// Take the vat offline if it is online, returning whether it was
    pub async fn stop_worker(&mut self, vat_id: &VatId) -> bool {
        self.evict(vat_id).await
    }

    /// Close every online worker
    pub async fn shutdown(&mut self) {
        let vats: Vec<VatId> = self.online.keys().cloned().collect();
        for vat_id in &vats {
            self.evict(vat_id).await;
        }
        info!(closed = vats.len(), "vat warehouse shut down");
    }
}

impl std::fmt::Debug for VatWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VatWarehouse")
            .field("online", &self.active_vats())
            .field("policy", &self.policy)
            .field("panicked", &self.panicked)
            .finish_non_exhaustive()
    }
}
