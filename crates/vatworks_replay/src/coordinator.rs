//! Lockstep multi-replica replay.
//!
//! Streams a transcript file and feeds every delivery to every live replica
//! concurrently. Replicas start from the vat's bundle or from snapshots, and
//! new replicas are spawned from snapshots taken along the way, so one run
//! compares workers with many different heap histories.

use crate::activity::{ActivityKind, ActivityRecord, SnapshotActivityLog};
use crate::config::ReplayConfig;
use crate::divergence::detect_divergence;
use crate::error::ReplayError;
use crate::keep::{KeepCandidate, KeepPolicy};
use crate::summary::{HashMismatch, ReplicaId, ReplicaStats, ReplaySummary, ViolationRecord};
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tracing::{debug, error, info, warn};
use vatworks_core::{DeliveryNum, SnapshotHash, SyscallRecord, VatDelivery, VatId};
use vatworks_storage::{BundleHandler, SnapshotStore};
use vatworks_transcript::{
    PositionDump, RelaxedPolicy, TranscriptError, TranscriptFileReader, TranscriptLine,
    TranscriptReplayer, VcSideTable,
};
use vatworks_transport::{WorkerFactory, WorkerSpec, WorkerTransport};

struct Replica {
    id: ReplicaId,
    worker: Box<dyn WorkerTransport>,
    loaded_from: Option<SnapshotHash>,
    keep: bool,
    stats: ReplicaStats,
}

impl Replica {
    fn candidate(&self) -> KeepCandidate {
        KeepCandidate {
            keep: self.keep,
            first_delivery: self.stats.start_delivery,
        }
    }
}

/// Drives a set of replicas through one transcript
pub struct ReplayCoordinator {
    config: ReplayConfig,
    transcript_file: String,
    factory: Arc<dyn WorkerFactory>,
    store: Arc<dyn SnapshotStore>,
    bundles: Option<Arc<dyn BundleHandler>>,
    policy: Arc<RelaxedPolicy>,
    side_table: Arc<VcSideTable>,
    keep_policy: KeepPolicy,
    activity: Option<SnapshotActivityLog>,
    vat_id: VatId,
    replicas: Vec<Replica>,
    next_replica: u64,
    snapshot_overrides: HashMap<SnapshotHash, SnapshotHash>,
    start_delivery: Option<DeliveryNum>,
    last_delivery: DeliveryNum,
    summary: ReplaySummary,
}

impl ReplayCoordinator {
    /// Create a coordinator for one transcript
    ///
    /// `transcript_file` only labels activity log records.
    ///
    /// # Errors
    ///
    /// Returns error if the options are inconsistent or the activity log
    /// cannot be opened
    pub fn new(
        config: ReplayConfig,
        transcript_file: impl Into<String>,
        factory: Arc<dyn WorkerFactory>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, ReplayError> {
        config.validate()?;
        let policy = RelaxedPolicy::new(config.relaxed_syscalls())?;
        let activity = config
            .snapshot_activity_log
            .as_ref()
            .map(SnapshotActivityLog::open)
            .transpose()?;
        Ok(Self {
            keep_policy: KeepPolicy::from_config(&config),
            config,
            transcript_file: transcript_file.into(),
            factory,
            store,
            bundles: None,
            policy: Arc::new(policy),
            side_table: Arc::new(VcSideTable::new()),
            activity,
            vat_id: VatId::new("unknown"),
            replicas: Vec::new(),
            next_replica: 0,
            snapshot_overrides: HashMap::new(),
            start_delivery: None,
            last_delivery: 0,
            summary: ReplaySummary::default(),
        })
    }

    /// Resolve `sourceBundleID` references through `bundles`
    #[must_use]
    pub fn with_bundles(mut self, bundles: Arc<dyn BundleHandler>) -> Self {
        self.bundles = Some(bundles);
        self
    }

    /// Number of live replicas
    #[must_use]
    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Replay the whole transcript
    ///
    /// Every replica is closed before returning, whether or not the run
    /// succeeded.
    ///
    /// # Errors
    ///
    /// Returns the first fatal problem: a malformed transcript, a worker
    /// failure, or a violation, divergence or hash mismatch the options do
    /// not ignore
    pub async fn run<R: AsyncRead + Unpin>(
        mut self,
        mut reader: TranscriptFileReader<R>,
    ) -> Result<ReplaySummary, ReplayError> {
        let outcome = self.process(&mut reader).await;
        self.summary.lines_read = reader.line_no();
        let retired: Vec<Replica> = self.replicas.drain(..).collect();
        for replica in retired {
            self.close_replica(replica).await;
        }
        outcome?;
        info!(
            deliveries = self.summary.deliveries_replayed,
            violations = self.summary.violations.len(),
            divergences = self.summary.divergences.len(),
            "replay finished"
        );
        Ok(self.summary)
    }

    async fn process<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut TranscriptFileReader<R>,
    ) -> Result<(), ReplayError> {
        while let Some((line_no, line)) = reader.next_line().await? {
            match line {
                TranscriptLine::HeapSnapshotLoad { vat_id, snapshot_id } => {
                    if let Some(vat_id) = vat_id {
                        self.vat_id = vat_id;
                    }
                    self.load_snapshot(snapshot_id, self.config.keep_worker_explicit_load)
                        .await?;
                }
                TranscriptLine::CreateVat {
                    vat_id,
                    source_bundle_id,
                    vat_source_bundle,
                    vat_parameters,
                } if self.replicas.is_empty() => {
                    if let Some(vat_id) = vat_id {
                        self.vat_id = vat_id;
                    }
                    let bundle = match (vat_source_bundle, source_bundle_id, &self.bundles) {
                        (Some(bundle), _, _) => Arc::new(bundle),
                        (None, Some(id), Some(bundles)) => bundles.bundle(&id)?,
                        _ => {
                            return Err(ReplayError::BadTranscript {
                                line: line_no,
                                reason: "create-vat has no resolvable source bundle".to_string(),
                            });
                        }
                    };
                    self.create_from_bundle(bundle, vat_parameters).await?;
                }
                other if self.replicas.is_empty() => {
                    return Err(ReplayError::BadTranscript {
                        line: line_no,
                        reason: format!(
                            "expected create-vat or heap-snapshot-load before {}",
                            other.kind()
                        ),
                    });
                }
                TranscriptLine::CreateVat { .. } => {
                    return Err(ReplayError::BadTranscript {
                        line: line_no,
                        reason: "create-vat after replay started".to_string(),
                    });
                }
                TranscriptLine::HeapSnapshotSave { snapshot_id } => {
                    self.save_snapshot(snapshot_id).await?;
                }
                TranscriptLine::Delivery {
                    transcript_num,
                    d,
                    syscalls,
                } => {
                    self.replay_delivery(transcript_num, &d, &syscalls).await?;
                }
            }
        }
        Ok(())
    }

    async fn create_from_bundle(&mut self, bundle: Arc<Value>, vat_parameters: Value) -> Result<(), ReplayError> {
        let spec = WorkerSpec::from_bundle(self.vat_id.clone(), bundle, vat_parameters);
        let worker = self.factory.create(spec).await?;
        let id = self.add_replica(worker, None, self.config.keep_worker_explicit_load);
        info!(replica = %id, vat_id = %self.vat_id, "replica created from bundle");
        self.log_activity(id, ActivityKind::Create, None, None, None, None)?;
        Ok(())
    }

    fn add_replica(
        &mut self,
        worker: Box<dyn WorkerTransport>,
        loaded_from: Option<SnapshotHash>,
        keep: bool,
    ) -> ReplicaId {
        let id = ReplicaId(self.next_replica);
        self.next_replica += 1;
        let stats = ReplicaStats::new(id, worker.pid());
        self.replicas.push(Replica {
            id,
            worker,
            loaded_from,
            keep,
            stats,
        });
        id
    }

    async fn close_replica(&mut self, replica: Replica) {
        if let Err(e) = replica.worker.close().await {
            warn!(replica = %replica.id, error = %e, "closing replica failed");
        }
        info!(
            replica = %replica.id,
            pid = ?replica.stats.pid,
            start_delivery = ?replica.stats.start_delivery,
            deliveries_up = replica.stats.deliveries_up,
            time_total_ms = replica.stats.delivery_time_total.as_millis() as u64,
            time_since_snapshot_ms = replica.stats.delivery_time_since_snapshot.as_millis() as u64,
            "replica shut down"
        );
        self.summary.replicas.push(replica.stats);
    }

    fn replica_by_id(&self, id: ReplicaId) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == id)
    }

    fn log_activity(
        &self,
        id: ReplicaId,
        kind: ActivityKind,
        transcript_num: Option<DeliveryNum>,
        snapshot_id: Option<SnapshotHash>,
        save_snapshot_id: Option<SnapshotHash>,
        load_snapshot_id: Option<SnapshotHash>,
    ) -> Result<(), ReplayError> {
        let Some(log) = &self.activity else {
            return Ok(());
        };
        log.append(&ActivityRecord {
            transcript_file: self.transcript_file.clone(),
            kind,
            pid: self.replica_by_id(id).and_then(|r| r.stats.pid),
            vat_id: self.vat_id.clone(),
            transcript_num,
            snapshot_id,
            save_snapshot_id,
            load_snapshot_id,
        })
    }

    /// Retire unprotected replicas, then start one from `hash` unless a live
    /// replica already came from the same snapshot
    async fn load_snapshot(&mut self, hash: SnapshotHash, keep: bool) -> Result<(), ReplayError> {
        let candidates: Vec<KeepCandidate> = self.replicas.iter().map(Replica::candidate).collect();
        let start = self.start_delivery.unwrap_or(0);
        let retire = self.keep_policy.retire(&candidates, start);
        for idx in retire.into_iter().rev() {
            let replica = self.replicas.remove(idx);
            self.close_replica(replica).await;
        }

        let load_hash = self.snapshot_overrides.get(&hash).copied().unwrap_or(hash);
        if let Some(existing) = self
            .replicas
            .iter_mut()
            .find(|r| r.loaded_from == Some(load_hash))
        {
            existing.keep |= keep;
            debug!(replica = %existing.id, snapshot = %load_hash, "replica for snapshot already running");
            return Ok(());
        }

        let bytes = self.store.load_by_hash(&load_hash)?;
        let worker = self
            .factory
            .create(WorkerSpec::from_snapshot(self.vat_id.clone(), bytes))
            .await?;
        let id = self.add_replica(worker, Some(load_hash), keep);
        info!(replica = %id, snapshot = %load_hash, keep, "replica created from snapshot");
        self.log_activity(id, ActivityKind::Load, None, Some(hash), None, Some(load_hash))?;
        Ok(())
    }

    /// Snapshot every replica concurrently; `None` for replicas that cannot
    async fn snapshot_all(&mut self, after: DeliveryNum) -> Result<Vec<(ReplicaId, Option<SnapshotHash>)>, ReplayError> {
        let store = self.store.as_ref();
        let results = join_all(self.replicas.iter().map(|replica| async move {
            if replica.worker.supports_snapshots() {
                replica
                    .worker
                    .make_snapshot(after, store, false)
                    .await
                    .map(|result| Some(result.info.hash))
            } else {
                Ok(None)
            }
        }))
        .await;

        let mut hashes = Vec::with_capacity(results.len());
        for (replica, result) in self.replicas.iter_mut().zip(results) {
            let hash = result?;
            if hash.is_some() {
                replica.stats.delivery_time_since_snapshot = Duration::ZERO;
            }
            hashes.push((replica.id, hash));
        }
        Ok(hashes)
    }

    async fn save_snapshot(&mut self, recorded: SnapshotHash) -> Result<(), ReplayError> {
        let after = self.last_delivery;
        let saved = self.snapshot_all(after).await?;
        let mut unique: Vec<SnapshotHash> = Vec::new();
        let mut mismatched = false;

        for (id, hash) in &saved {
            let Some(hash) = *hash else { continue };
            self.log_activity(*id, ActivityKind::Save, Some(after), Some(hash), Some(recorded), None)?;
            if hash != recorded {
                mismatched = true;
                warn!(replica = %id, expected = %recorded, actual = %hash, "snapshot hash does not match");
                if !self.config.ignore_snapshot_hash_difference {
                    return Err(ReplayError::SnapshotHashMismatch {
                        expected: recorded.to_hex(),
                        actual: hash.to_hex(),
                        replica: id.to_string(),
                    });
                }
            } else {
                debug!(replica = %id, snapshot = %hash, "snapshot matches recording");
            }
            if !unique.contains(&hash) {
                unique.push(hash);
            }
        }
        if mismatched {
            self.summary.hash_mismatches.push(HashMismatch {
                delivery_num: after,
                expected: Some(recorded),
                actual: unique.clone(),
            });
        }

        let has_unsupported = saved.iter().any(|(_, hash)| hash.is_none());
        let mut divergent = unique.len() + usize::from(has_unsupported && !unique.is_empty()) > 1;
        let first = saved.first().and_then(|(_, hash)| *hash);
        if !unique.contains(&recorded) && (divergent || first.is_some()) {
            divergent = true;
            // Later loads of the recorded snapshot get this run's heap instead
            if let Some(first) = first {
                self.snapshot_overrides.insert(recorded, first);
            }
        }

        if self.config.forced_reload_from_snapshot {
            let keep = self.config.keep_worker_hash_difference && divergent;
            for hash in &unique {
                self.load_snapshot(*hash, keep).await?;
            }
            // Replicas started above hold these heaps now
            self.maybe_delete(&unique, divergent)?;
        }
        Ok(())
    }

    fn maybe_delete(&self, hashes: &[SnapshotHash], divergent: bool) -> Result<(), ReplayError> {
        if self.config.keep_no_snapshots || (!divergent && !self.config.keep_all_snapshots) {
            for hash in hashes {
                self.store.delete(hash)?;
            }
        }
        Ok(())
    }

    async fn replay_delivery(
        &mut self,
        num: DeliveryNum,
        delivery: &VatDelivery,
        syscalls: &[SyscallRecord],
    ) -> Result<(), ReplayError> {
        self.last_delivery = num;
        self.start_delivery.get_or_insert(num);

        let replayer = TranscriptReplayer::new(self.vat_id.clone(), self.policy.clone(), self.side_table.clone());
        let outcomes = join_all(self.replicas.iter().map(|replica| {
            let replayer = &replayer;
            async move {
                let started = Instant::now();
                let outcome = replayer
                    .replay_delivery(replica.worker.as_ref(), num, delivery, syscalls)
                    .await;
                (started.elapsed(), outcome)
            }
        }))
        .await;

        let mut dumps: Vec<(ReplicaId, Vec<PositionDump>)> = Vec::with_capacity(outcomes.len());
        let mut first_violation = None;
        for (replica, (elapsed, outcome)) in self.replicas.iter_mut().zip(outcomes) {
            replica.stats.record_delivery(num, elapsed);
            match outcome {
                Ok((report, _result)) => dumps.push((replica.id, report.dump)),
                Err(TranscriptError::Violation(violation)) => {
                    warn!(replica = %replica.id, "{}", violation);
                    self.summary.violations.push(ViolationRecord {
                        replica: replica.id,
                        delivery_num: num,
                        kind: violation.kind,
                        position: violation.position,
                    });
                    dumps.push((replica.id, violation.dump.clone()));
                    first_violation.get_or_insert(violation);
                }
                Err(TranscriptError::Transport(err)) => {
                    error!(replica = %replica.id, pid = ?replica.stats.pid, delivery_num = num, error = %err, "replica worker failed");
                    return Err(err.into());
                }
                Err(other) => return Err(other.into()),
            }
        }
        self.summary.deliveries_replayed += 1;

        if let Some(violation) = first_violation {
            if !self.config.ignore_transcript_violations {
                return Err(TranscriptError::Violation(violation).into());
            }
        }

        let views: Vec<(ReplicaId, &[PositionDump])> =
            dumps.iter().map(|(id, dump)| (*id, dump.as_slice())).collect();
        if let Some(report) = detect_divergence(num, &views) {
            warn!(vat_id = %self.vat_id, "replicas diverged at {}", report);
            self.summary.divergences.push(report);
            if !self.config.ignore_concurrent_worker_divergences {
                return Err(ReplayError::Divergence { delivery_num: num });
            }
        }

        let forced = self.config.forces_snapshot_after(num);
        let mut unique: Vec<SnapshotHash> = Vec::new();
        let mut saved = Vec::new();
        if forced {
            saved = self.snapshot_all(num).await?;
            for (id, hash) in &saved {
                let Some(hash) = *hash else { continue };
                self.log_activity(*id, ActivityKind::Save, Some(num), Some(hash), None, None)?;
                debug!(replica = %id, snapshot = %hash, delivery_num = num, "forced snapshot");
                if !unique.contains(&hash) {
                    unique.push(hash);
                }
            }
        }
        let divergent = unique.len() > 1;
        if divergent {
            let hashes: Vec<String> = unique.iter().map(SnapshotHash::to_hex).collect();
            warn!(delivery_num = num, hashes = %hashes.join(", "), "snapshot hashes do not match each other");
            self.summary.hash_mismatches.push(HashMismatch {
                delivery_num: num,
                expected: None,
                actual: unique.clone(),
            });
            if !self.config.ignore_snapshot_hash_difference {
                return Err(ReplayError::SnapshotHashesDiverge {
                    delivery_num: num,
                    hashes: hashes.join(", "),
                });
            }
        }

        if self.config.forced_reload_from_snapshot && !unique.is_empty() {
            let reload = self.reload_set(&saved, &unique);
            let keep = self.config.keep_worker_hash_difference && divergent;
            for hash in reload {
                self.load_snapshot(hash, keep).await?;
            }
        }

        let scheduled = self.config.load_snapshots.get(&num).cloned().unwrap_or_default();
        for hash in &scheduled {
            let keep = self.config.keep_worker_explicit_load
                || (self.config.keep_worker_hash_difference
                    && (scheduled.len() > 1 || !unique.contains(hash)));
            self.load_snapshot(*hash, keep).await?;
        }

        self.maybe_delete(&unique, divergent)
    }

    /// Snapshots to start replicas from after a forced save
    ///
    /// When protecting divergent workers is off and there are more distinct
    /// hashes than the recent window, prefer hashes from kept replicas, then
    /// the most recently started ones.
    fn reload_set(
        &self,
        saved: &[(ReplicaId, Option<SnapshotHash>)],
        unique: &[SnapshotHash],
    ) -> Vec<SnapshotHash> {
        let limit = self.config.keep_worker_recent;
        if self.config.keep_worker_hash_difference || unique.len() <= limit {
            return unique.to_vec();
        }
        let mut reload: Vec<SnapshotHash> = Vec::new();
        for (id, hash) in saved {
            let kept = self.replica_by_id(*id).is_some_and(|r| r.keep);
            if let (true, Some(hash)) = (kept, hash) {
                if !reload.contains(hash) {
                    reload.push(*hash);
                }
            }
        }
        for hash in saved.iter().rev().filter_map(|(_, hash)| *hash) {
            if reload.len() >= limit {
                break;
            }
            if !reload.contains(&hash) {
                reload.push(hash);
            }
        }
        reload
    }
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator")
            .field("vat_id", &self.vat_id)
            .field("replicas", &self.replicas.len())
            .field("last_delivery", &self.last_delivery)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vatworks_core::{DeliveryResult, SyscallHandler, VatSyscall};
    use vatworks_storage::MemorySnapshotStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vatworks_core::SharedSyscallHandler;
    use vatworks_transport::{
        LocalFactory, SnapshotResult, TransportError, VatDispatch, WorkerSource,
    };

    /// Counts messages in the vatstore; `skip_read` drops the read
    struct Counter {
        count: u64,
        skip_read: bool,
    }

    impl VatDispatch for Counter {
        fn dispatch(&mut self, delivery: &VatDelivery, syscall: &dyn SyscallHandler) -> DeliveryResult {
            if !matches!(delivery, VatDelivery::Message { .. }) {
                return DeliveryResult::ok();
            }
            if !self.skip_read {
                syscall.handle(VatSyscall::VatstoreGet { key: "count".to_string() });
            }
            self.count += 1;
            let answer = syscall.handle(VatSyscall::VatstoreSet {
                key: "count".to_string(),
                value: self.count.to_string(),
            });
            if answer.is_ok() {
                DeliveryResult::ok()
            } else {
                DeliveryResult::error("syscall refused")
            }
        }

        fn snapshot(&self) -> Option<Vec<u8>> {
            Some(self.count.to_string().into_bytes())
        }
    }

    /// Replicas restored from snapshots skip the read when `flaky`
    fn factory(flaky: bool) -> Arc<dyn WorkerFactory> {
        Arc::new(LocalFactory::new(move |spec| {
            let dispatch = match &spec.source {
                WorkerSource::Bundle { .. } => Counter {
                    count: 0,
                    skip_read: false,
                },
                WorkerSource::Snapshot(bytes) => Counter {
                    count: std::str::from_utf8(bytes).unwrap().parse().unwrap(),
                    skip_read: flaky,
                },
            };
            Ok(Box::new(dispatch) as Box<dyn VatDispatch>)
        }))
    }

    fn base() -> ReplayConfig {
        ReplayConfig::default()
            .with_activity_log(None)
            .with_forced_snapshots(2, 0)
    }

    fn create_line() -> String {
        json!({"type": "create-vat", "vatID": "v1", "vatSourceBundle": {"moduleFormat": "test"}, "vatParameters": null})
            .to_string()
    }

    fn delivery_line(n: u64) -> String {
        let prior = if n == 1 { json!(null) } else { json!((n - 1).to_string()) };
        json!({
            "transcriptNum": n,
            "d": ["message", "o+0", {"methargs": {"body": "#[\"bump\",[]]", "slots": []}}],
            "syscalls": [
                {"d": ["vatstoreGet", "count"], "response": ["ok", prior]},
                {"d": ["vatstoreSet", "count", n.to_string()], "response": ["ok", null]}
            ]
        })
        .to_string()
    }

    fn save_line(hash: SnapshotHash) -> String {
        json!({"type": "heap-snapshot-save", "snapshotID": hash.to_hex()}).to_string()
    }

    fn load_line(hash: SnapshotHash) -> String {
        json!({"type": "heap-snapshot-load", "vatID": "v1", "snapshotID": hash.to_hex()}).to_string()
    }

    fn transcript(lines: &[String]) -> String {
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }

    async fn replay(
        config: ReplayConfig,
        flaky: bool,
        store: Arc<MemorySnapshotStore>,
        lines: &[String],
    ) -> Result<ReplaySummary, ReplayError> {
        let text = transcript(lines);
        let coordinator = ReplayCoordinator::new(config, "test.jsonl", factory(flaky), store)?;
        coordinator
            .run(TranscriptFileReader::from_reader(text.as_bytes()))
            .await
    }

    #[tokio::test]
    async fn test_replays_clean_transcript() {
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let summary = replay(base(), false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.lines_read, 4);
        assert_eq!(summary.deliveries_replayed, 3);
        assert_eq!(summary.replicas.len(), 1);
        assert_eq!(summary.replicas[0].start_delivery, Some(1));
        assert_eq!(summary.replicas[0].deliveries_up, 3);
    }

    #[tokio::test]
    async fn test_first_line_must_create_vat() {
        let lines = vec![delivery_line(1)];
        let err = replay(base(), false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::BadTranscript { line: 1, .. }));
    }

    #[tokio::test]
    async fn test_forced_snapshot_spawns_replica() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = base().with_forced_snapshots(2, 1000);
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let summary = replay(config, false, store.clone(), &lines).await.unwrap();

        assert!(summary.is_clean());
        assert_eq!(summary.replicas.len(), 2);
        assert_eq!(summary.replicas[1].start_delivery, Some(3));
        assert_eq!(summary.replicas[1].deliveries_up, 1);
        // Matching snapshots are not kept
        assert_eq!(store.stats().snapshot_count, 0);
        assert_eq!(store.stats().load_count, 1);
    }

    #[tokio::test]
    async fn test_keep_all_snapshots() {
        let store = Arc::new(MemorySnapshotStore::new());
        let config = ReplayConfig {
            keep_all_snapshots: true,
            ..base().with_forced_snapshots(2, 1000)
        };
        let lines = vec![create_line(), delivery_line(1), delivery_line(2)];
        replay(config, false, store.clone(), &lines).await.unwrap();
        assert!(store.contains(&SnapshotHash::compute(b"2")));
    }

    #[tokio::test]
    async fn test_divergent_replica_reported() {
        let config = base().with_forced_snapshots(2, 1000);
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let summary = replay(config, true, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();

        assert_eq!(summary.violations.len(), 1);
        assert_eq!(summary.violations[0].replica, ReplicaId(1));
        assert_eq!(summary.violations[0].delivery_num, 3);
        assert_eq!(summary.violations[0].position, 0);

        assert_eq!(summary.divergences.len(), 1);
        let first = &summary.divergences[0];
        assert_eq!(first.delivery_num, 3);
        assert_eq!(first.position, 0);
        assert_eq!(first.groups.len(), 2);
        assert_eq!(first.groups[0].replicas, vec![ReplicaId(0)]);
        assert_eq!(first.groups[1].replicas, vec![ReplicaId(1)]);
    }

    /// Counts closes; `dead` workers fail every delivery like a killed process
    struct Tracked {
        inner: Box<dyn WorkerTransport>,
        dead: bool,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl WorkerTransport for Tracked {
        fn pid(&self) -> Option<u32> {
            self.inner.pid()
        }

        fn register_syscall_handler(&self, handler: SharedSyscallHandler) {
            self.inner.register_syscall_handler(handler);
        }

        async fn deliver(&self, delivery: &VatDelivery) -> Result<DeliveryResult, TransportError> {
            if self.dead {
                return Err(TransportError::Signal { signal: 9 });
            }
            self.inner.deliver(delivery).await
        }

        fn supports_snapshots(&self) -> bool {
            self.inner.supports_snapshots()
        }

        async fn make_snapshot(
            &self,
            after_delivery_num: DeliveryNum,
            store: &dyn SnapshotStore,
            restart: bool,
        ) -> Result<SnapshotResult, TransportError> {
            self.inner.make_snapshot(after_delivery_num, store, restart).await
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            self.inner.close().await
        }
    }

    /// Replicas restored from snapshots are killed on their first delivery
    struct KillRestored {
        inner: Arc<dyn WorkerFactory>,
        closed: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl WorkerFactory for KillRestored {
        async fn create(&self, spec: WorkerSpec) -> Result<Box<dyn WorkerTransport>, TransportError> {
            let dead = matches!(spec.source, WorkerSource::Snapshot(_));
            let inner = self.inner.create(spec).await?;
            Ok(Box::new(Tracked {
                inner,
                dead,
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_worker_death_ends_run() {
        let closed = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(KillRestored {
            inner: factory(false),
            closed: closed.clone(),
        });
        // Every tolerance flag stays at its default
        let config = base().with_forced_snapshots(2, 1000);
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let text = transcript(&lines);
        let coordinator =
            ReplayCoordinator::new(config, "test.jsonl", factory, Arc::new(MemorySnapshotStore::new()))
                .unwrap();
        let err = coordinator
            .run(TranscriptFileReader::from_reader(text.as_bytes()))
            .await
            .unwrap_err();

        assert_eq!(err, ReplayError::Transport(TransportError::Signal { signal: 9 }));
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_strict_divergence_fails() {
        let config = base().with_forced_snapshots(2, 1000).with_strict_divergence(true);
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let err = replay(config, true, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap_err();
        assert_eq!(err, ReplayError::Divergence { delivery_num: 3 });
    }

    #[tokio::test]
    async fn test_strict_transcript_fails() {
        let config = base().with_forced_snapshots(2, 1000).with_strict_transcript(true);
        let lines = vec![create_line(), delivery_line(1), delivery_line(2), delivery_line(3)];
        let err = replay(config, true, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Transcript(TranscriptError::Violation(_))));
    }

    #[tokio::test]
    async fn test_snapshot_save_then_load() {
        let hash = SnapshotHash::compute(b"2");
        let lines = vec![
            create_line(),
            delivery_line(1),
            delivery_line(2),
            save_line(hash),
            load_line(hash),
            delivery_line(3),
        ];
        let summary = replay(base(), false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();
        assert!(summary.is_clean());
        // The explicit load reuses the replica started by the save
        assert_eq!(summary.replicas.len(), 2);
        assert_eq!(summary.replicas[1].start_delivery, Some(3));
    }

    #[tokio::test]
    async fn test_snapshot_hash_mismatch() {
        let recorded = SnapshotHash::compute(b"recorded elsewhere");
        let lines = vec![
            create_line(),
            delivery_line(1),
            delivery_line(2),
            save_line(recorded),
            load_line(recorded),
            delivery_line(3),
        ];
        let summary = replay(base(), false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();
        assert_eq!(summary.hash_mismatches.len(), 1);
        assert_eq!(summary.hash_mismatches[0].expected, Some(recorded));
        assert_eq!(summary.hash_mismatches[0].actual, vec![SnapshotHash::compute(b"2")]);
        assert_eq!(summary.replicas.len(), 2);

        let strict = base().with_strict_snapshot_hashes(true);
        let err = replay(strict, false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::SnapshotHashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_start_from_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        let saved = store.save_snapshot(&VatId::new("v1"), 2, b"2").unwrap();
        let lines = vec![load_line(saved.hash), delivery_line(3), delivery_line(4)];
        let summary = replay(base(), false, store.clone(), &lines).await.unwrap();
        assert!(summary.is_clean());
        assert_eq!(summary.deliveries_replayed, 2);
        assert_eq!(store.stats().load_count, 1);
    }

    #[tokio::test]
    async fn test_old_replicas_retired() {
        let config = ReplayConfig {
            keep_worker_recent: 1,
            keep_worker_interval: 0,
            ..base().with_forced_snapshots(1, 1)
        };
        let lines: Vec<String> = std::iter::once(create_line())
            .chain((1..=4).map(delivery_line))
            .collect();
        let summary = replay(config, false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();
        assert!(summary.is_clean());

        let order: Vec<u64> = summary.replicas.iter().map(|s| s.replica.0).collect();
        assert_eq!(order, vec![1, 2, 0, 3, 4]);
        let up: Vec<u64> = summary.replicas.iter().map(|s| s.deliveries_up).collect();
        assert_eq!(up, vec![2, 2, 4, 1, 0]);
    }

    #[tokio::test]
    async fn test_activity_log_records_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("activity.jsonl");
        let config = base()
            .with_forced_snapshots(2, 1000)
            .with_activity_log(Some(path.clone()));
        let lines = vec![create_line(), delivery_line(1), delivery_line(2)];
        replay(config, false, Arc::new(MemorySnapshotStore::new()), &lines)
            .await
            .unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        let kinds: Vec<ActivityKind> = text
            .lines()
            .map(|line| serde_json::from_str::<ActivityRecord>(line).unwrap().kind)
            .collect();
        assert_eq!(kinds, vec![ActivityKind::Create, ActivityKind::Save, ActivityKind::Load]);
    }
}
