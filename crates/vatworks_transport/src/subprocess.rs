//! Subprocess worker.
//!
//! A tokio task owns the child process and both ends of its netstring pipe.
//! The [`SubprocessWorker`] handle sends it one request at a time over a
//! channel and awaits the reply on a oneshot. Syscalls the worker makes while
//! a command is running are answered inside the task through the registered
//! handler.

use crate::codec::{Frame, NetstringCodec, split_meter};
use crate::error::TransportError;
use crate::factory::{WorkerSource, WorkerSpec};
use crate::transport::{InFlight, SnapshotResult, WorkerTransport};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::Write;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vatworks_core::{
    CoreError, DeliveryNum, DeliveryResult, SharedSyscallHandler, SnapshotInfo, VatDelivery, VatId,
    VatSyscall, VatSyscallResult,
};
use vatworks_storage::SnapshotStore;

/// How long to wait for an exit status after a pipe error
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Worker program and its environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubprocessConfig {
    /// Worker executable
    pub program: PathBuf,
    /// Arguments placed before `--snapshot <path>`
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Largest frame accepted from the worker
    #[serde(default = "default_max_frame")]
    pub max_frame: usize,
}

fn default_max_frame() -> usize {
    crate::codec::DEFAULT_MAX_FRAME
}

impl SubprocessConfig {
    /// Create a config for a program
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            max_frame: default_max_frame(),
        }
    }

    /// Add an argument
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add arguments
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running child and its framed pipe
struct Process {
    child: Child,
    pid: u32,
    reader: FramedRead<ChildStdout, NetstringCodec>,
    writer: FramedWrite<ChildStdin, NetstringCodec>,
    // Held until the process is replaced so the path stays valid.
    _snapshot_file: Option<NamedTempFile>,
}

fn spawn_process(config: &SubprocessConfig, snapshot: Option<&[u8]>) -> Result<Process, TransportError> {
    let spawn_err = |reason: String| TransportError::Spawn {
        program: config.program.display().to_string(),
        reason,
    };
    let snapshot_file = match snapshot {
        Some(bytes) => {
            let mut file = NamedTempFile::new()?;
            file.write_all(bytes)?;
            file.flush()?;
            Some(file)
        }
        None => None,
    };

    let mut command = Command::new(&config.program);
    command.args(&config.args);
    if let Some(file) = &snapshot_file {
        command.arg("--snapshot").arg(file.path());
    }
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|e| spawn_err(e.to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_err("missing child stdin pipe".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_err("missing child stdout pipe".to_string()))?;
    let pid = child.id().unwrap_or(0);
    let codec = NetstringCodec::new().with_max_frame(config.max_frame);
    Ok(Process {
        child,
        pid,
        reader: FramedRead::new(stdout, codec.clone()),
        writer: FramedWrite::new(stdin, codec),
        _snapshot_file: snapshot_file,
    })
}

/// Map a process exit observed mid-operation to an error
fn exit_status_error(status: ExitStatus) -> TransportError {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return TransportError::Signal { signal };
        }
    }
    match status.code() {
        Some(0) | None => TransportError::Exited,
        Some(code) => TransportError::ExitCode { code },
    }
}

enum Op {
    /// Send a `?` command and wait for its reply
    Command(Bytes),
    /// Replace the process with one restored from a snapshot
    Restart(Arc<Vec<u8>>),
}

struct WorkerRequest {
    op: Op,
    reply: oneshot::Sender<Result<Bytes, TransportError>>,
}

struct WorkerActor {
    vat_id: VatId,
    config: SubprocessConfig,
    process: Process,
    pid: Arc<AtomicU32>,
    handler: Arc<RwLock<Option<SharedSyscallHandler>>>,
    requests: mpsc::Receiver<WorkerRequest>,
    cancel: CancellationToken,
}

impl WorkerActor {
    async fn run(mut self) {
        loop {
            let request = tokio::select! {
                () = self.cancel.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            let outcome = match request.op {
                Op::Command(payload) => self.run_command(payload).await,
                Op::Restart(snapshot) => self.restart(&snapshot).await.map(|()| Bytes::new()),
            };
            let dead = matches!(&outcome, Err(e) if e.is_worker_death() || *e == TransportError::Closed);
            let _ = request.reply.send(outcome);
            if dead {
                break;
            }
        }
        self.kill().await;
        debug!(vat_id = %self.vat_id, pid = self.process.pid, "worker task finished");
    }

    async fn run_command(&mut self, payload: Bytes) -> Result<Bytes, TransportError> {
        if let Err(err) = self.process.writer.send(Frame::Request(payload).into_bytes()).await {
            return Err(self.death_or(err).await);
        }
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return Err(TransportError::Closed),
                next = self.process.reader.next() => next,
            };
            match next {
                Some(Ok(raw)) => match Frame::parse(raw)? {
                    Frame::Request(body) => {
                        let answer = self.answer_syscall(&body);
                        let frame = Frame::SyscallResponse(answer).into_bytes();
                        if let Err(err) = self.process.writer.send(frame).await {
                            return Err(self.death_or(err).await);
                        }
                    }
                    Frame::Reply(body) => return Ok(body),
                    Frame::Exception(body) => {
                        return Err(TransportError::WorkerException {
                            message: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }
                    Frame::SyscallResponse(_) => {
                        return Err(TransportError::Protocol {
                            reason: "worker sent a syscall response".to_string(),
                        });
                    }
                },
                Some(Err(err)) => return Err(self.death_or(err).await),
                None => return Err(self.exit_error().await),
            }
        }
    }

    fn answer_syscall(&self, body: &[u8]) -> Bytes {
        let decoded = serde_json::from_slice::<Value>(body)
            .map_err(CoreError::from)
            .and_then(|v| VatSyscall::from_wire(&v));
        let result = match decoded {
            Ok(syscall) => {
                let handler = self
                    .handler
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                match handler {
                    Some(handler) => handler.handle(syscall),
                    None => VatSyscallResult::Error(format!("no syscall handler for {}", syscall.kind())),
                }
            }
            Err(err) => {
                warn!(vat_id = %self.vat_id, error = %err, "undecodable syscall from worker");
                VatSyscallResult::Error(err.to_string())
            }
        };
        Bytes::from(result.to_wire().to_string())
    }

    async fn restart(&mut self, snapshot: &[u8]) -> Result<(), TransportError> {
        let fresh = spawn_process(&self.config, Some(snapshot))?;
        let mut old = std::mem::replace(&mut self.process, fresh);
        let _ = old.child.start_kill();
        let _ = old.child.wait().await;
        self.pid.store(self.process.pid, Ordering::Release);
        info!(vat_id = %self.vat_id, old_pid = old.pid, pid = self.process.pid, "worker restarted from snapshot");
        Ok(())
    }

    /// Wait for the exit status once stdout has closed
    async fn exit_error(&mut self) -> TransportError {
        tokio::select! {
            () = self.cancel.cancelled() => TransportError::Closed,
            status = self.process.child.wait() => match status {
                Ok(status) => exit_status_error(status),
                Err(err) => err.into(),
            },
        }
    }

    /// A pipe error usually means the worker died; prefer its exit status
    async fn death_or(&mut self, err: TransportError) -> TransportError {
        match tokio::time::timeout(EXIT_GRACE, self.process.child.wait()).await {
            Ok(Ok(status)) => exit_status_error(status),
            _ => err,
        }
    }

    async fn kill(&mut self) {
        let _ = self.process.child.start_kill();
        let _ = self.process.child.wait().await;
    }
}

/// Handle to a worker process
pub struct SubprocessWorker {
    vat_id: VatId,
    pid: Arc<AtomicU32>,
    handler: Arc<RwLock<Option<SharedSyscallHandler>>>,
    requests: mpsc::Sender<WorkerRequest>,
    in_flight: InFlight,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    failure: RwLock<Option<TransportError>>,
}

impl SubprocessWorker {
    /// Start a worker process and load its initial heap
    ///
    /// # Errors
    ///
    /// Returns error if the process cannot be started or rejects its bundle
    pub async fn start(config: SubprocessConfig, spec: WorkerSpec) -> Result<Self, TransportError> {
        let snapshot = match &spec.source {
            WorkerSource::Snapshot(bytes) => Some(bytes.as_slice()),
            WorkerSource::Bundle { .. } => None,
        };
        let process = spawn_process(&config, snapshot)?;
        let pid = Arc::new(AtomicU32::new(process.pid));
        let handler = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(1);
        info!(vat_id = %spec.vat_id, pid = process.pid, program = %config.program.display(), "worker started");

        let actor = WorkerActor {
            vat_id: spec.vat_id.clone(),
            config,
            process,
            pid: pid.clone(),
            handler: handler.clone(),
            requests: rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        let worker = Self {
            vat_id: spec.vat_id,
            pid,
            handler,
            requests: tx,
            in_flight: InFlight::new(),
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
            failure: RwLock::new(None),
        };
        if let WorkerSource::Bundle {
            bundle,
            vat_parameters,
        } = &spec.source
        {
            let command = json!(["setBundle", worker.vat_id, bundle.as_ref(), vat_parameters]);
            if let Err(err) = worker.request(Op::Command(Bytes::from(command.to_string()))).await {
                let _ = worker.close().await;
                return Err(err);
            }
        }
        Ok(worker)
    }

    /// Vat this worker runs
    #[must_use]
    pub fn vat_id(&self) -> &VatId {
        &self.vat_id
    }

    async fn request(&self, op: Op) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let failure = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(err) = failure {
            return Err(err);
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(WorkerRequest { op, reply })
            .await
            .map_err(|_| TransportError::Closed)?;
        let outcome = rx.await.map_err(|_| TransportError::Closed)?;
        if let Err(err) = &outcome {
            if err.is_worker_death() {
                warn!(vat_id = %self.vat_id, pid = self.pid.load(Ordering::Acquire), error = %err, "worker died");
                *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
            }
        }
        outcome
    }
}

impl std::fmt::Debug for SubprocessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubprocessWorker")
            .field("vat_id", &self.vat_id)
            .field("pid", &self.pid.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for SubprocessWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn protocol_error(what: &str, err: impl std::fmt::Display) -> TransportError {
    TransportError::Protocol {
        reason: format!("{}: {}", what, err),
    }
}

#[async_trait]
impl WorkerTransport for SubprocessWorker {
    fn pid(&self) -> Option<u32> {
        Some(self.pid.load(Ordering::Acquire))
    }

    fn register_syscall_handler(&self, handler: SharedSyscallHandler) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    async fn deliver(&self, delivery: &VatDelivery) -> Result<DeliveryResult, TransportError> {
        let _guard = self.in_flight.enter()?;
        let command = json!(["deliver", delivery.to_wire()]);
        let reply = self.request(Op::Command(Bytes::from(command.to_string()))).await?;
        let (meter, body) = split_meter(&reply);
        let value: Value =
            serde_json::from_slice(&body).map_err(|e| protocol_error("delivery result", e))?;
        let mut result =
            DeliveryResult::from_wire(&value).map_err(|e| protocol_error("delivery result", e))?;
        if let Some(meter) = meter {
            result.meter_usage =
                Some(serde_json::from_slice(&meter).map_err(|e| protocol_error("meter usage", e))?);
        }
        debug!(vat_id = %self.vat_id, kind = delivery.kind(), status = result.status_str(), "delivery complete");
        Ok(result)
    }

    fn supports_snapshots(&self) -> bool {
        true
    }

    async fn make_snapshot(
        &self,
        after_delivery_num: DeliveryNum,
        store: &dyn SnapshotStore,
        restart: bool,
    ) -> Result<SnapshotResult, TransportError> {
        let _guard = self.in_flight.enter()?;
        let command = json!(["snapshot"]);
        let bytes = self.request(Op::Command(Bytes::from(command.to_string()))).await?;
        let saved = store.save_snapshot(&self.vat_id, after_delivery_num, &bytes)?;
        if restart {
            self.request(Op::Restart(Arc::new(bytes.to_vec()))).await?;
        }
        info!(
            vat_id = %self.vat_id,
            delivery_num = after_delivery_num,
            hash = %saved.hash,
            bytes = saved.raw_byte_count,
            restart,
            "snapshot taken"
        );
        Ok(SnapshotResult {
            info: SnapshotInfo {
                hash: saved.hash,
                end_pos: after_delivery_num,
            },
            saved,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await.map_err(|e| TransportError::Io {
                reason: format!("worker task failed: {}", e),
            })?;
        }
        debug!(vat_id = %self.vat_id, "worker closed");
        Ok(())
    }
}
