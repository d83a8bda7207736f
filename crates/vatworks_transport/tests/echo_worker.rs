//! End-to-end tests against the `vatworks-echo-worker` binary.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use vatworks_core::{DeliveryStatus, VatDelivery, VatId, VatSyscall, VatSyscallResult};
use vatworks_storage::{MemorySnapshotStore, SnapshotStore};
use vatworks_transport::{
    SubprocessConfig, SubprocessFactory, TransportError, WorkerFactory, WorkerSpec, WorkerTransport,
};

fn echo_config() -> SubprocessConfig {
    SubprocessConfig::new(env!("CARGO_BIN_EXE_vatworks-echo-worker"))
}

fn message(method: &str) -> VatDelivery {
    VatDelivery::Message {
        target: "o+0".to_string(),
        msg: json!({
            "methargs": {"body": format!("#[\"{}\",[]]", method), "slots": []},
            "result": "p-1"
        }),
    }
}

/// A vatstore-backed handler that also logs every syscall
fn vatstore() -> (Arc<Mutex<Vec<VatSyscall>>>, vatworks_core::SharedSyscallHandler) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(Mutex::new(HashMap::<String, String>::new()));
    let seen = log.clone();
    let handler = Arc::new(move |syscall: VatSyscall| {
        seen.lock().unwrap().push(syscall.clone());
        let mut store = store.lock().unwrap();
        match syscall {
            VatSyscall::VatstoreGet { key } => {
                VatSyscallResult::Ok(store.get(&key).map(|v| Value::String(v.clone())))
            }
            VatSyscall::VatstoreSet { key, value } => {
                store.insert(key, value);
                VatSyscallResult::ok_null()
            }
            _ => VatSyscallResult::Error("unsupported".to_string()),
        }
    });
    (log, handler)
}

async fn start_echo() -> Box<dyn WorkerTransport> {
    SubprocessFactory::new(echo_config())
        .create(WorkerSpec::from_bundle(
            VatId::new("v1"),
            Arc::new(json!({"moduleFormat": "test"})),
            Value::Null,
        ))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_delivery_makes_syscalls() {
    let worker = start_echo().await;
    let (log, handler) = vatstore();
    worker.register_syscall_handler(handler);

    let result = worker.deliver(&message("ping")).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(result.meter_usage.unwrap().compute, Some(1));

    let syscalls = log.lock().unwrap().clone();
    assert_eq!(
        syscalls,
        vec![
            VatSyscall::VatstoreGet {
                key: "count".to_string()
            },
            VatSyscall::VatstoreSet {
                key: "count".to_string(),
                value: "1".to_string()
            },
        ]
    );
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_vat_failure_is_data() {
    let worker = start_echo().await;
    let (_log, handler) = vatstore();
    worker.register_syscall_handler(handler);

    let result = worker.deliver(&message("fail")).await.unwrap();
    assert_eq!(result.status, DeliveryStatus::Error("failure on request".to_string()));

    // the worker is still usable afterwards
    assert!(worker.deliver(&message("ping")).await.unwrap().is_ok());
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_exception_rejects() {
    let worker = start_echo().await;
    let err = worker.deliver(&message("throw")).await.unwrap_err();
    assert!(matches!(err, TransportError::WorkerException { .. }));
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_exit_code_rejects() {
    let worker = start_echo().await;
    let err = worker.deliver(&message("crash")).await.unwrap_err();
    assert_eq!(err, TransportError::ExitCode { code: 3 });
    // later calls keep reporting the death
    let again = worker.deliver(&message("ping")).await.unwrap_err();
    assert_eq!(again, TransportError::ExitCode { code: 3 });
    worker.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_mid_delivery_is_signal_error() {
    // Reads the first byte of the delivery frame, then kills itself.
    let config = SubprocessConfig::new("sh")
        .with_arg("-c")
        .with_arg("head -c 1 >/dev/null; kill -TERM $$");
    let worker = SubprocessFactory::new(config)
        .create(WorkerSpec::from_snapshot(VatId::new("v1"), b"{}".to_vec()))
        .await
        .unwrap();
    let err = worker.deliver(&message("ping")).await.unwrap_err();
    assert_eq!(err, TransportError::Signal { signal: 15 });
    assert!(err.is_worker_death());
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_snapshot_restart_keeps_state() {
    let worker = start_echo().await;
    let (log, handler) = vatstore();
    worker.register_syscall_handler(handler);
    worker.deliver(&message("ping")).await.unwrap();
    worker.deliver(&message("ping")).await.unwrap();

    let old_pid = worker.pid();
    let store = MemorySnapshotStore::new();
    let snap = worker.make_snapshot(2, &store, true).await.unwrap();
    assert_eq!(snap.info.end_pos, 2);
    assert_ne!(worker.pid(), old_pid);
    let bytes = store.load_by_hash(&snap.info.hash).unwrap();
    let heap: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(heap["count"], 2);

    // the successor continues from the snapshot
    worker.deliver(&message("ping")).await.unwrap();
    let last = log.lock().unwrap().last().cloned().unwrap();
    assert_eq!(
        last,
        VatSyscall::VatstoreSet {
            key: "count".to_string(),
            value: "3".to_string()
        }
    );
    worker.close().await.unwrap();
}

#[tokio::test]
async fn test_identical_histories_snapshot_identically() {
    let store = MemorySnapshotStore::new();
    let mut hashes = Vec::new();
    for _ in 0..2 {
        let worker = start_echo().await;
        let (_log, handler) = vatstore();
        worker.register_syscall_handler(handler);
        worker.deliver(&message("ping")).await.unwrap();
        hashes.push(worker.make_snapshot(1, &store, false).await.unwrap().info.hash);
        worker.close().await.unwrap();
    }
    assert_eq!(hashes[0], hashes[1]);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let worker = start_echo().await;
    worker.close().await.unwrap();
    worker.close().await.unwrap();
    assert_eq!(
        worker.deliver(&message("ping")).await.unwrap_err(),
        TransportError::Closed
    );
}
