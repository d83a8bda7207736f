//! Vatworks Core Types
//!
//! Pure data types shared by every vatworks crate: identifiers, snapshot
//! hashes, the worker wire messages and transcript entries. No I/O.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod error;
pub mod hash;
pub mod id;
pub mod protocol;
pub mod transcript;

// Re-exports
pub use canonical::{canonical_eq, to_canonical_string};
pub use error::{CoreError, CoreResult};
pub use hash::{HashError, SnapshotHash, SnapshotHasher};
pub use id::{BundleId, DeliveryNum, VatId};
pub use protocol::{
    DeliveryResult, DeliveryStatus, MeterUsage, SharedSyscallHandler, SyscallHandler,
    VatDelivery, VatSyscall, VatSyscallResult,
};
pub use transcript::{
    DeliveryResultSummary, InitializeWorkerOptions, SnapshotInfo, SyscallRecord,
    TranscriptDelivery, TranscriptEntry,
};
