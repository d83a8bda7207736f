//! Vatworks Storage
//!
//! The persistence collaborators the warehouse and replay tools consume:
//! a content-addressed heap snapshot store, a kernel keeper holding vat
//! records and transcripts, and a source bundle lookup. Each comes with a
//! reference implementation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod error;
pub mod keeper;
pub mod snapshot;

pub use bundle::{BundleHandler, DirBundleHandler, MemoryBundleHandler};
pub use error::StoreError;
pub use keeper::{KernelKeeper, MemoryKernelKeeper, VatOptions, VatRecord};
pub use snapshot::{
    FsSnapshotStore, MemorySnapshotStore, SavedSnapshot, SnapshotStore, StoreStats,
};
