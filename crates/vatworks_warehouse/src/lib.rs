//! Vatworks Vat Warehouse
//!
//! Keeps a bounded set of vats online, each backed by a live worker. A vat
//! that is needed but offline is rebuilt from its latest heap snapshot and the
//! transcript entries recorded since. The least recently used vat is evicted
//! when the set overflows.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lru;
pub mod policy;
pub mod warehouse;

pub use error::WarehouseError;
pub use lru::Lru;
pub use policy::{SnapshotPolicy, SnapshotReason, WarehousePolicy};
pub use warehouse::{KernelSyscalls, VatWarehouse};
