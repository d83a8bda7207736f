//! Vatworks Worker Transport
//!
//! Presents one live vat worker, in-process or in a subprocess, as a
//! non-reentrant `deliver` call plus a syscall handler hook. Vat-level
//! failures come back as data in the [`DeliveryResult`]; worker death comes
//! back as a [`TransportError`].
//!
//! [`DeliveryResult`]: vatworks_core::DeliveryResult

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod factory;
pub mod local;
pub mod subprocess;
pub mod transport;

pub use codec::{Frame, NetstringCodec};
pub use error::TransportError;
pub use factory::{LocalFactory, SubprocessFactory, WorkerFactory, WorkerSource, WorkerSpec};
pub use local::{LocalWorker, VatDispatch};
pub use subprocess::{SubprocessConfig, SubprocessWorker};
pub use transport::{InFlight, InFlightGuard, SnapshotResult, WorkerTransport};
