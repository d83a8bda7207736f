//! Vatworks Transcript Engine
//!
//! Records every delivery a vat receives together with the syscalls it made,
//! and replays recorded spans against a fresh worker while checking that the
//! worker makes the same syscalls in the same order.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod file;
pub mod recorder;
pub mod replayer;
pub mod simulator;

pub use error::{PositionDump, SyscallStatus, TranscriptError, TranscriptViolation, ViolationKind};
pub use file::{TranscriptFileReader, TranscriptLine};
pub use recorder::{RecordingSyscallHandler, TranscriptRecorder};
pub use replayer::{ReplayHandler, ReplaySpanReport, TranscriptReplayer};
pub use simulator::{
    CompareOutcome, RelaxedPolicy, RelaxedSyscalls, ReplayReport, SyscallSimulator, VcSideTable,
    DEFAULT_VC_KEY_PATTERN,
};
