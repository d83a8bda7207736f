//! Exported transcript files.
//!
//! One JSON object per line. Lines carry a `type` of `create-vat`,
//! `heap-snapshot-load` or `heap-snapshot-save`; anything else is a delivery
//! `{transcriptNum, d, syscalls: [{d, response}]}`.

use crate::error::TranscriptError;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::debug;
use vatworks_core::{
    BundleId, DeliveryNum, SnapshotHash, SyscallRecord, VatDelivery, VatId, VatSyscall,
    VatSyscallResult,
};

/// Lines between progress messages
const PROGRESS_EVERY: usize = 1000;

/// One parsed transcript line
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptLine {
    /// The vat was created from a bundle
    CreateVat {
        /// Vat
        vat_id: Option<VatId>,
        /// Bundle id of the source, when exported by id
        source_bundle_id: Option<BundleId>,
        /// Inline source bundle
        vat_source_bundle: Option<Value>,
        /// Capdata vat parameters
        vat_parameters: Value,
    },
    /// The worker was restored from a snapshot
    HeapSnapshotLoad {
        /// Vat
        vat_id: Option<VatId>,
        /// Snapshot loaded
        snapshot_id: SnapshotHash,
    },
    /// A snapshot was written
    HeapSnapshotSave {
        /// Hash the kernel recorded
        snapshot_id: SnapshotHash,
    },
    /// A delivery and the syscalls it made
    Delivery {
        /// Transcript position
        transcript_num: DeliveryNum,
        /// Delivery
        d: VatDelivery,
        /// Recorded syscalls
        syscalls: Vec<SyscallRecord>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLine {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "vatID", default)]
    vat_id: Option<VatId>,
    #[serde(rename = "snapshotID", default)]
    snapshot_id: Option<String>,
    #[serde(rename = "sourceBundleID", default)]
    source_bundle_id: Option<BundleId>,
    #[serde(default)]
    vat_source_bundle: Option<Value>,
    #[serde(default)]
    vat_parameters: Option<Value>,
    #[serde(default)]
    transcript_num: Option<DeliveryNum>,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    syscalls: Vec<RawSyscall>,
}

#[derive(Debug, Deserialize)]
struct RawSyscall {
    d: Value,
    response: Value,
}

impl TranscriptLine {
    /// Parse one line
    ///
    /// # Errors
    ///
    /// Returns error if the line is not a valid transcript record
    pub fn parse(line: usize, text: &str) -> Result<Self, TranscriptError> {
        let parse_err = |reason: String| TranscriptError::Parse { line, reason };
        let raw: RawLine = serde_json::from_str(text).map_err(|e| parse_err(e.to_string()))?;
        let snapshot_id = |raw: &RawLine| {
            let hex = raw
                .snapshot_id
                .as_deref()
                .ok_or_else(|| parse_err("missing snapshotID".to_string()))?;
            SnapshotHash::from_hex(hex).map_err(|e| parse_err(e.to_string()))
        };

        match raw.kind.as_deref() {
            Some("create-vat") => Ok(Self::CreateVat {
                vat_id: raw.vat_id,
                source_bundle_id: raw.source_bundle_id,
                vat_source_bundle: raw.vat_source_bundle,
                vat_parameters: raw.vat_parameters.unwrap_or(Value::Null),
            }),
            Some("heap-snapshot-load") => Ok(Self::HeapSnapshotLoad {
                snapshot_id: snapshot_id(&raw)?,
                vat_id: raw.vat_id,
            }),
            Some("heap-snapshot-save") => Ok(Self::HeapSnapshotSave {
                snapshot_id: snapshot_id(&raw)?,
            }),
            _ => {
                let transcript_num = raw
                    .transcript_num
                    .ok_or_else(|| parse_err("missing transcriptNum".to_string()))?;
                let d = raw.d.ok_or_else(|| parse_err("missing d".to_string()))?;
                let d = VatDelivery::from_wire(&d).map_err(|e| parse_err(e.to_string()))?;
                let syscalls = raw
                    .syscalls
                    .iter()
                    .map(|s| {
                        let syscall = VatSyscall::from_wire(&s.d)?;
                        let response = VatSyscallResult::from_wire(&s.response)?;
                        Ok(SyscallRecord::new(syscall, response))
                    })
                    .collect::<Result<Vec<_>, vatworks_core::CoreError>>()
                    .map_err(|e| parse_err(e.to_string()))?;
                Ok(Self::Delivery {
                    transcript_num,
                    d,
                    syscalls,
                })
            }
        }
    }

    /// Line type, as written in the file
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateVat { .. } => "create-vat",
            Self::HeapSnapshotLoad { .. } => "heap-snapshot-load",
            Self::HeapSnapshotSave { .. } => "heap-snapshot-save",
            Self::Delivery { .. } => "delivery",
        }
    }
}

/// Streaming reader over a transcript file
pub struct TranscriptFileReader<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl TranscriptFileReader<File> {
    /// Open a transcript file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or is compressed
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TranscriptError> {
        let path = path.as_ref();
        if path.extension().is_some_and(|ext| ext == "gz") {
            return Err(TranscriptError::Io {
                reason: format!("{}: compressed transcripts are not supported", path.display()),
            });
        }
        let file = File::open(path).await?;
        Ok(Self::from_reader(file))
    }
}

impl<R: AsyncRead + Unpin> TranscriptFileReader<R> {
    /// Read transcript lines from any async reader
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }

    /// Lines consumed so far
    #[must_use]
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Next record with its 1-based line number; blank lines are skipped
    ///
    /// # Errors
    ///
    /// Returns error on a read failure or a malformed line
    pub async fn next_line(&mut self) -> Result<Option<(usize, TranscriptLine)>, TranscriptError> {
        while let Some(text) = self.lines.next_line().await? {
            self.line_no += 1;
            if self.line_no % PROGRESS_EVERY == 0 {
                debug!(line = self.line_no, "reading transcript");
            }
            if text.trim().is_empty() {
                continue;
            }
            let line = TranscriptLine::parse(self.line_no, &text)?;
            return Ok(Some((self.line_no, line)));
        }
        Ok(None)
    }
}

impl<R> std::fmt::Debug for TranscriptFileReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptFileReader")
            .field("line_no", &self.line_no)
            .finish()
    }
}
