//! Minimal worker speaking the vatworks pipe protocol.
//!
//! Keeps a delivery counter on its heap and mirrors it into the vatstore.
//! Message deliveries whose method is `fail`, `throw` or `crash` exercise the
//! vat-error, worker-exception and process-exit paths.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::process::ExitCode;
use tokio::io::{Stdin, Stdout};
use tokio_util::codec::{FramedRead, FramedWrite};
use vatworks_core::{VatDelivery, VatSyscall, VatSyscallResult};
use vatworks_transport::{Frame, NetstringCodec, TransportError};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Heap {
    #[serde(rename = "vatID", default)]
    vat_id: Option<String>,
    count: u64,
}

struct Pipe {
    reader: FramedRead<Stdin, NetstringCodec>,
    writer: FramedWrite<Stdout, NetstringCodec>,
}

impl Pipe {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.writer.send(frame.into_bytes()).await
    }

    async fn reply(&mut self, body: impl Into<Bytes>) -> Result<(), TransportError> {
        self.send(Frame::Reply(body.into())).await
    }

    async fn syscall(&mut self, syscall: VatSyscall) -> Result<VatSyscallResult, TransportError> {
        let body = Bytes::from(syscall.to_wire().to_string());
        self.send(Frame::Request(body)).await?;
        match self.reader.next().await {
            Some(raw) => match Frame::parse(raw?)? {
                Frame::SyscallResponse(body) => {
                    let value: Value = serde_json::from_slice(&body).map_err(|e| {
                        TransportError::Protocol {
                            reason: e.to_string(),
                        }
                    })?;
                    Ok(VatSyscallResult::from_wire(&value)?)
                }
                other => Err(TransportError::Protocol {
                    reason: format!("expected syscall response, got {:?}", other),
                }),
            },
            None => Err(TransportError::Closed),
        }
    }
}

/// Method name from a `message` delivery's capdata body (`#["name", args]`)
fn method_of(msg: &Value) -> Option<String> {
    let body = msg.get("methargs")?.get("body")?.as_str()?;
    let parsed: Value = serde_json::from_str(body.strip_prefix('#').unwrap_or(body)).ok()?;
    parsed.get(0)?.as_str().map(str::to_string)
}

async fn deliver(pipe: &mut Pipe, heap: &mut Heap, delivery: VatDelivery) -> Result<(), TransportError> {
    let VatDelivery::Message { msg, .. } = delivery else {
        return pipe.reply(json!(["ok", null, null]).to_string()).await;
    };
    match method_of(&msg).as_deref() {
        Some("crash") => std::process::exit(3),
        Some("throw") => {
            return pipe
                .send(Frame::Exception(Bytes::from_static(b"thrown on request")))
                .await;
        }
        Some("fail") => {
            return pipe
                .reply(json!(["error", "failure on request", null]).to_string())
                .await;
        }
        _ => {}
    }

    let stored = pipe
        .syscall(VatSyscall::VatstoreGet {
            key: "count".to_string(),
        })
        .await?;
    if let Some(Value::String(s)) = stored.data() {
        if s.parse::<u64>().ok() != Some(heap.count) {
            return pipe
                .reply(json!(["error", "vatstore disagrees with heap", null]).to_string())
                .await;
        }
    }
    heap.count += 1;
    pipe.syscall(VatSyscall::VatstoreSet {
        key: "count".to_string(),
        value: heap.count.to_string(),
    })
    .await?;

    let mut body = json!({"compute": heap.count}).to_string().into_bytes();
    body.push(vatworks_transport::codec::METER_SEPARATOR);
    body.extend_from_slice(json!(["ok", null, null]).to_string().as_bytes());
    pipe.reply(body).await
}

async fn run() -> Result<(), TransportError> {
    let mut heap = Heap::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--snapshot" {
            let path = args.next().ok_or_else(|| TransportError::Protocol {
                reason: "--snapshot needs a path".to_string(),
            })?;
            let bytes = std::fs::read(path)?;
            heap = serde_json::from_slice(&bytes).map_err(|e| TransportError::Protocol {
                reason: format!("bad snapshot: {}", e),
            })?;
        }
    }

    let mut pipe = Pipe {
        reader: FramedRead::new(tokio::io::stdin(), NetstringCodec::new()),
        writer: FramedWrite::new(tokio::io::stdout(), NetstringCodec::new()),
    };
    while let Some(raw) = pipe.reader.next().await {
        let Frame::Request(body) = Frame::parse(raw?)? else {
            return Err(TransportError::Protocol {
                reason: "expected a command".to_string(),
            });
        };
        let command: Value = serde_json::from_slice(&body).map_err(|e| TransportError::Protocol {
            reason: e.to_string(),
        })?;
        match command.get(0).and_then(Value::as_str) {
            Some("setBundle") => {
                heap.vat_id = command.get(1).and_then(Value::as_str).map(str::to_string);
                pipe.reply(Bytes::new()).await?;
            }
            Some("deliver") => {
                let delivery = VatDelivery::from_wire(command.get(1).unwrap_or(&Value::Null))?;
                deliver(&mut pipe, &mut heap, delivery).await?;
            }
            Some("snapshot") => {
                let bytes = serde_json::to_vec(&heap).map_err(|e| TransportError::Protocol {
                    reason: e.to_string(),
                })?;
                pipe.reply(bytes).await?;
            }
            other => {
                return Err(TransportError::Protocol {
                    reason: format!("unknown command {:?}", other),
                });
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("vatworks-echo-worker: {}", err);
            ExitCode::FAILURE
        }
    }
}
