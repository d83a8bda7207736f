//! Worker wire messages.
//!
//! Deliveries, syscalls and their results travel between the manager and a
//! worker as JSON tagged arrays (`[kind, ...args]`). Each family is decoded once,
//! at the boundary, into a closed enum; everything past the transport works
//! with the typed form. Serde impls go through the wire representation so the
//! same types can be embedded in transcript records.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use std::sync::Arc;

/// A syscall a vat makes during a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum VatSyscall {
    /// Send a message to a target
    Send {
        /// Target vref
        target: String,
        /// Capdata for method name and arguments
        methargs: Value,
        /// Result promise vref, if any
        result: Option<String>,
    },
    /// Subscribe to a promise
    Subscribe {
        /// Promise vref
        vpid: String,
    },
    /// Resolve promises
    Resolve {
        /// `[[vpid, rejected, capdata], ...]`
        resolutions: Value,
    },
    /// Terminate the vat
    Exit {
        /// Whether the exit reports a failure
        is_failure: bool,
        /// Completion capdata
        info: Value,
    },
    /// Drop imported references
    DropImports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Retire imported references
    RetireImports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Retire exported references
    RetireExports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Abandon exported references
    AbandonExports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Read a vatstore key
    VatstoreGet {
        /// Key
        key: String,
    },
    /// Find the key following `prior_key`
    VatstoreGetNextKey {
        /// Key to search after
        prior_key: String,
    },
    /// Write a vatstore key
    VatstoreSet {
        /// Key
        key: String,
        /// Value
        value: String,
    },
    /// Delete a vatstore key
    VatstoreDelete {
        /// Key
        key: String,
    },
    /// Synchronous device invocation
    CallNow {
        /// Device vref
        target: String,
        /// Method name
        method: String,
        /// Capdata arguments
        args: Value,
    },
}

impl VatSyscall {
    /// Wire tag for this syscall
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Subscribe { .. } => "subscribe",
            Self::Resolve { .. } => "resolve",
            Self::Exit { .. } => "exit",
            Self::DropImports { .. } => "dropImports",
            Self::RetireImports { .. } => "retireImports",
            Self::RetireExports { .. } => "retireExports",
            Self::AbandonExports { .. } => "abandonExports",
            Self::VatstoreGet { .. } => "vatstoreGet",
            Self::VatstoreGetNextKey { .. } => "vatstoreGetNextKey",
            Self::VatstoreSet { .. } => "vatstoreSet",
            Self::VatstoreDelete { .. } => "vatstoreDelete",
            Self::CallNow { .. } => "callNow",
        }
    }

    /// Key touched by a `vatstoreGet` or `vatstoreSet`
    #[must_use]
    pub fn vatstore_key(&self) -> Option<&str> {
        match self {
            Self::VatstoreGet { key } | Self::VatstoreSet { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Encode as a tagged array
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Send {
                target,
                methargs,
                result,
            } => {
                let mut msg = serde_json::Map::new();
                msg.insert("methargs".to_string(), methargs.clone());
                if let Some(result) = result {
                    msg.insert("result".to_string(), Value::String(result.clone()));
                }
                json!(["send", target, Value::Object(msg)])
            }
            Self::Subscribe { vpid } => json!(["subscribe", vpid]),
            Self::Resolve { resolutions } => json!(["resolve", resolutions]),
            Self::Exit { is_failure, info } => json!(["exit", is_failure, info]),
            Self::DropImports { vrefs }
            | Self::RetireImports { vrefs }
            | Self::RetireExports { vrefs }
            | Self::AbandonExports { vrefs } => json!([self.kind(), vrefs]),
            Self::VatstoreGet { key } => json!(["vatstoreGet", key]),
            Self::VatstoreGetNextKey { prior_key } => json!(["vatstoreGetNextKey", prior_key]),
            Self::VatstoreSet { key, value } => json!(["vatstoreSet", key, value]),
            Self::VatstoreDelete { key } => json!(["vatstoreDelete", key]),
            Self::CallNow {
                target,
                method,
                args,
            } => json!(["callNow", target, method, args]),
        }
    }

    /// Decode from a tagged array
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a tagged array of a known syscall kind
    pub fn from_wire(value: &Value) -> CoreResult<Self> {
        let (kind, args) = split_tagged(value, "syscall")?;
        let syscall = match kind {
            "send" => {
                let msg = arg(args, 1, "send.msg")?;
                let methargs = msg.get("methargs").cloned().ok_or_else(|| {
                    CoreError::InvalidEncoding {
                        reason: "send message lacks methargs".to_string(),
                    }
                })?;
                let result = match msg.get("result") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => {
                        return Err(CoreError::InvalidEncoding {
                            reason: format!("send result must be a string, got {}", other),
                        });
                    }
                };
                Self::Send {
                    target: arg_str(args, 0, "send.target")?,
                    methargs,
                    result,
                }
            }
            "subscribe" => Self::Subscribe {
                vpid: arg_str(args, 0, "subscribe.vpid")?,
            },
            "resolve" => Self::Resolve {
                resolutions: arg(args, 0, "resolve.resolutions")?.clone(),
            },
            "exit" => Self::Exit {
                is_failure: arg(args, 0, "exit.isFailure")?.as_bool().ok_or_else(|| {
                    CoreError::InvalidEncoding {
                        reason: "exit.isFailure must be a boolean".to_string(),
                    }
                })?,
                info: arg(args, 1, "exit.info")?.clone(),
            },
            "dropImports" => Self::DropImports {
                vrefs: arg_vrefs(args, "dropImports")?,
            },
            "retireImports" => Self::RetireImports {
                vrefs: arg_vrefs(args, "retireImports")?,
            },
            "retireExports" => Self::RetireExports {
                vrefs: arg_vrefs(args, "retireExports")?,
            },
            "abandonExports" => Self::AbandonExports {
                vrefs: arg_vrefs(args, "abandonExports")?,
            },
            "vatstoreGet" => Self::VatstoreGet {
                key: arg_str(args, 0, "vatstoreGet.key")?,
            },
            "vatstoreGetNextKey" => Self::VatstoreGetNextKey {
                prior_key: arg_str(args, 0, "vatstoreGetNextKey.priorKey")?,
            },
            "vatstoreSet" => Self::VatstoreSet {
                key: arg_str(args, 0, "vatstoreSet.key")?,
                value: arg_str(args, 1, "vatstoreSet.value")?,
            },
            "vatstoreDelete" => Self::VatstoreDelete {
                key: arg_str(args, 0, "vatstoreDelete.key")?,
            },
            "callNow" => Self::CallNow {
                target: arg_str(args, 0, "callNow.target")?,
                method: arg_str(args, 1, "callNow.method")?,
                args: arg(args, 2, "callNow.args")?.clone(),
            },
            other => {
                return Err(CoreError::UnknownKind {
                    family: "syscall".to_string(),
                    kind: other.to_string(),
                });
            }
        };
        Ok(syscall)
    }
}

/// The kernel's answer to a syscall
#[derive(Debug, Clone, PartialEq)]
pub enum VatSyscallResult {
    /// Success, with optional data
    Ok(Option<Value>),
    /// Failure message
    Error(String),
}

impl VatSyscallResult {
    /// Success without data
    #[must_use]
    pub fn ok_null() -> Self {
        Self::Ok(None)
    }

    /// Whether this is the `ok` branch
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Data carried by an `ok` result
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Ok(data) => data.as_ref(),
            Self::Error(_) => None,
        }
    }

    /// Encode as `["ok", data|null]` or `["error", message]`
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Ok(data) => json!(["ok", data.clone().unwrap_or(Value::Null)]),
            Self::Error(message) => json!(["error", message]),
        }
    }

    /// Decode from the wire form
    ///
    /// # Errors
    ///
    /// Returns error if the value is not an `ok`/`error` pair
    pub fn from_wire(value: &Value) -> CoreResult<Self> {
        let (kind, args) = split_tagged(value, "syscall result")?;
        match kind {
            "ok" => Ok(Self::Ok(match args.first() {
                None | Some(Value::Null) => None,
                Some(data) => Some(data.clone()),
            })),
            "error" => Ok(Self::Error(match args.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })),
            other => Err(CoreError::UnknownKind {
                family: "syscall result".to_string(),
                kind: other.to_string(),
            }),
        }
    }
}

/// One unit of work sent into a vat
#[derive(Debug, Clone, PartialEq)]
pub enum VatDelivery {
    /// Deliver a message to an exported object
    Message {
        /// Target vref
        target: String,
        /// `{methargs, result}`
        msg: Value,
    },
    /// Notify the vat of promise resolutions
    Notify {
        /// Resolutions
        resolutions: Value,
    },
    /// Drop exports
    DropExports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Retire exports
    RetireExports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Retire imports
    RetireImports {
        /// Affected vrefs
        vrefs: Vec<String>,
    },
    /// Change runtime options
    ChangeVatOptions {
        /// Option record
        options: Value,
    },
    /// Start the vat
    StartVat {
        /// Capdata vat parameters
        vat_parameters: Value,
    },
    /// Stop the vat before upgrade
    StopVat {
        /// Disconnection capdata
        disconnection: Value,
    },
    /// Ask the vat to run garbage collection and report drops
    BringOutYourDead,
}

impl VatDelivery {
    /// Wire tag for this delivery
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Notify { .. } => "notify",
            Self::DropExports { .. } => "dropExports",
            Self::RetireExports { .. } => "retireExports",
            Self::RetireImports { .. } => "retireImports",
            Self::ChangeVatOptions { .. } => "changeVatOptions",
            Self::StartVat { .. } => "startVat",
            Self::StopVat { .. } => "stopVat",
            Self::BringOutYourDead => "bringOutYourDead",
        }
    }

    /// Encode as a tagged array
    #[must_use]
    pub fn to_wire(&self) -> Value {
        match self {
            Self::Message { target, msg } => json!(["message", target, msg]),
            Self::Notify { resolutions } => json!(["notify", resolutions]),
            Self::DropExports { vrefs }
            | Self::RetireExports { vrefs }
            | Self::RetireImports { vrefs } => json!([self.kind(), vrefs]),
            Self::ChangeVatOptions { options } => json!(["changeVatOptions", options]),
            Self::StartVat { vat_parameters } => json!(["startVat", vat_parameters]),
            Self::StopVat { disconnection } => json!(["stopVat", disconnection]),
            Self::BringOutYourDead => json!(["bringOutYourDead"]),
        }
    }

    /// Decode from a tagged array
    ///
    /// # Errors
    ///
    /// Returns error if the value is not a tagged array of a known delivery kind
    pub fn from_wire(value: &Value) -> CoreResult<Self> {
        let (kind, args) = split_tagged(value, "delivery")?;
        let delivery = match kind {
            "message" => Self::Message {
                target: arg_str(args, 0, "message.target")?,
                msg: arg(args, 1, "message.msg")?.clone(),
            },
            "notify" => Self::Notify {
                resolutions: arg(args, 0, "notify.resolutions")?.clone(),
            },
            "dropExports" => Self::DropExports {
                vrefs: arg_vrefs(args, "dropExports")?,
            },
            "retireExports" => Self::RetireExports {
                vrefs: arg_vrefs(args, "retireExports")?,
            },
            "retireImports" => Self::RetireImports {
                vrefs: arg_vrefs(args, "retireImports")?,
            },
            "changeVatOptions" => Self::ChangeVatOptions {
                options: arg(args, 0, "changeVatOptions.options")?.clone(),
            },
            "startVat" => Self::StartVat {
                vat_parameters: args.first().cloned().unwrap_or(Value::Null),
            },
            "stopVat" => Self::StopVat {
                disconnection: args.first().cloned().unwrap_or(Value::Null),
            },
            "bringOutYourDead" => Self::BringOutYourDead,
            other => {
                return Err(CoreError::UnknownKind {
                    family: "delivery".to_string(),
                    kind: other.to_string(),
                });
            }
        };
        Ok(delivery)
    }
}

/// Resource usage reported by a metered worker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterUsage {
    /// Compute units consumed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<u64>,
    /// Bytes allocated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocate: Option<u64>,
    /// Live heap objects after the delivery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_heap_count: Option<u64>,
}

/// Outcome status of a delivery
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryStatus {
    /// Delivery completed, with optional payload
    Ok(Option<Value>),
    /// Deterministic vat-level failure (including metering faults)
    Error(String),
}

/// Result of one delivery: `[status, payloadOrNull, meterUsageOrNull]`
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    /// Status and payload
    pub status: DeliveryStatus,
    /// Meter usage, if the worker is metered
    pub meter_usage: Option<MeterUsage>,
}

impl DeliveryResult {
    /// Successful delivery without payload
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: DeliveryStatus::Ok(None),
            meter_usage: None,
        }
    }

    /// Successful delivery with payload
    #[must_use]
    pub fn ok_with(payload: Value) -> Self {
        Self {
            status: DeliveryStatus::Ok(Some(payload)),
            meter_usage: None,
        }
    }

    /// Failed delivery
    #[must_use]
    pub fn error(problem: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Error(problem.into()),
            meter_usage: None,
        }
    }

    /// Attach meter usage
    #[must_use]
    pub fn with_meter_usage(mut self, usage: MeterUsage) -> Self {
        self.meter_usage = Some(usage);
        self
    }

    /// Whether the delivery succeeded
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self.status, DeliveryStatus::Ok(_))
    }

    /// `"ok"` or `"error"`
    #[must_use]
    pub fn status_str(&self) -> &'static str {
        match self.status {
            DeliveryStatus::Ok(_) => "ok",
            DeliveryStatus::Error(_) => "error",
        }
    }

    /// Encode as a 3-tuple
    #[must_use]
    pub fn to_wire(&self) -> Value {
        let payload = match &self.status {
            DeliveryStatus::Ok(payload) => payload.clone().unwrap_or(Value::Null),
            DeliveryStatus::Error(problem) => Value::String(problem.clone()),
        };
        let meter = match &self.meter_usage {
            Some(usage) => serde_json::to_value(usage).unwrap_or(Value::Null),
            None => Value::Null,
        };
        json!([self.status_str(), payload, meter])
    }

    /// Decode from a 3-tuple
    ///
    /// # Errors
    ///
    /// Returns error if the status tag is unknown or the meter record is malformed
    pub fn from_wire(value: &Value) -> CoreResult<Self> {
        let (kind, args) = split_tagged(value, "delivery result")?;
        let payload = args.first().cloned().unwrap_or(Value::Null);
        let status = match kind {
            "ok" => DeliveryStatus::Ok(if payload.is_null() { None } else { Some(payload) }),
            "error" => DeliveryStatus::Error(match payload {
                Value::String(s) => s,
                other => other.to_string(),
            }),
            other => {
                return Err(CoreError::UnknownKind {
                    family: "delivery result".to_string(),
                    kind: other.to_string(),
                });
            }
        };
        let meter_usage = match args.get(1) {
            None | Some(Value::Null) => None,
            Some(meter) => Some(serde_json::from_value(meter.clone())?),
        };
        Ok(Self {
            status,
            meter_usage,
        })
    }
}

/// Handles syscalls a worker makes during a delivery
pub trait SyscallHandler: Send + Sync {
    /// Answer one syscall
    fn handle(&self, syscall: VatSyscall) -> VatSyscallResult;
}

/// Shared syscall handler
pub type SharedSyscallHandler = Arc<dyn SyscallHandler>;

impl<F> SyscallHandler for F
where
    F: Fn(VatSyscall) -> VatSyscallResult + Send + Sync,
{
    fn handle(&self, syscall: VatSyscall) -> VatSyscallResult {
        self(syscall)
    }
}

macro_rules! wire_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.to_wire().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = Value::deserialize(deserializer)?;
                Self::from_wire(&value).map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_serde!(VatSyscall);
wire_serde!(VatSyscallResult);
wire_serde!(VatDelivery);
wire_serde!(DeliveryResult);

fn split_tagged<'a>(value: &'a Value, family: &str) -> CoreResult<(&'a str, &'a [Value])> {
    let items = value.as_array().ok_or_else(|| CoreError::InvalidEncoding {
        reason: format!("{} must be a tagged array", family),
    })?;
    let (tag, rest) = items.split_first().ok_or_else(|| CoreError::InvalidEncoding {
        reason: format!("empty {} array", family),
    })?;
    let tag = tag.as_str().ok_or_else(|| CoreError::InvalidEncoding {
        reason: format!("{} tag must be a string", family),
    })?;
    Ok((tag, rest))
}

fn arg<'a>(args: &'a [Value], idx: usize, field: &str) -> CoreResult<&'a Value> {
    args.get(idx).ok_or_else(|| CoreError::InvalidEncoding {
        reason: format!("missing {}", field),
    })
}

fn arg_str(args: &[Value], idx: usize, field: &str) -> CoreResult<String> {
    arg(args, idx, field)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidEncoding {
            reason: format!("{} must be a string", field),
        })
}

fn arg_vrefs(args: &[Value], field: &str) -> CoreResult<Vec<String>> {
    let list = arg(args, 0, field)?
        .as_array()
        .ok_or_else(|| CoreError::InvalidEncoding {
            reason: format!("{} vrefs must be an array", field),
        })?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| CoreError::InvalidEncoding {
                    reason: format!("{} vref must be a string", field),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_wire_shapes() {
        let set = VatSyscall::VatstoreSet {
            key: "vc.1.|label".to_string(),
            value: "thing".to_string(),
        };
        assert_eq!(set.to_wire(), json!(["vatstoreSet", "vc.1.|label", "thing"]));
        assert_eq!(set.kind(), "vatstoreSet");
        assert_eq!(set.vatstore_key(), Some("vc.1.|label"));

        let send = VatSyscall::Send {
            target: "o-5".to_string(),
            methargs: json!({"body": "#[\"go\",[]]", "slots": []}),
            result: None,
        };
        assert_eq!(
            send.to_wire(),
            json!(["send", "o-5", {"methargs": {"body": "#[\"go\",[]]", "slots": []}}])
        );
    }

    #[test]
    fn test_syscall_decode_send_with_result() {
        let wire = json!(["send", "o-1", {"methargs": {"body": "x", "slots": []}, "result": "p+7"}]);
        let syscall = VatSyscall::from_wire(&wire).unwrap();
        match &syscall {
            VatSyscall::Send { target, result, .. } => {
                assert_eq!(target, "o-1");
                assert_eq!(result.as_deref(), Some("p+7"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(syscall.to_wire(), wire);
    }

    #[test]
    fn test_unknown_syscall_kind() {
        let err = VatSyscall::from_wire(&json!(["teleport", "v1"])).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownKind {
                family: "syscall".to_string(),
                kind: "teleport".to_string(),
            }
        );
    }

    #[test]
    fn test_syscall_missing_argument() {
        assert!(VatSyscall::from_wire(&json!(["vatstoreSet", "k"])).is_err());
        assert!(VatSyscall::from_wire(&json!("vatstoreGet")).is_err());
        assert!(VatSyscall::from_wire(&json!([])).is_err());
    }

    #[test]
    fn test_syscall_result_wire() {
        assert_eq!(VatSyscallResult::ok_null().to_wire(), json!(["ok", null]));
        assert_eq!(
            VatSyscallResult::from_wire(&json!(["ok", "7"])).unwrap(),
            VatSyscallResult::Ok(Some(json!("7")))
        );
        assert_eq!(
            VatSyscallResult::from_wire(&json!(["error", "no such key"])).unwrap(),
            VatSyscallResult::Error("no such key".to_string())
        );
        assert!(VatSyscallResult::from_wire(&json!(["maybe", 1])).is_err());
    }

    #[test]
    fn test_delivery_wire() {
        let boyd = VatDelivery::from_wire(&json!(["bringOutYourDead"])).unwrap();
        assert_eq!(boyd, VatDelivery::BringOutYourDead);
        let start = VatDelivery::from_wire(&json!(["startVat", {"body": "{}", "slots": []}])).unwrap();
        assert_eq!(start.kind(), "startVat");
        let json = serde_json::to_string(&VatDelivery::DropExports {
            vrefs: vec!["o+1".to_string()],
        })
        .unwrap();
        assert_eq!(json, r#"["dropExports",["o+1"]]"#);
    }

    #[test]
    fn test_delivery_result_wire() {
        let result = DeliveryResult::error("Compute meter exceeded").with_meter_usage(MeterUsage {
            compute: Some(100),
            ..MeterUsage::default()
        });
        let wire = result.to_wire();
        assert_eq!(wire, json!(["error", "Compute meter exceeded", {"compute": 100}]));
        let back = DeliveryResult::from_wire(&wire).unwrap();
        assert_eq!(back, result);
        assert!(!back.is_ok());

        let ok = DeliveryResult::from_wire(&json!(["ok", null, null])).unwrap();
        assert_eq!(ok, DeliveryResult::ok());
    }

    #[test]
    fn test_closure_as_handler() {
        let handler: SharedSyscallHandler = Arc::new(|syscall: VatSyscall| match syscall {
            VatSyscall::VatstoreGet { .. } => VatSyscallResult::Ok(Some(json!("1"))),
            _ => VatSyscallResult::ok_null(),
        });
        let got = handler.handle(VatSyscall::VatstoreGet {
            key: "k".to_string(),
        });
        assert_eq!(got.data(), Some(&json!("1")));
    }
}
