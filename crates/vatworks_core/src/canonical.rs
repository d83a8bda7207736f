//! Canonical JSON rendering for syscall comparison.
//!
//! Two syscalls are equal when their canonical strings are byte-identical:
//! object keys sorted, no insignificant whitespace, numbers as serde_json
//! renders them.

use serde_json::Value;

/// Render a JSON value canonically
#[must_use]
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// Compare two JSON values by canonical rendering
#[must_use]
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    to_canonical_string(a) == to_canonical_string(b)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
