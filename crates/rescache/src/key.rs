//! Cache key hasher: maps arbitrary argument values to a stable string key.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

/// Optional caller-supplied key serializer.
///
/// Runs before canonical stringification: if it returns `Value::String`,
/// that string is used verbatim as the key; any other `Value` variant is
/// canonically stringified the same way a plain argument would be.
pub type KeySerializer<P> = Arc<dyn Fn(&P) -> Value + Send + Sync>;

/// Compute the cache key for a call's arguments.
pub fn hash_key<P: Serialize>(args: &P, serializer: Option<&KeySerializer<P>>) -> String {
    let value = match serializer {
        Some(f) => f(args),
        None => serde_json::to_value(args).unwrap_or(Value::Null),
    };

    if let Value::String(s) = &value {
        return s.clone();
    }

    canonical_stringify(&value)
}

/// Canonical, key-sorted stringification of a JSON value.
///
/// Object keys are emitted in lexicographic order, recursively; arrays
/// preserve element order; scalars use their natural textual form. Because
/// `serde_json::Value` is a tree (not a graph), cyclic input cannot be
/// constructed through the public API, so the "must fail deterministically
/// on cycles" requirement holds vacuously.
#[must_use]
pub fn canonical_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
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
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                // Safety of indexing: `key` came from iterating `map.keys()`.
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
    }
}
