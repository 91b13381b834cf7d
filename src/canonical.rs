//! Canonical Encoder (C1)
//!
//! Deterministic serialization of structured values so that semantically
//! equal values hash identically: object keys sorted lexicographically, no
//! insignificant whitespace, fixed numeric formatting, UTF-8 text. Every spot
//! that needs a reproducible hash (the ledger's hash chain, Merkle leaves,
//! the exported audit document) goes through this module rather than
//! `serde_json::to_string` directly, since `serde_json`'s default map
//! ordering is insertion order, not sorted.

use serde_json::Value;

/// Render a JSON value into its canonical byte form.
///
/// Maps are rewritten with lexicographically sorted keys (recursively);
/// arrays keep their order since order is significant there. Numbers print
/// via `serde_json`'s own formatter, which is already deterministic for a
/// given `Value`.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

/// Canonical encoding as a UTF-8 string. Convenience wrapper over
/// `canonical_bytes` for callers building a hash preimage from parts that
/// are already text.
pub fn canonical_string(value: &Value) -> String {
    String::from_utf8(canonical_bytes(value)).expect("canonical encoding is always valid UTF-8")
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_json_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            out.push(b'{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_json_string(key, out);
                out.push(b':');
                write_canonical(&map[*key], out);
            }
            out.push(b'}');
        }
    }
}

fn write_json_string(s: &str, out: &mut Vec<u8>) {
    // serde_json's string escaping is already minimal/deterministic; reuse it
    // rather than hand-rolling escape rules that could drift from the parser.
    let encoded = serde_json::to_string(s).expect("string always serializes");
    out.extend_from_slice(encoded.as_bytes());
}

/// Build a canonical JSON object from `(key, value)` pairs. Keys need not be
/// pre-sorted — `canonical_bytes` sorts them.
pub fn canonical_object(fields: Vec<(&str, Value)>) -> Value {
    Value::Object(fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_object_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
        assert_eq!(canonical_string(&a), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn nested_objects_sort_recursively() {
        let v = json!({"z": {"y": 1, "x": 2}, "a": 1});
        assert_eq!(canonical_string(&v), r#"{"a":1,"z":{"x":2,"y":1}}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let v = json!([3, 1, 2]);
        assert_eq!(canonical_string(&v), "[3,1,2]");
    }

    #[test]
    fn distinct_values_encode_distinctly() {
        let a = json!({"project": "api", "action": "store"});
        let b = json!({"project": "api", "action": "deprecate"});
        assert_ne!(canonical_bytes(&a), canonical_bytes(&b));
    }
}
