//! Canonical JSON serialization.
//!
//! Every signature-bearing object in the mesh serializes to a single
//! canonical form: object keys sorted lexicographically at every level,
//! compact separators, no insignificant whitespace. The `signatures` and
//! `signature` fields are stripped from the top level before signing so a
//! signature can be attached to the object it covers.

use serde::Serialize;
use serde_json::Value;

use crate::signing::CryptoError;

/// Serialize an object to its canonical byte form for signing.
///
/// Strips the top-level `signatures` / `signature` field, then renders
/// the remainder as canonical JSON.
pub fn signing_bytes<T: Serialize>(object: &T) -> Result<Vec<u8>, CryptoError> {
    let mut value = serde_json::to_value(object)
        .map_err(|e| CryptoError::Canonicalization(e.to_string()))?;

    if let Value::Object(ref mut map) = value {
        map.remove("signatures");
        map.remove("signature");
    }

    Ok(to_canonical_json(&value).into_bytes())
}

/// Render a JSON value in canonical form.
///
/// Scalars use serde_json's stable formatting; objects are written with
/// keys in lexicographic order regardless of the backing map's ordering.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_scalar(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
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
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut String) {
    // Null, bool, number, and string formatting is delegated to serde_json,
    // which is stable for a given value.
    match serde_json::to_string(value) {
        Ok(s) => out.push_str(&s),
        Err(_) => out.push_str("null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_recursively() {
        let value = json!({
            "zulu": {"b": 2, "a": 1},
            "alpha": [{"y": true, "x": false}]
        });
        assert_eq!(
            to_canonical_json(&value),
            r#"{"alpha":[{"x":false,"y":true}],"zulu":{"a":1,"b":2}}"#
        );
    }

    #[test]
    fn test_no_insignificant_whitespace() {
        let value = json!({"a": [1, 2, 3], "b": "text with spaces"});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"a":[1,2,3],"b":"text with spaces"}"#
        );
    }

    #[test]
    fn test_signing_bytes_strips_signature_fields() {
        let value = json!({
            "name": "n",
            "signatures": [{"key_id": "k", "sig": "s"}],
            "signature": "raw"
        });
        let bytes = signing_bytes(&value).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"name":"n"}"#);
    }

    #[test]
    fn test_string_escaping() {
        let value = json!({"msg": "line\nbreak \"quoted\""});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"msg":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_deterministic_across_calls() {
        let value = json!({"c": 3, "a": 1, "b": {"z": 0, "y": [null, true]}});
        assert_eq!(to_canonical_json(&value), to_canonical_json(&value));
    }

    #[test]
    fn test_number_formatting_stable() {
        let value = json!({"n": 1700000000000u64, "f": 0.5, "neg": -3});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"f":0.5,"n":1700000000000,"neg":-3}"#
        );
    }
}
