//! Step input fingerprints.
//!
//! A fingerprint is the hex SHA-256 of the step kind, the step name and the
//! canonical JSON of the step input. Object keys are sorted recursively so
//! the digest does not depend on map iteration order.

use serde_json::Value;
use sha2::{Digest, Sha256};
use waystation_types::step::StepKind;

/// Compute the fingerprint recorded with a step.
pub fn fingerprint(kind: StepKind, name: &str, input: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(input).as_bytes());
    hex_encode(&hasher.finalize())
}

/// Serialize a JSON value with object keys in sorted order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
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
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Lowercase hex encoding.
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_fingerprint() {
        let a = json!({"url": "http://x", "headers": {"b": "2", "a": "1"}});
        let b: Value =
            serde_json::from_str(r#"{"headers":{"a":"1","b":"2"},"url":"http://x"}"#).unwrap();
        assert_eq!(
            fingerprint(StepKind::Call, "post call", &a),
            fingerprint(StepKind::Call, "post call", &b)
        );
    }

    #[test]
    fn kind_and_name_are_part_of_the_digest() {
        let input = json!(null);
        let generic = fingerprint(StepKind::Generic, "step", &input);
        assert_ne!(generic, fingerprint(StepKind::Sleep, "step", &input));
        assert_ne!(generic, fingerprint(StepKind::Generic, "other", &input));
        assert_eq!(generic.len(), 64);
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"z": [{"b": 1, "a": 2}], "a": "s"});
        assert_eq!(canonical_json(&v), r#"{"a":"s","z":[{"a":2,"b":1}]}"#);
    }

    #[test]
    fn hex_encode_pads_bytes() {
        assert_eq!(hex_encode(&[0x00, 0x0f, 0xab]), "000fab");
    }
}
