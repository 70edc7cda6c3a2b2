//! Pure tree transforms over JSON values.
//!
//! Each function visits every leaf, decides, and rebuilds a new value; the
//! input is never mutated. Only string leaves are ever transformed, so
//! numbers, booleans, nulls and the shape of objects and arrays survive a
//! seal/open round trip unchanged.

use serde_json::{Map, Value};

use crate::crypto::{is_envelope, CipherError, FieldCipher};

/// A string leaf that could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFailure {
    /// Dotted path below the field, empty for the field itself.
    pub path: String,
    pub reason: String,
}

/// `true` for a non-blank string that is not already an envelope.
pub fn needs_sealing(s: &str) -> bool {
    !s.trim().is_empty() && !is_envelope(s)
}

/// Encrypt every string leaf that needs it.
///
/// # Errors
///
/// The first cipher failure aborts the whole transform.
pub fn seal(value: &Value, cipher: &FieldCipher) -> Result<Value, CipherError> {
    Ok(match value {
        Value::String(s) if needs_sealing(s) => Value::String(cipher.encrypt(s)?),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), seal(v, cipher)?);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| seal(v, cipher))
                .collect::<Result<_, _>>()?,
        ),
        other => other.clone(),
    })
}

/// Decrypt every envelope-shaped string leaf.
///
/// A leaf that fails to decrypt keeps its stored value and is reported in
/// `failures`; its siblings are still opened.
pub fn open(value: &Value, cipher: &FieldCipher, failures: &mut Vec<OpenFailure>) -> Value {
    open_at(value, cipher, String::new(), failures)
}

fn open_at(value: &Value, cipher: &FieldCipher, path: String, failures: &mut Vec<OpenFailure>) -> Value {
    match value {
        Value::String(s) if is_envelope(s) => match cipher.decrypt(s) {
            Ok(plain) => Value::String(plain),
            Err(e) => {
                failures.push(OpenFailure {
                    path,
                    reason: e.to_string(),
                });
                value.clone()
            }
        },
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), open_at(v, cipher, child(&path, k), failures)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| open_at(v, cipher, child(&path, &i.to_string()), failures))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

/// Number of string leaves that still need sealing.
pub fn pending_leaves(value: &Value) -> usize {
    match value {
        Value::String(s) => usize::from(needs_sealing(s)),
        Value::Object(map) => map.values().map(pending_leaves).sum(),
        Value::Array(items) => items.iter().map(pending_leaves).sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::{tamper, test_cipher};
    use serde_json::json;

    fn contact() -> Value {
        json!({
            "name": "Dana",
            "phone": "555-0100",
            "priority": 2,
            "verified": true,
            "fax": null,
            "tags": ["primary", 7, {"note": "call after 5"}],
            "blank": "  "
        })
    }

    #[test]
    fn round_trip_preserves_shape_and_non_string_leaves() {
        let cipher = test_cipher();
        let original = contact();
        let sealed = seal(&original, &cipher).unwrap();

        assert!(is_envelope(sealed["name"].as_str().unwrap()));
        assert!(is_envelope(sealed["tags"][2]["note"].as_str().unwrap()));
        assert_eq!(sealed["priority"], 2);
        assert_eq!(sealed["verified"], true);
        assert_eq!(sealed["fax"], Value::Null);
        assert_eq!(sealed["tags"][1], 7);
        assert_eq!(sealed["blank"], "  ");

        let mut failures = Vec::new();
        let opened = open(&sealed, &cipher, &mut failures);
        assert!(failures.is_empty());
        assert_eq!(opened, original);
    }

    #[test]
    fn sealing_is_idempotent() {
        let cipher = test_cipher();
        let once = seal(&contact(), &cipher).unwrap();
        let twice = seal(&once, &cipher).unwrap();
        assert_eq!(once, twice);
        assert_eq!(pending_leaves(&once), 0);
    }

    #[test]
    fn pending_counts_only_plain_strings() {
        assert_eq!(pending_leaves(&contact()), 4);
        assert_eq!(pending_leaves(&json!(42)), 0);
        assert_eq!(pending_leaves(&json!("")), 0);
    }

    #[test]
    fn corrupted_leaf_fails_alone() {
        let cipher = test_cipher();
        let mut sealed = seal(&json!({"a": "one", "b": "two"}), &cipher).unwrap();
        sealed["a"] = json!(tamper(sealed["a"].as_str().unwrap()));

        let mut failures = Vec::new();
        let opened = open(&sealed, &cipher, &mut failures);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, "a");
        assert_eq!(opened["b"], "two");
    }

    #[test]
    fn legacy_plaintext_passes_through_open() {
        let mut failures = Vec::new();
        let opened = open(&json!("not encrypted"), &test_cipher(), &mut failures);
        assert_eq!(opened, "not encrypted");
        assert!(failures.is_empty());
    }
}
