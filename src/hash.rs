//! Canonical serialization and SHA-256 digesting used for fingerprints,
//! outcome hashes, idempotency keys, and lock/state keys.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const CIRCULAR_MARKER: &str = "\"[Circular]\"";
const MAX_DEPTH: usize = 256;

/// Serialize a `serde_json::Value` to a canonical string: object keys sorted
/// lexicographically, arrays kept in order, primitives via their literal JSON
/// form. Owned `Value` trees built from safe Rust can never contain cycles,
/// but a depth guard keeps pathological inputs from blowing the stack and
/// mirrors the source's defensive cycle handling by degrading to the same
/// `"[Circular]"` marker rather than panicking.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, 0, &mut out);
    out
}

fn write_stable(value: &Value, depth: usize, out: &mut String) {
    if depth > MAX_DEPTH {
        out.push_str(CIRCULAR_MARKER);
        return;
    }
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).unwrap_or_default());
                out.push(':');
                write_stable(v, depth + 1, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(v, depth + 1, out);
            }
            out.push(']');
        }
        other => out.push_str(&serde_json::to_string(other).unwrap_or_else(|_| "null".into())),
    }
}

/// SHA-256 hex digest of the canonical serialization of `value`.
pub fn digest_stable(value: &Value) -> String {
    let serialized = stable_stringify(value);
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of a raw string (used for idempotency/resource keys,
/// which are plain strings rather than structured args).
pub fn digest_str(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

/// Loop-breaker identity: `toolName:SHA256(args)`.
pub fn build_fingerprint(tool_name: &str, args: Option<&Value>) -> String {
    let args_value = args.cloned().unwrap_or(Value::Null);
    format!("{}:{}", tool_name, digest_stable(&args_value))
}

/// Outcome summary used to detect no-progress streaks.
#[derive(Debug, Clone)]
pub struct OutcomeSummary<'a> {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub code: Option<&'a str>,
    pub message: Option<&'a str>,
    pub data: Option<&'a Value>,
}

/// SHA-256 digest of the canonical `{ok, statusCode, code, message, data}` tuple.
pub fn build_outcome_hash(summary: &OutcomeSummary<'_>) -> String {
    let value = serde_json::json!({
        "ok": summary.ok,
        "statusCode": summary.status_code,
        "code": summary.code,
        "message": summary.message,
        "data": summary.data,
    });
    digest_stable(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_affect_digest() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(digest_stable(&a), digest_stable(&b));
    }

    #[test]
    fn array_order_does_affect_digest() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(digest_stable(&a), digest_stable(&b));
    }

    #[test]
    fn fingerprint_is_order_independent_over_object_keys() {
        let fp1 = build_fingerprint("search", Some(&json!({"q": "x", "limit": 5})));
        let fp2 = build_fingerprint("search", Some(&json!({"limit": 5, "q": "x"})));
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn fingerprint_differs_by_tool_name() {
        let fp1 = build_fingerprint("search", Some(&json!({"q": "x"})));
        let fp2 = build_fingerprint("fetch", Some(&json!({"q": "x"})));
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn missing_args_hashes_as_null() {
        let fp1 = build_fingerprint("search", None);
        let fp2 = build_fingerprint("search", Some(&Value::Null));
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn outcome_hash_matches_for_identical_summaries() {
        let s1 = OutcomeSummary {
            ok: false,
            status_code: Some(503),
            code: Some("NETWORK_ERROR"),
            message: Some("timed out"),
            data: None,
        };
        let s2 = OutcomeSummary {
            ok: false,
            status_code: Some(503),
            code: Some("NETWORK_ERROR"),
            message: Some("timed out"),
            data: None,
        };
        assert_eq!(build_outcome_hash(&s1), build_outcome_hash(&s2));
    }

    #[test]
    fn deep_nesting_does_not_panic() {
        let mut value = json!(1);
        for _ in 0..(MAX_DEPTH + 50) {
            value = json!([value]);
        }
        let _ = stable_stringify(&value);
    }
}
