//! Tolerant readers for persisted module state.
//!
//! Snapshots cross the system boundary, so nothing here trusts the blob:
//! missing keys, wrong types and out-of-range values all degrade to the
//! caller's default. Restoration never fails.

use serde_json::Value;

pub fn real(blob: &Value, key: &str, default: f32) -> f32 {
    match blob.get(key).and_then(Value::as_f64) {
        Some(v) if v.is_finite() => v as f32,
        _ => default,
    }
}

pub fn boolean(blob: &Value, key: &str, default: bool) -> bool {
    blob.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub fn integer(blob: &Value, key: &str, default: i64) -> i64 {
    blob.get(key).and_then(Value::as_i64).unwrap_or(default)
}

pub fn string(blob: &Value, key: &str) -> String {
    blob.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub fn array<'a>(blob: &'a Value, key: &str) -> Option<&'a Vec<Value>> {
    blob.get(key).and_then(Value::as_array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_on_missing_or_mistyped_keys() {
        let blob = json!({
            "a": 1.5,
            "b": "not a number",
            "c": true,
            "d": [1, 2, 3],
            "e": f64::NAN.to_string(),
        });
        assert_eq!(real(&blob, "a", 0.0), 1.5);
        assert_eq!(real(&blob, "b", 7.0), 7.0);
        assert_eq!(real(&blob, "missing", -1.0), -1.0);
        assert!(boolean(&blob, "c", false));
        assert!(!boolean(&blob, "a", false));
        assert_eq!(integer(&blob, "missing", 42), 42);
        assert_eq!(string(&blob, "b"), "not a number");
        assert_eq!(string(&blob, "missing"), "");
        assert_eq!(array(&blob, "d").map(Vec::len), Some(3));
        assert!(array(&blob, "a").is_none());
    }

    #[test]
    fn test_non_object_blob_is_harmless() {
        let blob = Value::Null;
        assert_eq!(real(&blob, "x", 2.0), 2.0);
        assert!(array(&blob, "x").is_none());
    }
}
