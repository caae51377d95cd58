//! Deterministic deep-merge and sanitization of card attribute trees.
//!
//! Card data bags are free-form JSON merged at runtime from many partial
//! tool-call updates. The merge must be deterministic, side-effect free, and
//! dedupe list entries so repeated upserts converge instead of growing the
//! bag without bound.
//!
//! Semantics:
//! - strings are trimmed; array elements are deduplicated by a stable
//!   content key (strings compared trimmed and case-insensitively,
//!   objects/arrays by canonical sorted-key stringification; first
//!   occurrence wins and keeps its casing)
//! - merging two arrays concatenates then sanitizes
//! - merging two objects recurses per key
//! - otherwise the source wins when present (`null` is treated as absent)
//!
//! Merging a scalar with an object or array is not type-checked: the source
//! overwrites. This is a known looseness inherited from the data model, not
//! a bug to silently fix.

use serde_json::{Map, Value};

/// Normalize a structured value: trim strings, recurse into containers, and
/// deduplicate array elements.
pub fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::Array(items) => {
            let mut seen = Vec::new();
            let mut result = Vec::new();
            for item in items {
                let sanitized = sanitize_value(item);
                let key = dedup_key(&sanitized);
                if !seen.contains(&key) {
                    seen.push(key);
                    result.push(sanitized);
                }
            }
            Value::Array(result)
        }
        Value::Object(fields) => {
            let mut out = Map::new();
            for (key, val) in fields {
                out.insert(key.clone(), sanitize_value(val));
            }
            Value::Object(out)
        }
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

/// Deep-merge `source` into `target`, returning a new value.
///
/// Neither input is mutated. Arrays concatenate then dedupe; objects merge
/// key-wise; on any other combination the source wins when present.
pub fn merge_values(target: &Value, source: &Value) -> Value {
    match (target, source) {
        (Value::Array(a), Value::Array(b)) => {
            let mut combined = a.clone();
            combined.extend(b.iter().cloned());
            sanitize_value(&Value::Array(combined))
        }
        (Value::Object(a), Value::Object(b)) => {
            let mut out = Map::new();
            for (key, target_val) in a {
                match b.get(key) {
                    Some(source_val) => {
                        out.insert(key.clone(), merge_values(target_val, source_val));
                    }
                    None => {
                        out.insert(key.clone(), sanitize_value(target_val));
                    }
                }
            }
            for (key, source_val) in b {
                if !a.contains_key(key) {
                    out.insert(key.clone(), sanitize_value(source_val));
                }
            }
            Value::Object(out)
        }
        (target, Value::Null) => sanitize_value(target),
        (_, source) => sanitize_value(source),
    }
}

/// Sanitize an optional value into an object map, discarding non-objects.
pub fn sanitize_object(value: Option<&Value>) -> Map<String, Value> {
    match value.map(sanitize_value) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

/// Merge two object maps via [`merge_values`].
pub fn merge_objects(target: &Map<String, Value>, source: &Map<String, Value>) -> Map<String, Value> {
    match merge_values(
        &Value::Object(target.clone()),
        &Value::Object(source.clone()),
    ) {
        Value::Object(map) => map,
        // merge of two objects always yields an object
        _ => Map::new(),
    }
}

/// Stable content key used to deduplicate array elements.
fn dedup_key(value: &Value) -> String {
    match value {
        Value::String(s) => format!("s:{}", s.trim().to_lowercase()),
        other => format!("v:{}", stable_stringify(other)),
    }
}

/// Canonical stringification: object keys sorted, nested strings compared
/// trimmed and lowercased so structurally equal values collide.
fn stable_stringify(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(stable_stringify).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    let val = &fields[key];
                    format!("{}:{}", Value::String(key.clone()), stable_stringify(val))
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::String(s) => Value::String(s.trim().to_lowercase()).to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_trim() {
        assert_eq!(sanitize_value(&json!("  hello  ")), json!("hello"));
    }

    #[test]
    fn test_array_dedup_case_whitespace_insensitive() {
        let input = json!([" Foo", "foo ", "bar"]);
        assert_eq!(sanitize_value(&input), json!(["Foo", "bar"]));
    }

    #[test]
    fn test_array_dedup_structural() {
        let input = json!([{"a": 1, "b": 2}, {"b": 2, "a": 1}, {"a": 2}]);
        let sanitized = sanitize_value(&input);
        assert_eq!(sanitized.as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_merge_arrays_concat_then_dedup() {
        let merged = merge_values(&json!(["a", "b"]), &json!(["B", "c"]));
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn test_merge_objects_recursive() {
        let target = json!({"traits": ["brave"], "hp": 10});
        let source = json!({"traits": ["clever"], "name": "Mira"});
        let merged = merge_values(&target, &source);
        assert_eq!(
            merged,
            json!({"traits": ["brave", "clever"], "hp": 10, "name": "Mira"})
        );
    }

    #[test]
    fn test_scalar_source_wins() {
        assert_eq!(merge_values(&json!(1), &json!(2)), json!(2));
        // mixed types: source overwrites, by policy
        assert_eq!(merge_values(&json!({"a": 1}), &json!("flat")), json!("flat"));
    }

    #[test]
    fn test_null_source_keeps_target() {
        assert_eq!(merge_values(&json!("kept"), &Value::Null), json!("kept"));
    }

    #[test]
    fn test_merge_idempotence() {
        let values = [
            json!({"a": [" x", "X"], "b": {"c": "  y "}}),
            json!(["dup", "DUP ", 3, 3]),
            json!("  padded  "),
            json!(42),
        ];
        for value in &values {
            let sanitized = sanitize_value(value);
            assert_eq!(merge_values(value, &sanitized), sanitized);
        }
    }

    #[test]
    fn test_merge_disjoint_keys_associative() {
        let a = json!({"a": 1});
        let b = json!({"b": 2});
        let both = json!({"a": 1, "b": 2});
        let stepwise = merge_values(&merge_values(&json!({}), &a), &b);
        let single = merge_values(&json!({}), &both);
        assert_eq!(stepwise, single);
    }

    #[test]
    fn test_inputs_not_mutated() {
        let target = json!({"list": ["a"]});
        let source = json!({"list": ["b"]});
        let _ = merge_values(&target, &source);
        assert_eq!(target, json!({"list": ["a"]}));
        assert_eq!(source, json!({"list": ["b"]}));
    }

    #[test]
    fn test_sanitize_object_discards_non_objects() {
        assert!(sanitize_object(Some(&json!("not an object"))).is_empty());
        assert!(sanitize_object(None).is_empty());
        let map = sanitize_object(Some(&json!({"k": " v "})));
        assert_eq!(map.get("k"), Some(&json!("v")));
    }
}
