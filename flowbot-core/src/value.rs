//! Canonical JSON value handling.
//!
//! Everything the framework persists — per-page answers, submission history,
//! form payloads — goes through [`canonicalize`] first, so that the stored
//! shape is stable regardless of where the value came from.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Largest integer magnitude that survives a round-trip through an IEEE-754
/// double (2^53 - 1). Integers beyond this are stored as decimal strings.
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// A single accepted submission recorded against a step state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Id of the page the value was submitted on.
    pub page_id: String,
    /// The canonicalized submitted value.
    pub value: Value,
    /// When the submission was accepted (RFC-3339, UTC).
    pub timestamp: chrono::DateTime<Utc>,
}

impl HistoryEntry {
    /// Record a submission for `page_id` with the current timestamp.
    ///
    /// The value is canonicalized on the way in.
    pub fn new(page_id: impl Into<String>, value: &Value) -> Self {
        Self {
            page_id: page_id.into(),
            value: canonicalize(value),
            timestamp: Utc::now(),
        }
    }
}

/// Canonicalize an arbitrary JSON value into the persisted shape.
///
/// Rules:
/// - scalars (string, boolean, null) pass through unchanged;
/// - integers within the 53-bit safe range pass through, larger magnitudes
///   become decimal strings;
/// - non-finite floats become null;
/// - arrays recurse;
/// - objects recurse over their keys in insertion order.
///
/// The function is idempotent: `canonicalize(&canonicalize(x)) == canonicalize(x)`.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => value.clone(),
        Value::Number(n) => canonicalize_number(n),
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(canonicalize_map(map)),
    }
}

/// Canonicalize every value of a JSON object, preserving key order.
pub fn canonicalize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), canonicalize(value)))
        .collect()
}

fn canonicalize_number(n: &serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        if i.unsigned_abs() > MAX_SAFE_INTEGER {
            return Value::String(i.to_string());
        }
        return Value::Number(i.into());
    }
    if let Some(u) = n.as_u64() {
        if u > MAX_SAFE_INTEGER {
            return Value::String(u.to_string());
        }
        return Value::Number(u.into());
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => Value::Number(n.clone()),
        _ => Value::Null,
    }
}

/// Normalize a persisted `answers` blob into a string-keyed map.
///
/// Anything that is not a JSON object (including arrays) becomes an empty map.
pub fn normalize_answers(value: Option<&Value>) -> Map<String, Value> {
    match value {
        Some(Value::Object(map)) => canonicalize_map(map),
        _ => Map::new(),
    }
}

/// Normalize a persisted `history` blob into a list of [`HistoryEntry`].
///
/// A non-array blob becomes the empty list. Entries that are not objects are
/// dropped; `pageId` is coerced to a string and a missing or unparseable
/// `timestamp` defaults to now.
pub fn normalize_history(value: Option<&Value>) -> Vec<HistoryEntry> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let entry = item.as_object()?;
            let page_id = match entry.get("pageId") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let timestamp = entry
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            Some(HistoryEntry {
                page_id,
                value: canonicalize(entry.get("value").unwrap_or(&Value::Null)),
                timestamp,
            })
        })
        .collect()
}

/// Serialize a history list back into the persisted JSON shape.
pub fn history_to_value(history: &[HistoryEntry]) -> Value {
    serde_json::to_value(history).unwrap_or_else(|_| Value::Array(Vec::new()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_canonicalize_scalars_pass_through() {
        assert_eq!(canonicalize(&json!(null)), json!(null));
        assert_eq!(canonicalize(&json!(true)), json!(true));
        assert_eq!(canonicalize(&json!("hello")), json!("hello"));
        assert_eq!(canonicalize(&json!(42)), json!(42));
        assert_eq!(canonicalize(&json!(-17.5)), json!(-17.5));
    }

    #[test]
    fn test_canonicalize_big_integers_become_strings() {
        let big = MAX_SAFE_INTEGER + 1;
        assert_eq!(canonicalize(&json!(big)), json!(big.to_string()));
        assert_eq!(
            canonicalize(&json!(-9_007_199_254_740_993i64)),
            json!("-9007199254740993")
        );
        // Boundary value stays numeric.
        assert_eq!(
            canonicalize(&json!(MAX_SAFE_INTEGER)),
            json!(MAX_SAFE_INTEGER)
        );
    }

    #[test]
    fn test_canonicalize_array_of_big_integers() {
        let big = MAX_SAFE_INTEGER + 5;
        let input = json!([1, big, "x"]);
        assert_eq!(canonicalize(&input), json!([1, big.to_string(), "x"]));
    }

    #[test]
    fn test_canonicalize_recurses_into_objects() {
        let big = u64::MAX;
        let input = json!({"a": {"b": big}, "c": [big]});
        let expected = json!({"a": {"b": big.to_string()}, "c": [big.to_string()]});
        assert_eq!(canonicalize(&input), expected);
    }

    #[test]
    fn test_canonicalize_preserves_key_order() {
        let input = json!({"z": 1, "a": 2, "m": 3});
        let out = canonicalize(&input);
        let keys: Vec<&String> = out.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_canonicalize_idempotent() {
        let input = json!({
            "id": u64::MAX,
            "nested": [1, 2, {"big": MAX_SAFE_INTEGER + 10}],
            "name": "x",
            "flag": false,
        });
        let once = canonicalize(&input);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_normalize_answers_non_object() {
        assert!(normalize_answers(None).is_empty());
        assert!(normalize_answers(Some(&json!([1, 2]))).is_empty());
        assert!(normalize_answers(Some(&json!("str"))).is_empty());
        assert!(normalize_answers(Some(&json!(null))).is_empty());
    }

    #[test]
    fn test_normalize_answers_canonicalizes_values() {
        let big = MAX_SAFE_INTEGER + 2;
        let map = normalize_answers(Some(&json!({"page": big})));
        assert_eq!(map.get("page"), Some(&json!(big.to_string())));
    }

    #[test]
    fn test_normalize_history_non_array() {
        assert!(normalize_history(None).is_empty());
        assert!(normalize_history(Some(&json!({"pageId": "a"}))).is_empty());
        assert!(normalize_history(Some(&json!("nope"))).is_empty());
    }

    #[test]
    fn test_normalize_history_drops_non_objects() {
        let blob = json!([
            {"pageId": "a", "value": "x", "timestamp": "2024-03-01T10:00:00Z"},
            "garbage",
            42,
        ]);
        let history = normalize_history(Some(&blob));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].page_id, "a");
        assert_eq!(history[0].value, json!("x"));
    }

    #[test]
    fn test_normalize_history_coerces_page_id() {
        let blob = json!([{"pageId": 7, "value": null}]);
        let history = normalize_history(Some(&blob));
        assert_eq!(history[0].page_id, "7");
    }

    #[test]
    fn test_normalize_history_defaults_timestamp() {
        let before = Utc::now();
        let blob = json!([{"pageId": "a", "value": 1}]);
        let history = normalize_history(Some(&blob));
        assert!(history[0].timestamp >= before);
        assert!(history[0].timestamp <= Utc::now());
    }

    #[test]
    fn test_history_round_trip() {
        let entries = vec![
            HistoryEntry::new("a", &json!("first")),
            HistoryEntry::new("b", &json!({"k": 2})),
        ];
        let blob = history_to_value(&entries);
        let back = normalize_history(Some(&blob));
        assert_eq!(back, entries);
    }

    #[test]
    fn test_history_entry_canonicalizes_value() {
        let entry = HistoryEntry::new("p", &json!(u64::MAX));
        assert_eq!(entry.value, json!(u64::MAX.to_string()));
    }
}
