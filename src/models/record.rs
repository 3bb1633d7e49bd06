//! Record types shared by the merge and dedup stages.
//!
//! K_i: A record is an arbitrary JSON object. The only contract callers must
//! honour is an ordered list of candidate key field names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A loosely-typed source record.
pub type Record = serde_json::Map<String, Value>;

/// Check whether a value counts as "empty" for key lookup and completeness.
///
/// Null, empty/blank strings, empty arrays and empty objects are empty.
/// `false` and `0` are real values.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Normalize a scalar value into a business key.
///
/// Strings are trimmed, numbers and booleans stringified. Arrays, objects,
/// null and blank strings never form a key.
pub fn normalize_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Render a value as display text (strings without quotes).
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Ordered list of candidate field names that may carry the business key.
///
/// The first candidate present with a non-empty scalar value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyFields(Vec<String>);

impl KeyFields {
    /// Create a candidate list in priority order.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    /// Single-field candidate list.
    pub fn single(field: impl Into<String>) -> Self {
        Self(vec![field.into()])
    }

    /// Extract and normalize the business key of a record.
    pub fn extract(&self, record: &Record) -> Option<String> {
        self.0
            .iter()
            .find_map(|field| record.get(field).and_then(normalize_key))
    }

    /// Candidate names in priority order.
    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Build a record from `(field, value)` pairs.
///
/// Mostly useful in tests and small adapters.
pub fn record_from<I, K>(pairs: I) -> Record
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_extraction_follows_candidate_order() {
        let fields = KeyFields::new(["taxpayer_id", "taxpayer_number", "id"]);
        let record = record_from([
            ("id", json!("fallback")),
            ("taxpayer_number", json!("  3200 ")),
        ]);
        assert_eq!(fields.extract(&record), Some("3200".to_string()));
    }

    #[test]
    fn test_key_extraction_skips_blank_and_structured_values() {
        let fields = KeyFields::new(["a", "b", "c", "d"]);
        let record = record_from([
            ("a", json!("   ")),
            ("b", json!(null)),
            ("c", json!({"nested": 1})),
            ("d", json!(1234)),
        ]);
        assert_eq!(fields.extract(&record), Some("1234".to_string()));

        let unkeyed = record_from([("name", json!("Acme"))]);
        assert_eq!(fields.extract(&unkeyed), None);
    }

    #[test]
    fn test_empty_values() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!(" ")));
        assert!(is_empty_value(&json!([])));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!("x")));
    }
}
