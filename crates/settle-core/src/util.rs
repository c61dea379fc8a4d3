//! Shared utility functions used across multiple modules.

use serde_json::Value;

/// Prefix of identifiers assigned to records created while offline.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Build the placeholder id for a record created by the given action.
pub fn temp_id_for(action_id: &str) -> String {
    format!("{TEMP_ID_PREFIX}{action_id}")
}

/// Whether an id is an offline placeholder rather than a server id.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Read the `id` field of a JSON record, if it is a non-empty string.
pub fn record_id(record: &Value) -> Option<&str> {
    record
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// Compare two JSON field values the way a user would.
///
/// Numbers compare numerically (`50` equals `50.0`) and a missing value equals
/// `null`.
pub fn values_equal(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.unwrap_or(&Value::Null);
    let right = right.unwrap_or(&Value::Null);
    match (left, right) {
        (Value::Number(left), Value::Number(right)) => match (left.as_f64(), right.as_f64()) {
            (Some(left), Some(right)) => (left - right).abs() < f64::EPSILON,
            _ => left == right,
        },
        _ => left == right,
    }
}

/// Shallow-merge `overlay` on top of `base`; both must be JSON objects.
pub fn shallow_merge(base: &Value, overlay: &Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    if let Some(overlay) = overlay.as_object() {
        for (key, value) in overlay {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
    }

    #[test]
    fn temp_ids_are_recognised() {
        let id = temp_id_for("0190-abc");
        assert_eq!(id, "temp_0190-abc");
        assert!(is_temp_id(&id));
        assert!(!is_temp_id("0190-abc"));
    }

    #[test]
    fn values_equal_treats_numbers_numerically() {
        assert!(values_equal(Some(&json!(50)), Some(&json!(50.0))));
        assert!(!values_equal(Some(&json!(50)), Some(&json!(45))));
        assert!(values_equal(None, Some(&Value::Null)));
        assert!(!values_equal(Some(&json!("a")), None));
    }

    #[test]
    fn shallow_merge_prefers_overlay() {
        let merged = shallow_merge(
            &json!({"id": "1", "amount": 10, "notes": "server"}),
            &json!({"amount": 12}),
        );
        assert_eq!(merged, json!({"id": "1", "amount": 12, "notes": "server"}));
    }
}
