//! Small helpers shared across modules.

use serde_json::{Map, Value};

/// Shallow merge of two option maps: keys in `overrides` win.
///
/// Non-object inputs count as empty, so `Value::Null` is a valid "no options".
pub fn merge_config(base: &Value, overrides: &Value) -> Value {
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    if let Some(over) = overrides.as_object() {
        for (k, v) in over {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

/// Human-readable byte count (MB granularity, like the cache logs).
pub fn format_mb(bytes: u64) -> String {
    format!("{} MB", bytes / 1024 / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_overrides_win() {
        let merged = merge_config(&json!({"duration": 1.0, "ease": "linear"}), &json!({"duration": 0.2}));
        assert_eq!(merged, json!({"duration": 0.2, "ease": "linear"}));
    }

    #[test]
    fn test_merge_null_inputs() {
        assert_eq!(merge_config(&Value::Null, &Value::Null), json!({}));
        assert_eq!(merge_config(&Value::Null, &json!({"a": 1})), json!({"a": 1}));
    }
}
