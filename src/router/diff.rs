//! Semantic comparison of desired and live object specs
//!
//! Specs are compared as JSON with nulls, empty lists and empty maps
//! removed, so an absent field and an empty one compare equal.

use serde::Serialize;
use serde_json::Value;

pub fn prune(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, prune(v)))
                .filter(|(_, v)| !is_empty(v))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(prune).collect()),
        other => other,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// True when the two values differ after pruning
pub fn differs<T: Serialize>(a: &T, b: &T) -> Result<bool, serde_json::Error> {
    let a = prune(serde_json::to_value(a)?);
    let b = prune(serde_json::to_value(b)?);
    Ok(a != b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_prune_drops_empty_values() {
        let value = json!({
            "hosts": [],
            "gateways": ["mesh"],
            "http": [{"match": null, "route": [{"destination": {"host": "a"}, "headers": {}}]}]
        });

        assert_eq!(
            prune(value),
            json!({"gateways": ["mesh"], "http": [{"route": [{"destination": {"host": "a"}}]}]})
        );
    }

    #[test]
    fn test_differs_treats_absent_and_empty_as_equal() {
        let a = json!({"matches": [], "timeout": null});
        let b = json!({});

        assert!(!differs(&a, &b).unwrap());
        assert!(differs(&json!({"timeout": "5s"}), &b).unwrap());
    }
}
