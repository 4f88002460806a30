//! Reserved value shapes that carry meaning inside chain arguments.
//!
//! - nested operation marker: `{"isNested": true, "chain": [...]}`
//! - pending-result placeholder: `{"$result": true}`
//! - error value: `{"$error": {"kind": ..., "message": ...}}`

use mc_domain::{MeshError, WireError};
use serde_json::{json, Value};

use crate::operation::OperationChain;

pub const NESTED_FLAG: &str = "isNested";
pub const NESTED_CHAIN: &str = "chain";
pub const RESULT_PLACEHOLDER: &str = "$result";
pub const ERROR_VALUE: &str = "$error";

/// Embed `chain` as a nested operation marker.
pub fn nested_marker(chain: &OperationChain) -> Value {
    json!({ NESTED_FLAG: true, NESTED_CHAIN: chain.to_value() })
}

/// If `value` is a nested marker, decode its chain.
pub fn as_nested_marker(value: &Value) -> Option<Result<OperationChain, MeshError>> {
    let obj = value.as_object()?;
    if obj.get(NESTED_FLAG) != Some(&Value::Bool(true)) {
        return None;
    }
    let chain = obj.get(NESTED_CHAIN).cloned().unwrap_or(Value::Null);
    Some(OperationChain::from_value(chain))
}

/// Whether `value` contains a nested marker anywhere inside it.
pub fn contains_nested_marker(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.get(NESTED_FLAG) == Some(&Value::Bool(true)) || map.values().any(contains_nested_marker)
        }
        Value::Array(items) => items.iter().any(contains_nested_marker),
        _ => false,
    }
}

/// Placeholder for the not-yet-known result of a remote call.
pub fn result_placeholder() -> Value {
    json!({ RESULT_PLACEHOLDER: true })
}

pub fn is_result_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.len() == 1 && m.get(RESULT_PLACEHOLDER) == Some(&Value::Bool(true)))
}

/// Whether `value` contains a pending-result placeholder anywhere inside it.
pub fn contains_result_placeholder(value: &Value) -> bool {
    if is_result_placeholder(value) {
        return true;
    }
    match value {
        Value::Object(map) => map.values().any(contains_result_placeholder),
        Value::Array(items) => items.iter().any(contains_result_placeholder),
        _ => false,
    }
}

/// Wrap an error as a plain value so it can be handed to a handler chain.
pub fn error_value(err: &MeshError) -> Value {
    json!({ ERROR_VALUE: err.to_wire() })
}

/// If `value` is an error value, recover the error.
pub fn as_error_value(value: &Value) -> Option<MeshError> {
    let wire = value.as_object()?.get(ERROR_VALUE)?;
    serde_json::from_value::<WireError>(wire.clone())
        .ok()
        .map(MeshError::from_wire)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    #[test]
    fn nested_marker_roundtrip() {
        let chain = OperationChain::new().with(Operation::Get { key: "x".into() });
        let marker = nested_marker(&chain);
        assert_eq!(as_nested_marker(&marker).unwrap().unwrap(), chain);
        assert!(contains_nested_marker(&json!({ "deep": [1, marker] })));
    }

    #[test]
    fn plain_values_are_not_markers() {
        assert!(as_nested_marker(&json!({ "isNested": false, "chain": [] })).is_none());
        assert!(!contains_nested_marker(&json!({ "a": [1, 2, { "b": "c" }] })));
    }

    #[test]
    fn placeholder_detection_is_exact() {
        assert!(is_result_placeholder(&result_placeholder()));
        assert!(!is_result_placeholder(&json!({ "$result": true, "other": 1 })));
        assert!(!is_result_placeholder(&json!("$result")));
    }

    #[test]
    fn error_value_roundtrip() {
        let err = MeshError::Timeout("call 1".into());
        assert_eq!(as_error_value(&error_value(&err)), Some(err));
        assert_eq!(as_error_value(&json!({ "ok": true })), None);
    }
}
