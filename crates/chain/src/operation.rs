//! Operations and operation chains.

use mc_domain::MeshError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single recorded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// Read a field (or look up a method) on the current value.
    Get { key: String },
    /// Invoke the current value with these arguments.
    Apply { args: Vec<Value> },
}

/// Ordered, immutable sequence of operations.
///
/// Extending a chain produces a new chain; the original is never touched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationChain {
    ops: Vec<Operation>,
}

impl OperationChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_operations(ops: Vec<Operation>) -> Self {
        Self { ops }
    }

    /// Returns a new chain with `op` appended.
    pub fn with(&self, op: Operation) -> Self {
        let mut ops = Vec::with_capacity(self.ops.len() + 1);
        ops.extend_from_slice(&self.ops);
        ops.push(op);
        Self { ops }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.ops
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Operation> {
        self.ops.iter()
    }

    pub fn first(&self) -> Option<&Operation> {
        self.ops.first()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn to_value(&self) -> Value {
        Value::Array(
            self.ops
                .iter()
                .map(|op| match op {
                    Operation::Get { key } => serde_json::json!({ "type": "get", "key": key }),
                    Operation::Apply { args } => serde_json::json!({ "type": "apply", "args": args }),
                })
                .collect(),
        )
    }

    /// Decode a chain received from the wire.
    pub fn from_value(value: Value) -> Result<Self, MeshError> {
        if !value.is_array() {
            return Err(MeshError::InvalidChain("chain is not an array".into()));
        }
        serde_json::from_value(value).map_err(|e| MeshError::InvalidChain(e.to_string()))
    }
}

impl<'a> IntoIterator for &'a OperationChain {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.iter()
    }
}
