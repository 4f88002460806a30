//! Continuation builder: records intents as an [`OperationChain`] without
//! executing anything.

use serde_json::Value;

use crate::marker;
use crate::operation::{Operation, OperationChain};

/// Immutable handle over a recorded chain.
///
/// Every access or call returns a new handle; the receiver is left as it
/// was, so a shared prefix can be extended in several directions.
///
/// ```rust
/// use mc_chain::{args, Continuation};
///
/// let ctn = Continuation::new();
/// let remote = ctn.call("double", args![21]);
/// let handler = ctn.call("record", args![Continuation::result()]);
/// assert_eq!(remote.chain().len(), 2);
/// assert_eq!(handler.chain().len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Continuation {
    chain: OperationChain,
}

impl Continuation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field access.
    pub fn get(&self, key: impl Into<String>) -> Self {
        Self {
            chain: self.chain.with(Operation::Get { key: key.into() }),
        }
    }

    /// Record a call of the current value.
    pub fn apply(&self, args: Vec<Arg>) -> Self {
        Self {
            chain: self.chain.with(Operation::Apply {
                args: args.into_iter().map(Arg::into_value).collect(),
            }),
        }
    }

    /// Record `.method(args...)`: a `get` followed by an `apply`.
    pub fn call(&self, method: impl Into<String>, args: Vec<Arg>) -> Self {
        self.get(method).apply(args)
    }

    /// Shorthand for the reserved service accessor (`svc`).
    pub fn svc(&self) -> Self {
        self.get(crate::target::SERVICE_ACCESSOR)
    }

    pub fn chain(&self) -> &OperationChain {
        &self.chain
    }

    pub fn into_chain(self) -> OperationChain {
        self.chain
    }

    /// This continuation as a nested operation marker value.
    pub fn marker(&self) -> Value {
        marker::nested_marker(&self.chain)
    }

    /// Placeholder substituted with the remote result when a handler runs.
    pub fn result() -> Arg {
        Arg::Value(marker::result_placeholder())
    }
}

impl From<OperationChain> for Continuation {
    fn from(chain: OperationChain) -> Self {
        Self { chain }
    }
}

/// A call argument: either a plain value or another continuation, which is
/// embedded as a nested operation marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Value(Value),
    Nested(Continuation),
}

impl Arg {
    pub fn into_value(self) -> Value {
        match self {
            Arg::Value(v) => v,
            Arg::Nested(c) => c.marker(),
        }
    }
}

impl From<Continuation> for Arg {
    fn from(c: Continuation) -> Self {
        Arg::Nested(c)
    }
}

impl From<&Continuation> for Arg {
    fn from(c: &Continuation) -> Self {
        Arg::Nested(c.clone())
    }
}

macro_rules! arg_from_json {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for Arg {
                fn from(v: $t) -> Self {
                    Arg::Value(Value::from(v))
                }
            }
        )*
    };
}

arg_from_json!(Value, bool, i32, i64, u32, u64, f64, String, &str);

/// Build an argument list from heterogeneous values.
///
/// `args![1, "two", other_continuation]`
#[macro_export]
macro_rules! args {
    () => { ::std::vec::Vec::<$crate::Arg>::new() };
    ($($arg:expr),+ $(,)?) => {
        vec![$($crate::Arg::from($arg)),+]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use serde_json::json;

    #[test]
    fn handles_are_immutable() {
        let root = Continuation::new().get("rooms");
        let a = root.call("join", args!["a"]);
        let b = root.call("leave", args!["b"]);
        assert_eq!(root.chain().len(), 1);
        assert_ne!(a, b);
        assert_eq!(a.chain().len(), 3);
    }

    #[test]
    fn continuation_argument_becomes_nested_marker() {
        let inner = Continuation::new().call("price", args![]);
        let outer = Continuation::new().call("buy", args![inner.clone(), 2]);
        match &outer.chain().operations()[1] {
            Operation::Apply { args } => {
                assert_eq!(args[0], inner.marker());
                assert_eq!(args[1], json!(2));
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn result_placeholder_is_recorded_verbatim() {
        let handler = Continuation::new().call("done", args![Continuation::result()]);
        match &handler.chain().operations()[1] {
            Operation::Apply { args } => assert!(marker::is_result_placeholder(&args[0])),
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn svc_records_reserved_accessor() {
        let c = Continuation::new().svc().get("alarms");
        assert_eq!(
            c.chain().first(),
            Some(&Operation::Get {
                key: crate::target::SERVICE_ACCESSOR.into()
            })
        );
    }
}
