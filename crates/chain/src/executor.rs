//! Chain executor: replays an [`OperationChain`] against a [`Target`].

use std::borrow::Cow;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use mc_domain::config::ChainConfig;
use mc_domain::MeshError;
use serde_json::Value;

use crate::marker;
use crate::operation::{Operation, OperationChain};
use crate::target::{BoundMethod, Member, Target, SERVICE_ACCESSOR};

/// Limits and policy for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Maximum number of operations in a chain, and maximum nesting of
    /// markers inside arguments.
    pub max_depth: usize,
    /// Maximum number of arguments for a single `apply`.
    pub max_args: usize,
    /// When `false`, the callable allow-list is not consulted.  Only for
    /// trusted local continuations and scheduled work.
    pub require_callable_policy: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_depth: 50,
            max_args: 100,
            require_callable_policy: true,
        }
    }
}

impl ExecuteOptions {
    /// Same limits with the callable policy bypassed.
    pub fn trusted(self) -> Self {
        Self {
            require_callable_policy: false,
            ..self
        }
    }
}

impl From<&ChainConfig> for ExecuteOptions {
    fn from(cfg: &ChainConfig) -> Self {
        Self {
            max_depth: cfg.max_depth,
            max_args: cfg.max_args,
            require_callable_policy: true,
        }
    }
}

/// Outcome of an execution: the final value plus the chain with every
/// `apply`'s arguments replaced by their resolved, concrete values.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub value: Value,
    pub resolved: OperationChain,
}

/// Check shape limits without executing anything.
pub fn validate_chain(chain: &OperationChain, options: &ExecuteOptions) -> Result<(), MeshError> {
    if chain.is_empty() {
        return Err(MeshError::InvalidChain("chain is empty".into()));
    }
    if chain.len() > options.max_depth {
        return Err(MeshError::InvalidChain(format!(
            "chain has {} operations, max is {}",
            chain.len(),
            options.max_depth
        )));
    }
    for (i, op) in chain.iter().enumerate() {
        if let Operation::Apply { args } = op {
            if args.len() > options.max_args {
                return Err(MeshError::InvalidChain(format!(
                    "operation {i} has {} arguments, max is {}",
                    args.len(),
                    options.max_args
                )));
            }
        }
    }
    Ok(())
}

/// Execute `chain` against `target` and return the final value.
///
/// The walk starts on `target` itself, which is an object and not a method:
/// the first `apply` must follow a `get` that selected the method.  A chain
/// that opens with `apply` fails with `InvalidChain`.
pub async fn execute_operation_chain(
    chain: &OperationChain,
    target: Arc<dyn Target>,
    options: &ExecuteOptions,
) -> Result<Value, MeshError> {
    run(chain, &Walk::new(&target, options), 0).await.map(|e| e.value)
}

/// Execute a handler continuation with `result` standing in for every
/// pending-result placeholder, including placeholders inside nested
/// markers.
///
/// `result` is data.  Nested markers inside it are passed to the handler
/// as plain values and never executed.
pub async fn execute_with_result(
    chain: &OperationChain,
    target: Arc<dyn Target>,
    options: &ExecuteOptions,
    result: &Value,
) -> Result<Value, MeshError> {
    let walk = Walk {
        result: Some(result),
        ..Walk::new(&target, options)
    };
    run(chain, &walk, 0).await.map(|e| e.value)
}

/// Like [`execute_operation_chain`], but also returns the resolved chain.
pub async fn execute_resolving(
    chain: &OperationChain,
    target: Arc<dyn Target>,
    options: &ExecuteOptions,
) -> Result<Executed, MeshError> {
    run(chain, &Walk::new(&target, options), 0).await
}

/// Execute every nested marker inside `chain`'s arguments and return a chain
/// with only concrete values, suitable for persisting.  The chain itself is
/// not executed.
pub async fn resolve_nested_operation_markers(
    chain: &OperationChain,
    target: Arc<dyn Target>,
    options: &ExecuteOptions,
) -> Result<OperationChain, MeshError> {
    validate_chain(chain, options)?;
    let mut ops = Vec::with_capacity(chain.len());
    for op in chain {
        match op {
            Operation::Get { .. } => ops.push(op.clone()),
            Operation::Apply { args } => {
                let args = resolve_args(args, &Walk::new(&target, options), 0).await?;
                ops.push(Operation::Apply {
                    args: args.into_owned(),
                });
            }
        }
    }
    Ok(OperationChain::from_operations(ops))
}

/// Replace every pending-result placeholder in `chain` with `value`,
/// including placeholders inside nested markers.
///
/// For persisting a chain.  A replaced chain handed to the executor treats
/// markers inside `value` as chains; use [`execute_with_result`] to run a
/// handler against an untrusted result.
pub fn replace_nested_operation_markers(chain: &OperationChain, value: &Value) -> OperationChain {
    let ops = chain
        .iter()
        .map(|op| match op {
            Operation::Get { .. } => op.clone(),
            Operation::Apply { args } => Operation::Apply {
                args: args.iter().map(|a| replace_placeholder(a, value)).collect(),
            },
        })
        .collect();
    OperationChain::from_operations(ops)
}

fn replace_placeholder(arg: &Value, value: &Value) -> Value {
    if marker::is_result_placeholder(arg) {
        return value.clone();
    }
    match arg {
        Value::Array(items) => Value::Array(items.iter().map(|v| replace_placeholder(v, value)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), replace_placeholder(v, value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Walk
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a walk needs besides the chain itself.
struct Walk<'a> {
    target: &'a Arc<dyn Target>,
    options: &'a ExecuteOptions,
    /// Substituted for `$result` placeholders as an opaque leaf.
    result: Option<&'a Value>,
}

impl<'a> Walk<'a> {
    fn new(target: &'a Arc<dyn Target>, options: &'a ExecuteOptions) -> Self {
        Self {
            target,
            options,
            result: None,
        }
    }

    fn needs_resolution(&self, value: &Value) -> bool {
        marker::contains_nested_marker(value)
            || (self.result.is_some() && marker::contains_result_placeholder(value))
    }
}

enum Cursor {
    Object(Arc<dyn Target>),
    Method(BoundMethod),
    Value(Value),
}

impl Cursor {
    fn describe(&self) -> String {
        match self {
            Cursor::Object(_) => "object".into(),
            Cursor::Method(m) => format!("method `{}`", m.name()),
            Cursor::Value(v) => value_type(v).into(),
        }
    }

    fn get(self, key: &str) -> Result<Cursor, MeshError> {
        match self {
            Cursor::Object(target) => match target.member(key) {
                Some(Member::Value(v)) => Ok(Cursor::Value(v)),
                Some(Member::Object(o)) => Ok(Cursor::Object(o)),
                Some(Member::Method(m)) => Ok(Cursor::Method(m)),
                None => Err(MeshError::InvalidChain(format!("no member `{key}`"))),
            },
            Cursor::Value(Value::Object(mut map)) => {
                Ok(Cursor::Value(map.remove(key).unwrap_or(Value::Null)))
            }
            Cursor::Value(Value::Array(mut items)) => {
                let idx: usize = key.parse().map_err(|_| {
                    MeshError::InvalidChain(format!("cannot read `{key}` of an array"))
                })?;
                if idx < items.len() {
                    Ok(Cursor::Value(items.swap_remove(idx)))
                } else {
                    Ok(Cursor::Value(Value::Null))
                }
            }
            other => Err(MeshError::InvalidChain(format!(
                "cannot read `{key}` of {}",
                other.describe()
            ))),
        }
    }
}

fn value_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn run<'a>(chain: &'a OperationChain, walk: &'a Walk<'a>, nesting: usize) -> BoxFuture<'a, Result<Executed, MeshError>> {
    async move {
        let (target, options) = (walk.target, walk.options);
        validate_chain(chain, options)?;

        let via_service = matches!(
            chain.first(),
            Some(Operation::Get { key }) if key == SERVICE_ACCESSOR
        );
        let mut policy_pending = options.require_callable_policy && !via_service;

        let mut cursor = Cursor::Object(target.clone());
        let mut resolved = Vec::with_capacity(chain.len());

        for op in chain {
            match op {
                Operation::Get { key } => {
                    cursor = cursor.get(key)?;
                    resolved.push(op.clone());
                }
                Operation::Apply { args } => {
                    let method = match cursor {
                        Cursor::Method(m) => m,
                        other => {
                            return Err(MeshError::InvalidChain(format!(
                                "{} is not invocable",
                                other.describe()
                            )))
                        }
                    };

                    // Enforced once, at the first apply.
                    if policy_pending {
                        policy_pending = false;
                        if !method.is_callable() {
                            tracing::debug!(method = %method.name(), "rejected call to non-callable method");
                            return Err(MeshError::NotCallable(method.name().to_string()));
                        }
                        method.check_guard()?;
                    }

                    let args = resolve_args(args, walk, nesting).await?;
                    let args = args.into_owned();
                    resolved.push(Operation::Apply { args: args.clone() });
                    cursor = Cursor::Value(method.invoke(args).await?);
                }
            }
        }

        match cursor {
            Cursor::Value(value) => Ok(Executed {
                value,
                resolved: OperationChain::from_operations(resolved),
            }),
            other => Err(MeshError::InvalidChain(format!(
                "chain ends on {}, not a value",
                other.describe()
            ))),
        }
    }
    .boxed()
}

/// Resolve nested markers in `args`, depth-first.  Arguments without any
/// marker are returned as-is.
async fn resolve_args<'a>(args: &'a [Value], walk: &Walk<'_>, nesting: usize) -> Result<Cow<'a, [Value]>, MeshError> {
    if !args.iter().any(|a| walk.needs_resolution(a)) {
        return Ok(Cow::Borrowed(args));
    }
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        out.push(resolve_value(arg, walk, nesting).await?);
    }
    Ok(Cow::Owned(out))
}

fn resolve_value<'a>(value: &'a Value, walk: &'a Walk<'a>, nesting: usize) -> BoxFuture<'a, Result<Value, MeshError>> {
    async move {
        if let Some(result) = walk.result {
            if marker::is_result_placeholder(value) {
                return Ok(result.clone());
            }
        }
        if let Some(chain) = marker::as_nested_marker(value) {
            let chain = chain?;
            if nesting + 1 > walk.options.max_depth {
                return Err(MeshError::InvalidChain(format!(
                    "nested markers deeper than {}",
                    walk.options.max_depth
                )));
            }
            return run(&chain, walk, nesting + 1).await.map(|e| e.value);
        }
        if !walk.needs_resolution(value) {
            return Ok(value.clone());
        }
        match value {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(item, walk, nesting).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), resolve_value(v, walk, nesting).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args;
    use crate::continuation::Continuation;
    use crate::target::{Instance, MethodTable, Services};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Calc {
        calls: AtomicUsize,
    }

    fn calc() -> Arc<dyn Target> {
        let mut table = MethodTable::<Calc>::new();
        table
            .callable("double", |c, args| async move {
                c.calls.fetch_add(1, Ordering::SeqCst);
                let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(n * 2))
            })
            .callable("add", |_c, args| async move {
                Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
            })
            .callable("profile", |_c, _args| async move {
                Ok(json!({ "name": "ada", "tags": ["x", "y"] }))
            })
            .callable("fail", |_c, _args| async move {
                Err(MeshError::application("Boom", "went wrong"))
            })
            .callable("echo", |_c, args| async move { Ok(Value::Array(args)) })
            .guarded(
                "secret",
                |_c: &Calc| Err("nope".to_string()),
                |_c, _args| async move { Ok(json!("leaked")) },
            )
            .internal("reset", |_c, _args| async move { Ok(json!("reset")) })
            .property("version", |_c| json!(3));

        let mut svc_table = MethodTable::<()>::new();
        svc_table.internal("now", |_s, _args| async move { Ok(json!(1700)) });
        let mut services = Services::new();
        services.insert("clock", Arc::new(Instance::new(Arc::new(()), svc_table)));

        Arc::new(
            Instance::new(
                Arc::new(Calc {
                    calls: AtomicUsize::new(0),
                }),
                table,
            )
            .with_services(services),
        )
    }

    async fn exec(c: Continuation) -> Result<Value, MeshError> {
        execute_operation_chain(c.chain(), calc(), &ExecuteOptions::default()).await
    }

    #[tokio::test]
    async fn get_then_apply() {
        let v = exec(Continuation::new().call("double", args![21])).await.unwrap();
        assert_eq!(v, json!(42));
    }

    #[tokio::test]
    async fn get_reads_plain_fields() {
        let c = Continuation::new().call("profile", args![]).get("tags").get("1");
        assert_eq!(exec(c).await.unwrap(), json!("y"));
        assert_eq!(exec(Continuation::new().get("version")).await.unwrap(), json!(3));
        let missing = Continuation::new().call("profile", args![]).get("nope");
        assert_eq!(exec(missing).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn nested_markers_resolve_before_apply() {
        let inner = Continuation::new().call("double", args![5]);
        let outer = Continuation::new().call("add", args![inner, 1]);
        assert_eq!(exec(outer).await.unwrap(), json!(11));
    }

    #[tokio::test]
    async fn markers_inside_objects_and_arrays() {
        let a = Continuation::new().call("double", args![1]);
        let b = Continuation::new().call("double", args![2]);
        let outer = Continuation::new().call(
            "echo",
            args![json!({ "a": a.marker(), "list": [b.marker(), 9] })],
        );
        assert_eq!(exec(outer).await.unwrap(), json!([{ "a": 2, "list": [4, 9] }]));
    }

    #[tokio::test]
    async fn independent_markers_resolve_the_same_either_way() {
        let x = Continuation::new().call("double", args![3]);
        let y = Continuation::new().call("double", args![4]);
        let xy = exec(Continuation::new().call("echo", args![json!({ "a": x.marker(), "b": y.marker() })]))
            .await
            .unwrap();
        let yx = exec(Continuation::new().call("echo", args![json!({ "b": y.marker(), "a": x.marker() })]))
            .await
            .unwrap();
        assert_eq!(xy, yx);
    }

    #[tokio::test]
    async fn resolved_chain_carries_concrete_args() {
        let inner = Continuation::new().call("double", args![5]);
        let outer = Continuation::new().call("add", args![inner, 1]);
        let done = execute_resolving(outer.chain(), calc(), &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            done.resolved.operations()[1],
            Operation::Apply {
                args: vec![json!(10), json!(1)]
            }
        );
        // Input chain is untouched.
        assert!(marker::contains_nested_marker(&outer.chain().to_value()));
    }

    #[test]
    fn args_without_markers_are_borrowed() {
        let args = vec![json!(1), json!({ "a": [2] })];
        let target = calc();
        let opts = ExecuteOptions::default();
        let out = futures_util::FutureExt::now_or_never(resolve_args(&args, &Walk::new(&target, &opts), 0))
            .expect("no markers means no await")
            .unwrap();
        assert!(matches!(out, Cow::Borrowed(b) if std::ptr::eq(b, args.as_slice())));
    }

    #[tokio::test]
    async fn non_callable_method_is_rejected() {
        let err = exec(Continuation::new().call("reset", args![])).await.unwrap_err();
        assert_eq!(err, MeshError::NotCallable("reset".into()));
    }

    #[tokio::test]
    async fn trusted_execution_bypasses_policy() {
        let v = execute_operation_chain(
            Continuation::new().call("reset", args![]).chain(),
            calc(),
            &ExecuteOptions::default().trusted(),
        )
        .await
        .unwrap();
        assert_eq!(v, json!("reset"));
    }

    #[tokio::test]
    async fn svc_accessor_bypasses_policy() {
        let c = Continuation::new().svc().get("clock").call("now", args![]);
        assert_eq!(exec(c).await.unwrap(), json!(1700));
    }

    #[tokio::test]
    async fn guard_rejects_before_body_runs() {
        let err = exec(Continuation::new().call("secret", args![])).await.unwrap_err();
        assert!(matches!(err, MeshError::GuardRejected { ref method, .. } if method == "secret"));
    }

    #[tokio::test]
    async fn nested_chain_is_also_policy_checked() {
        let sneaky = Continuation::new().call("reset", args![]);
        let err = exec(Continuation::new().call("echo", args![sneaky])).await.unwrap_err();
        assert_eq!(err, MeshError::NotCallable("reset".into()));
    }

    #[tokio::test]
    async fn application_errors_propagate() {
        let err = exec(Continuation::new().call("fail", args![])).await.unwrap_err();
        assert_eq!(err, MeshError::application("Boom", "went wrong"));
    }

    #[tokio::test]
    async fn shape_limits_are_enforced_before_execution() {
        let target = calc();
        let opts = ExecuteOptions {
            max_depth: 2,
            max_args: 2,
            require_callable_policy: true,
        };

        let long = Continuation::new().call("profile", args![]).get("tags");
        let err = execute_operation_chain(long.chain(), target.clone(), &opts).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));

        let wide = Continuation::new().call("double", args![1, 2, 3]);
        let err = execute_operation_chain(wide.chain(), target.clone(), &opts).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));

        let empty = OperationChain::new();
        let err = execute_operation_chain(&empty, target, &opts).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));
    }

    #[tokio::test]
    async fn runaway_nesting_is_bounded() {
        let mut c = Continuation::new().call("double", args![1]);
        for _ in 0..5 {
            c = Continuation::new().call("double", args![c]);
        }
        let opts = ExecuteOptions {
            max_depth: 3,
            ..Default::default()
        };
        let err = execute_operation_chain(c.chain(), calc(), &opts).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));
    }

    #[tokio::test]
    async fn apply_on_a_value_is_invalid() {
        let err = exec(Continuation::new().get("version").apply(args![])).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));
    }

    #[tokio::test]
    async fn chain_ending_on_method_is_invalid() {
        let err = exec(Continuation::new().get("double")).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(_)));
    }

    #[tokio::test]
    async fn resolve_for_persistence_executes_only_markers() {
        let target = calc();
        let inner = Continuation::new().call("double", args![7]);
        let outer = Continuation::new().call("add", args![inner, 1]);
        let persisted = resolve_nested_operation_markers(outer.chain(), target, &ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(
            persisted.operations()[1],
            Operation::Apply {
                args: vec![json!(14), json!(1)]
            }
        );
    }

    #[test]
    fn replace_placeholder_everywhere() {
        let nested = Continuation::new().call("echo", args![Continuation::result()]);
        let handler = Continuation::new().call(
            "echo",
            args![Continuation::result(), json!({ "deep": [marker::result_placeholder()] }), nested],
        );
        let replaced = replace_nested_operation_markers(handler.chain(), &json!(84));
        let text = serde_json::to_string(&replaced).unwrap();
        assert!(!text.contains("$result"));
        match &replaced.operations()[1] {
            Operation::Apply { args } => {
                assert_eq!(args[0], json!(84));
                assert_eq!(args[1], json!({ "deep": [84] }));
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn apply_without_get_is_invalid() {
        let err = exec(Continuation::new().apply(args![1])).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidChain(m) if m.contains("not invocable")));
    }

    #[tokio::test]
    async fn result_substitution_reaches_nested_markers() {
        let nested = Continuation::new().call("double", args![Continuation::result()]);
        let handler = Continuation::new().call("add", args![Continuation::result(), nested]);
        let out = execute_with_result(handler.chain(), calc(), &ExecuteOptions::default().trusted(), &json!(5))
            .await
            .unwrap();
        assert_eq!(out, json!(15));
    }

    #[tokio::test]
    async fn substituted_result_is_never_executed() {
        let target = calc();
        let smuggled = Continuation::new().call("reset", args![]).marker();
        let result = json!({ "wrapped": smuggled.clone() });
        let handler = Continuation::new().call("echo", args![Continuation::result(), Continuation::result()]);

        let out = execute_with_result(handler.chain(), target, &ExecuteOptions::default().trusted(), &smuggled)
            .await
            .unwrap();
        assert_eq!(out, json!([smuggled.clone(), smuggled]));

        let out = execute_with_result(handler.chain(), calc(), &ExecuteOptions::default().trusted(), &result)
            .await
            .unwrap();
        assert_eq!(out, json!([result.clone(), result]));
    }
}
