//! Task-scoped call context.
//!
//! The context of the call currently executing lives in a tokio task-local,
//! so concurrent calls on the same node never observe each other's context
//! even when they share a worker thread.

use std::cell::RefCell;
use std::future::Future;
use std::time::Duration;

use mc_domain::NodeIdentity;
use mc_protocol::CallContext;
use serde_json::{Map, Value};

tokio::task_local! {
    static CURRENT: RefCell<CallContext>;
}

/// Run `fut` with `context` as the current context.  The previous context
/// (if any) is restored when `fut` completes, fails, or is dropped.
pub async fn run_with<F: Future>(context: CallContext, fut: F) -> F::Output {
    CURRENT.scope(RefCell::new(context), fut).await
}

/// A copy of the current context, or `None` outside any call.
pub fn current() -> Option<CallContext> {
    CURRENT.try_with(|c| c.borrow().clone()).ok()
}

/// Read the current context without copying it.
pub fn with_current<R>(f: impl FnOnce(&CallContext) -> R) -> Option<R> {
    CURRENT.try_with(|c| f(&c.borrow())).ok()
}

/// The node that made the call currently executing.
pub fn current_caller() -> Option<NodeIdentity> {
    with_current(|c| c.caller().cloned()).flatten()
}

/// Mutate the current call's state bag.  Returns `false` outside any call.
pub fn update_state(f: impl FnOnce(&mut Map<String, Value>)) -> bool {
    CURRENT.try_with(|c| f(&mut c.borrow_mut().state)).is_ok()
}

/// Deep copy of the current context for use after this call's extent ends.
/// Later changes to the live context do not reach the copy.
pub fn capture() -> Option<CallContext> {
    current()
}

/// Per-call options for outgoing calls.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Start a fresh causal chain instead of extending the current one.
    pub new_chain: bool,
    /// State merged over the inherited state bag (new keys win).
    pub state: Option<Map<String, Value>>,
    /// Overrides the node's default call timeout.
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn fresh_chain(mut self) -> Self {
        self.new_chain = true;
        self
    }

    pub fn with_state(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.state
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Context for a call made by `caller` from inside the current context.
pub fn build_outgoing(caller: &NodeIdentity, options: &CallOptions) -> CallContext {
    match current() {
        Some(mut inherited) if !options.new_chain => {
            inherited.call_chain.push(caller.clone());
            if let Some(state) = &options.state {
                for (k, v) in state {
                    inherited.state.insert(k.clone(), v.clone());
                }
            }
            inherited
        }
        _ => CallContext {
            call_chain: vec![caller.clone()],
            origin_auth: None,
            state: options.state.clone().unwrap_or_default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_protocol::OriginAuth;
    use serde_json::json;

    fn ctx(origin: &str) -> CallContext {
        CallContext {
            call_chain: vec![NodeIdentity::stateless(origin)],
            origin_auth: Some(OriginAuth {
                subject: "ada".into(),
                claims: Map::new(),
            }),
            state: Map::from_iter([("tenant".to_string(), json!("t1"))]),
        }
    }

    #[tokio::test]
    async fn no_context_outside_calls() {
        assert!(current().is_none());
        assert!(!update_state(|s| {
            s.insert("x".into(), json!(1));
        }));
    }

    #[tokio::test]
    async fn nested_scopes_restore_previous() {
        run_with(ctx("outer"), async {
            run_with(ctx("inner"), async {
                assert_eq!(current_caller().unwrap().binding_name, "inner");
            })
            .await;
            assert_eq!(current_caller().unwrap().binding_name, "outer");
        })
        .await;
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn inherited_hop_appends_and_merges() {
        let me = NodeIdentity::stateless("me");
        let out = run_with(ctx("origin"), async {
            build_outgoing(
                &me,
                &CallOptions::default()
                    .with_state("tenant", "t2")
                    .with_state("trace", "abc"),
            )
        })
        .await;
        assert_eq!(out.call_chain.len(), 2);
        assert_eq!(out.call_chain[1], me);
        assert_eq!(out.origin_auth.as_ref().map(|a| a.subject.as_str()), Some("ada"));
        assert_eq!(out.state["tenant"], json!("t2"));
        assert_eq!(out.state["trace"], json!("abc"));
    }

    #[tokio::test]
    async fn fresh_chain_drops_inherited_context() {
        let me = NodeIdentity::stateless("me");
        let out = run_with(ctx("origin"), async {
            build_outgoing(&me, &CallOptions::default().fresh_chain())
        })
        .await;
        assert_eq!(out.call_chain, vec![me]);
        assert!(out.origin_auth.is_none());
        assert!(out.state.is_empty());
    }

    #[tokio::test]
    async fn capture_is_a_deep_copy() {
        run_with(ctx("origin"), async {
            let captured = capture().unwrap();
            update_state(|s| {
                s.insert("tenant".into(), json!("changed"));
            });
            assert_eq!(captured.state["tenant"], json!("t1"));
            assert_eq!(current().unwrap().state["tenant"], json!("changed"));
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_calls_are_isolated() {
        let mut handles = Vec::new();
        for i in 0..16 {
            handles.push(tokio::spawn(run_with(ctx(&format!("n{i}")), async move {
                for _ in 0..10 {
                    tokio::task::yield_now().await;
                    assert_eq!(current_caller().unwrap().binding_name, format!("n{i}"));
                }
            })));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
