use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mc_chain::{args, marker, Continuation, Instance, MethodTable, Target};
use mc_domain::{MeshError, NodeIdentity, NodeKind};
use mc_node::{context, CallOptions, LocalMesh, MeshNode};
use mc_protocol::CallContext;
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Records everything its handlers receive.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Value>>,
    contexts: Mutex<Vec<Option<CallContext>>>,
    purged: AtomicUsize,
}

fn recorder_target(rec: Arc<Recorder>) -> Arc<dyn Target> {
    let mut table = MethodTable::<Recorder>::new();
    table.internal("handle", |r, args| async move {
        r.seen.lock().push(args.into_iter().next().unwrap_or(Value::Null));
        r.contexts.lock().push(context::current());
        Ok(Value::Null)
    })
    .internal("purge", |r, _args| async move {
        r.purged.fetch_add(1, Ordering::SeqCst);
        Ok(json!("purged"))
    });
    Arc::new(Instance::new(rec, table))
}

struct Doubler {
    callers: Mutex<Vec<Vec<NodeIdentity>>>,
}

fn doubler_target(state: Arc<Doubler>) -> Arc<dyn Target> {
    let mut table = MethodTable::<Doubler>::new();
    table
        .callable("method", |d, args| async move {
            let chain = context::with_current(|c| c.call_chain.clone()).unwrap_or_default();
            d.callers.lock().push(chain);
            Ok(json!(args.first().and_then(Value::as_i64).unwrap_or(0) * 2))
        })
        .callable("fail", |_d, _args| async move {
            Err(MeshError::application("NotToday", "refused"))
        })
        // Results shaped like chains aimed at the caller's own methods.
        .callable("chain_result", |_d, _args| async move {
            Ok(Continuation::new().call("purge", args![]).marker())
        })
        .callable("chain_in_error", |_d, _args| async move {
            Err(MeshError::Application {
                name: "Sly".into(),
                message: "see data".into(),
                data: Some(Continuation::new().call("purge", args![]).marker()),
            })
        });
    Arc::new(Instance::new(state, table))
}

struct Mesh {
    a: Arc<MeshNode>,
    b: Arc<MeshNode>,
    rec: Arc<Recorder>,
    doubler: Arc<Doubler>,
}

fn mesh() -> Mesh {
    let transport = LocalMesh::new();
    let rec = Arc::new(Recorder::default());
    let doubler = Arc::new(Doubler {
        callers: Mutex::new(Vec::new()),
    });

    let a = Arc::new(
        MeshNode::new(NodeKind::StatelessNode, recorder_target(rec.clone()), transport.clone()).with_binding("A"),
    );
    // B learns its instance name from the first envelope it receives.
    let b = Arc::new(MeshNode::new(
        NodeKind::StatefulActor,
        doubler_target(doubler.clone()),
        transport.clone(),
    ));
    transport.register("A", None, a.clone());
    transport.register_fallback("B", b.clone());

    Mesh { a, b, rec, doubler }
}

#[tokio::test]
async fn call_then_handle_result_locally() {
    let m = mesh();
    let identity_before = m.a.identity();

    let ctn = Continuation::new();
    m.a.call(
        "B",
        Some("inst-1".into()),
        &ctn.call("method", args![42]),
        Some(ctn.call("handle", args![Continuation::result()])),
        CallOptions::default(),
    );
    m.a.wait_idle().await;

    assert_eq!(*m.rec.seen.lock(), vec![json!(84)]);
    assert_eq!(m.a.identity(), identity_before);
    assert_eq!(m.a.instance(), None);
    assert_eq!(m.b.identity(), Some(NodeIdentity::actor("B", "inst-1")));
    assert_eq!(*m.doubler.callers.lock(), vec![vec![NodeIdentity::stateless("A")]]);
}

#[tokio::test]
async fn remote_failure_reaches_handler_as_error_value() {
    let m = mesh();
    let ctn = Continuation::new();
    m.a.call(
        "B",
        Some("inst-1".into()),
        &ctn.call("fail", args![]),
        Some(ctn.call("handle", args![Continuation::result()])),
        CallOptions::default(),
    );
    m.a.wait_idle().await;

    let seen = m.rec.seen.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        marker::as_error_value(&seen[0]),
        Some(MeshError::application("NotToday", "refused"))
    );
}

#[tokio::test]
async fn handler_observes_context_captured_at_call_time() {
    let m = mesh();
    let outer = CallContext {
        call_chain: vec![NodeIdentity::client("client", "ada.phone")],
        origin_auth: None,
        state: serde_json::Map::from_iter([("step".to_string(), json!("before"))]),
    };

    let a = m.a.clone();
    context::run_with(outer, async move {
        let ctn = Continuation::new();
        a.call(
            "B",
            Some("inst-1".into()),
            &ctn.call("method", args![1]),
            Some(ctn.call("handle", args![Continuation::result()])),
            CallOptions::default(),
        );
        context::update_state(|s| {
            s.insert("step".into(), json!("after"));
        });
    })
    .await;
    m.a.wait_idle().await;

    let contexts = m.rec.contexts.lock().clone();
    let ctx = contexts[0].as_ref().expect("handler runs inside captured context");
    assert_eq!(ctx.state["step"], json!("before"));
    assert_eq!(ctx.call_chain.len(), 1);

    // B saw the inherited chain extended by one hop.
    let callers = m.doubler.callers.lock().clone();
    assert_eq!(
        callers[0],
        vec![NodeIdentity::client("client", "ada.phone"), NodeIdentity::stateless("A")]
    );
}

#[tokio::test]
async fn call_without_handler_swallows_failure() {
    let m = mesh();
    m.a.call(
        "nowhere",
        None,
        &Continuation::new().call("method", args![1]),
        None,
        CallOptions::default(),
    );
    m.a.wait_idle().await;
    assert!(m.rec.seen.lock().is_empty());
    assert_eq!(m.a.outstanding(), 0);
}

#[tokio::test]
async fn call_raw_reraises_remote_errors() {
    let m = mesh();
    let chain = Continuation::new().call("fail", args![]).into_chain();
    let err = m
        .a
        .call_raw("B", Some("inst-1"), &chain, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err, MeshError::application("NotToday", "refused"));
}

#[tokio::test]
async fn remote_results_are_handed_over_as_data() {
    let m = mesh();
    let ctn = Continuation::new();
    for method in ["chain_result", "chain_in_error"] {
        m.a.call(
            "B",
            Some("inst-1".into()),
            &ctn.call(method, args![]),
            Some(ctn.call("handle", args![Continuation::result()])),
            CallOptions::default(),
        );
    }
    m.a.wait_idle().await;

    assert_eq!(m.rec.purged.load(Ordering::SeqCst), 0);
    let seen = m.rec.seen.lock().clone();
    assert_eq!(seen.len(), 2);
    let smuggled = Continuation::new().call("purge", args![]).marker();
    assert!(seen.contains(&smuggled), "{seen:?}");
    let err = seen.iter().find_map(marker::as_error_value).expect("error value delivered");
    assert!(matches!(err, MeshError::Application { data: Some(d), .. } if d == smuggled));
}
