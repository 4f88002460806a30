//! Built-in stateless `echo` node, so a fresh gateway has something for
//! clients to call.

use std::sync::Arc;

use mc_chain::{Instance, MethodTable, Target};
use mc_domain::config::Config;
use mc_domain::NodeKind;
use mc_node::{context, LocalMesh, MeshNode, NodeConfig};
use serde_json::{json, Value};

pub const BINDING: &str = "echo";

struct Echo;

fn target() -> Arc<dyn Target> {
    let mut table = MethodTable::<Echo>::new();
    table
        .callable("echo", |_, args| async move {
            Ok(match args.len() {
                0 => Value::Null,
                1 => args.into_iter().next().unwrap_or(Value::Null),
                _ => Value::Array(args),
            })
        })
        .callable("ping", |_, _| async move { Ok(json!("pong")) })
        // Who the gateway says is calling, as seen through the call context.
        .callable("whoami", |_, _| async move {
            let seen = context::with_current(|ctx| {
                json!({
                    "caller": ctx.caller(),
                    "origin": ctx.origin(),
                    "subject": ctx.origin_auth.as_ref().map(|a| a.subject.clone()),
                    "hops": ctx.call_chain.len(),
                })
            });
            Ok(seen.unwrap_or(Value::Null))
        });
    Arc::new(Instance::new(Arc::new(Echo), table))
}

pub fn node(config: &Config, mesh: Arc<LocalMesh>) -> Arc<MeshNode> {
    Arc::new(
        MeshNode::new(NodeKind::StatelessNode, target(), mesh)
            .with_binding(BINDING)
            .with_config(NodeConfig::from(config)),
    )
}
