//! `mc-node` — mesh nodes.
//!
//! A [`MeshNode`] receives [`CallEnvelope`](mc_protocol::CallEnvelope)s,
//! executes their operation chains against its target inside the caller's
//! [`CallContext`](mc_protocol::CallContext), and calls other nodes through
//! a [`MeshTransport`].
//!
//! ```text
//!   node A                         transport                    node B
//!   call(B, chain, handler) ──►  envelope{v1, chain, ctx} ──►  receive_envelope
//!     (returns at once)                                           bind identity
//!                                                                 run_with(ctx, execute)
//!   handler($result := 84) ◄──   {"result": 84}           ◄──  wrap outcome
//! ```

pub mod context;
pub mod envelope;
pub mod node;
pub mod pending;
pub mod transport;

pub use context::CallOptions;
pub use node::{MeshNode, NodeConfig, NodeHooks};
pub use pending::{new_call_id, PendingCalls, Settlement};
pub use transport::{EnvelopeHandler, LocalMesh, MeshTransport};
