//! `mc-client` — connect an application to the mesh through a gateway.
//!
//! A client is a mesh participant that cannot be dialled directly (a
//! browser tab, a phone app).  It holds one WebSocket to a gateway, calls
//! mesh nodes through it, and executes calls that mesh nodes make back to
//! it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your app                                                 │
//! │                                                           │
//! │   let client = MeshClientBuilder::new()                   │
//! │       .gateway_ws_url("ws://gw:3210/v1/clients/ws")       │
//! │       .instance("ada.phone")                              │
//! │       .token(token)                                       │
//! │       .target(my_target)                                  │
//! │       .spawn()?;                                          │
//! │                                                           │
//! │   let chain = Continuation::new().call("join", args![1]); │
//! │   client.call("Room", Some("r1"), chain.chain()).await?;  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Connect WS with `instance=<name>&token=<bearer>` query params
//! 2. Wait for `connection_status { subscription_required }` and report it
//! 3. Flush the outbound queue, in order
//! 4. Main loop:
//!    - On `call_response`: settle the matching pending call
//!    - On `incoming_call`: check the policy, execute against the target
//!      inside the caller's context, always send `incoming_call_response`
//!    - On `ping`: reply `pong`
//! 5. On disconnect: fail calls that were in flight, queue new ones, and
//!    reconnect with jittered exponential back-off.  Close code 4401
//!    refreshes the token first.

pub mod builder;
pub mod client;
pub mod policy;
pub mod queue;
pub mod reconnect;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::MeshClientBuilder;
pub use client::MeshClient;
pub use policy::{AllowAll, IncomingCallPolicy, SameClientOnly};
pub use reconnect::ReconnectBackoff;
pub use types::{ClientError, ClientState, StaticToken, TokenProvider};

pub use mc_chain::{args, Continuation, OperationChain};
pub use mc_domain::{MeshError, NodeIdentity};
