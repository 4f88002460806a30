//! `mc-gateway` — bridges external clients into the mesh.
//!
//! Each client instance owns one [`slot::ClientSlot`].  Mesh calls addressed
//! to the client binding are routed by [`hub::GatewayHub`] to the slot and
//! forwarded over the client's WebSocket; calls the client makes are relayed
//! into the mesh under the identity its credential proved.

pub mod api;
pub mod auth;
pub mod cli;
pub mod echo;
pub mod error;
pub mod hub;
pub mod slot;
pub mod state;
pub mod ws;
