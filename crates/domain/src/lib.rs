//! Shared vocabulary for every meshcall crate: node identities, the error
//! taxonomy carried across node boundaries, and configuration.

pub mod config;
pub mod error;
pub mod identity;

pub use error::{ErrorKind, MeshError, WireError};
pub use identity::{NodeIdentity, NodeKind, NodeRef};
