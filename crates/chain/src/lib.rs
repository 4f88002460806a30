//! `mc-chain` — operation chains as transportable values.
//!
//! A caller describes "get this field, call that method with these
//! arguments" as an [`OperationChain`], built with a [`Continuation`].  The
//! chain is plain data: it can be sent to another node, persisted for later,
//! or embedded inside another chain's arguments as a nested marker meaning
//! "substitute the result of this chain here".
//!
//! ```text
//!   Continuation::new()            ──►  []
//!       .get("rooms")              ──►  [get rooms]
//!       .call("join", args![42])   ──►  [get rooms, get join, apply [42]]
//! ```
//!
//! The receiving side replays the chain against a [`Target`] with
//! [`execute_operation_chain`].  Only methods registered as callable in a
//! [`MethodTable`] may be reached by an externally-originated chain; the
//! reserved `svc` accessor exposes trusted infrastructure services and
//! bypasses that check.

pub mod continuation;
pub mod executor;
pub mod marker;
pub mod operation;
pub mod target;

pub use continuation::{Arg, Continuation};
pub use executor::{
    execute_operation_chain, execute_resolving, execute_with_result, replace_nested_operation_markers,
    resolve_nested_operation_markers, validate_chain, Executed, ExecuteOptions,
};
pub use operation::{Operation, OperationChain};
pub use target::{BoundMethod, Instance, Member, MethodTable, Services, Target, SERVICE_ACCESSOR};
