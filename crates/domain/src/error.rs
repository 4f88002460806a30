use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error taxonomy shared by every node, gateway, and client.
///
/// Errors never cross a transport boundary as panics or thrown values: they
/// are downgraded to a [`WireError`] and re-raised on the other side via
/// [`MeshError::from_wire`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error("invalid operation chain: {0}")]
    InvalidChain(String),

    #[error("method `{0}` is not callable")]
    NotCallable(String),

    #[error("guard rejected call to `{method}`: {reason}")]
    GuardRejected { method: String, reason: String },

    #[error("unsupported envelope version: {}", display_version(.0))]
    UnsupportedVersion(Option<u32>),

    #[error("envelope has no call context")]
    MissingContext,

    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("identity mismatch: bound to `{bound}`, received `{received}`")]
    IdentityMismatch { bound: String, received: String },

    #[error("client disconnected: {0}")]
    ClientDisconnected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("codec: {0}")]
    Codec(String),

    /// Raised by a callee's method body. Passed through opaquely.
    #[error("{name}: {message}")]
    Application {
        name: String,
        message: String,
        data: Option<Value>,
    },
}

fn display_version(v: &Option<u32>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "missing".into(),
    }
}

/// Stable, wire-visible error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidChain,
    NotCallable,
    GuardRejected,
    UnsupportedVersion,
    MissingContext,
    UnknownIdentity,
    IdentityMismatch,
    ClientDisconnected,
    Timeout,
    Overloaded,
    Transport,
    Codec,
    Application,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidChain => "invalid_chain",
            ErrorKind::NotCallable => "not_callable",
            ErrorKind::GuardRejected => "guard_rejected",
            ErrorKind::UnsupportedVersion => "unsupported_version",
            ErrorKind::MissingContext => "missing_context",
            ErrorKind::UnknownIdentity => "unknown_identity",
            ErrorKind::IdentityMismatch => "identity_mismatch",
            ErrorKind::ClientDisconnected => "client_disconnected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Transport => "transport",
            ErrorKind::Codec => "codec",
            ErrorKind::Application => "application",
        };
        f.write_str(s)
    }
}

/// Transport form of a [`MeshError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl MeshError {
    /// Shorthand for an application error raised by a method body.
    pub fn application(name: impl Into<String>, message: impl Into<String>) -> Self {
        MeshError::Application {
            name: name.into(),
            message: message.into(),
            data: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::InvalidChain(_) => ErrorKind::InvalidChain,
            MeshError::NotCallable(_) => ErrorKind::NotCallable,
            MeshError::GuardRejected { .. } => ErrorKind::GuardRejected,
            MeshError::UnsupportedVersion(_) => ErrorKind::UnsupportedVersion,
            MeshError::MissingContext => ErrorKind::MissingContext,
            MeshError::UnknownIdentity(_) => ErrorKind::UnknownIdentity,
            MeshError::IdentityMismatch { .. } => ErrorKind::IdentityMismatch,
            MeshError::ClientDisconnected(_) => ErrorKind::ClientDisconnected,
            MeshError::Timeout(_) => ErrorKind::Timeout,
            MeshError::Overloaded(_) => ErrorKind::Overloaded,
            MeshError::Transport(_) => ErrorKind::Transport,
            MeshError::Codec(_) => ErrorKind::Codec,
            MeshError::Application { .. } => ErrorKind::Application,
        }
    }

    /// Validation failures are rejected before any execution and are never
    /// worth retrying.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            MeshError::InvalidChain(_) | MeshError::UnsupportedVersion(_) | MeshError::MissingContext
        )
    }

    pub fn to_wire(&self) -> WireError {
        let (message, data) = match self {
            MeshError::InvalidChain(m)
            | MeshError::NotCallable(m)
            | MeshError::UnknownIdentity(m)
            | MeshError::ClientDisconnected(m)
            | MeshError::Timeout(m)
            | MeshError::Overloaded(m)
            | MeshError::Transport(m)
            | MeshError::Codec(m) => (m.clone(), None),
            MeshError::GuardRejected { method, reason } => (
                reason.clone(),
                Some(serde_json::json!({ "method": method })),
            ),
            MeshError::UnsupportedVersion(v) => (
                self.to_string(),
                Some(serde_json::json!({ "version": v })),
            ),
            MeshError::MissingContext => (self.to_string(), None),
            MeshError::IdentityMismatch { bound, received } => (
                self.to_string(),
                Some(serde_json::json!({ "bound": bound, "received": received })),
            ),
            MeshError::Application { name, message, data } => (
                message.clone(),
                Some(serde_json::json!({ "name": name, "data": data })),
            ),
        };
        WireError {
            kind: self.kind(),
            message,
            data,
        }
    }

    pub fn from_wire(wire: WireError) -> Self {
        let field = |key: &str| -> Option<String> {
            wire.data
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        match wire.kind {
            ErrorKind::InvalidChain => MeshError::InvalidChain(wire.message),
            ErrorKind::NotCallable => MeshError::NotCallable(wire.message),
            ErrorKind::GuardRejected => MeshError::GuardRejected {
                method: field("method").unwrap_or_default(),
                reason: wire.message,
            },
            ErrorKind::UnsupportedVersion => MeshError::UnsupportedVersion(
                wire.data
                    .as_ref()
                    .and_then(|d| d.get("version"))
                    .and_then(Value::as_u64)
                    .and_then(|v| u32::try_from(v).ok()),
            ),
            ErrorKind::MissingContext => MeshError::MissingContext,
            ErrorKind::UnknownIdentity => MeshError::UnknownIdentity(wire.message),
            ErrorKind::IdentityMismatch => MeshError::IdentityMismatch {
                bound: field("bound").unwrap_or_default(),
                received: field("received").unwrap_or_default(),
            },
            ErrorKind::ClientDisconnected => MeshError::ClientDisconnected(wire.message),
            ErrorKind::Timeout => MeshError::Timeout(wire.message),
            ErrorKind::Overloaded => MeshError::Overloaded(wire.message),
            ErrorKind::Transport => MeshError::Transport(wire.message),
            ErrorKind::Codec => MeshError::Codec(wire.message),
            ErrorKind::Application => MeshError::Application {
                name: field("name").unwrap_or_else(|| "Error".into()),
                message: wire.message,
                data: wire
                    .data
                    .and_then(|mut d| d.get_mut("data").map(Value::take))
                    .filter(|d| !d.is_null()),
            },
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_error_keeps_custom_fields() {
        let err = MeshError::Application {
            name: "QuotaExceeded".into(),
            message: "too many rooms".into(),
            data: Some(serde_json::json!({ "limit": 3 })),
        };
        let wire = err.to_wire();
        assert_eq!(wire.kind, ErrorKind::Application);
        let back = MeshError::from_wire(serde_json::from_value(serde_json::to_value(&wire).unwrap()).unwrap());
        assert_eq!(back, err);
    }

    #[test]
    fn structured_variants_survive_the_wire() {
        for err in [
            MeshError::GuardRejected {
                method: "kick".into(),
                reason: "not an admin".into(),
            },
            MeshError::IdentityMismatch {
                bound: "X".into(),
                received: "Y".into(),
            },
            MeshError::UnsupportedVersion(Some(7)),
            MeshError::UnsupportedVersion(None),
            MeshError::MissingContext,
            MeshError::Timeout("call abc".into()),
        ] {
            assert_eq!(MeshError::from_wire(err.to_wire()), err);
        }
    }

    #[test]
    fn validation_errors_are_flagged() {
        assert!(MeshError::InvalidChain("x".into()).is_validation());
        assert!(MeshError::MissingContext.is_validation());
        assert!(!MeshError::Timeout("x".into()).is_validation());
    }

    #[test]
    fn kind_display_is_snake_case() {
        assert_eq!(ErrorKind::ClientDisconnected.to_string(), "client_disconnected");
        assert_eq!(
            serde_json::to_value(ErrorKind::NotCallable).unwrap(),
            serde_json::json!("not_callable")
        );
    }
}
