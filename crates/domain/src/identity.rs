//! Node identities and addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What kind of participant a mesh node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Persistent, addressed by binding + instance name.
    StatefulActor,
    /// Stateless compute, addressed by binding only.
    StatelessNode,
    /// External client connected through a gateway.
    Client,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::StatefulActor => write!(f, "stateful_actor"),
            NodeKind::StatelessNode => write!(f, "stateless_node"),
            NodeKind::Client => write!(f, "client"),
        }
    }
}

/// Full identity of a node as it appears in a call chain.
///
/// `instance_name` is absent for stateless nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeIdentity {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub binding_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl NodeIdentity {
    pub fn actor(binding: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::StatefulActor,
            binding_name: binding.into(),
            instance_name: Some(instance.into()),
        }
    }

    pub fn stateless(binding: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::StatelessNode,
            binding_name: binding.into(),
            instance_name: None,
        }
    }

    pub fn client(binding: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Client,
            binding_name: binding.into(),
            instance_name: Some(instance.into()),
        }
    }

    /// The address part of this identity.
    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            binding_name: self.binding_name.clone(),
            instance_name: self.instance_name.clone(),
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.node_ref())
    }
}

/// Address of a node: binding name plus optional instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRef {
    pub binding_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl NodeRef {
    pub fn new(binding: impl Into<String>, instance: Option<impl Into<String>>) -> Self {
        Self {
            binding_name: binding.into(),
            instance_name: instance.map(Into::into),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.instance_name {
            Some(instance) => write!(f, "{}/{}", self.binding_name, instance),
            None => write!(f, "{}", self.binding_name),
        }
    }
}
