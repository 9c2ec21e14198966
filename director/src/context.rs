//! Correlation context threaded through reconciliation calls

use tracing::Span;
use uuid::Uuid;

use crate::models::{DeploymentSnapshot, Node};

/// Identifiers every log line and audit entry of an operation is scoped to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogContext {
    pub node_id: Option<Uuid>,
    pub deployment_id: Option<Uuid>,
    pub compose_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

impl LogContext {
    pub fn for_node(node: &Node) -> Self {
        Self {
            node_id: Some(node.id),
            tenant_id: node.tenant_id,
            ..Default::default()
        }
    }

    pub fn for_node_id(node_id: Uuid) -> Self {
        Self {
            node_id: Some(node_id),
            ..Default::default()
        }
    }

    /// Narrow the context to one deployment of the node
    pub fn with_deployment(&self, snapshot: &DeploymentSnapshot) -> Self {
        Self {
            node_id: Some(snapshot.node.id),
            deployment_id: Some(snapshot.deployment.id),
            compose_id: Some(snapshot.compose.id),
            tenant_id: self.tenant_id.or(snapshot.compose.tenant_id),
        }
    }

    pub fn span(&self, name: &'static str) -> Span {
        tracing::info_span!(
            "scope",
            op = name,
            node_id = ?self.node_id,
            deployment_id = ?self.deployment_id,
            compose_id = ?self.compose_id,
            tenant_id = ?self.tenant_id,
        )
    }
}
