//! Append-only audit records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::LogContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Info,
    Warning,
    Error,
}

/// Audit entry scoped to a node, deployment, compose and tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub id: Uuid,
    pub severity: LogSeverity,
    pub message: String,
    #[serde(default)]
    pub error: Option<String>,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub node_id: Option<Uuid>,
    #[serde(default)]
    pub deployment_id: Option<Uuid>,
    #[serde(default)]
    pub compose_id: Option<Uuid>,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
}

impl ConnectionLog {
    pub fn new(ctx: &LogContext, severity: LogSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            severity,
            message: message.into(),
            error: None,
            time: Utc::now(),
            node_id: ctx.node_id,
            deployment_id: ctx.deployment_id,
            compose_id: ctx.compose_id,
            tenant_id: ctx.tenant_id,
        }
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
