//! Persistence boundary
//!
//! The engine and the synchronizer only see immutable snapshots and issue
//! explicit writes. Every write method is applied atomically.

pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::DirectorError;
use crate::models::{AppliedDeployment, ConnectionLog, Container, DeploymentSnapshot, Node};

pub use memory::{FleetState, MemoryStore};

/// Outcome of one container synchronization pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSyncBatch {
    /// Rows to insert or replace, matched by id
    pub upserts: Vec<Container>,

    /// Ids of rows to delete
    pub removals: Vec<Uuid>,
}

impl ContainerSyncBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

/// Repository the director reads desired state from and writes outcomes to
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>, DirectorError>;

    async fn enabled_nodes(&self) -> Result<Vec<Node>, DirectorError>;

    /// Every deployment of a node, with node, compose and versions resolved
    async fn node_deployments(&self, node_id: Uuid) -> Result<Vec<DeploymentSnapshot>, DirectorError>;

    async fn get_deployment(&self, deployment_id: Uuid) -> Result<Option<DeploymentSnapshot>, DirectorError>;

    async fn mark_node_failed(&self, node_id: Uuid) -> Result<(), DirectorError>;

    async fn mark_deployment_failed(&self, deployment_id: Uuid) -> Result<(), DirectorError>;

    async fn record_deployment_applied(&self, applied: AppliedDeployment) -> Result<(), DirectorError>;

    async fn deployment_containers(&self, deployment_ids: &[Uuid]) -> Result<Vec<Container>, DirectorError>;

    async fn commit_container_sync(&self, batch: ContainerSyncBatch) -> Result<(), DirectorError>;

    async fn append_connection_log(&self, entry: ConnectionLog) -> Result<(), DirectorError>;
}
