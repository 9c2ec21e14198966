//! The two workloads the director supervises per node

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::containers::ContainerStateSynchronizer;
use crate::errors::DirectorError;
use crate::reconcile::ReconciliationEngine;
use crate::supervisor::orchestrator::NodeWorkload;

/// Converges a node's deployments, then completes
pub struct ReconcileWorkload {
    engine: Arc<ReconciliationEngine>,
}

impl ReconcileWorkload {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl NodeWorkload for ReconcileWorkload {
    fn name(&self) -> &'static str {
        "reconcile"
    }

    fn lease_key(&self, node_id: Uuid) -> String {
        node_id.to_string()
    }

    async fn run(&self, node_id: Uuid, cancel: CancellationToken) -> Result<(), DirectorError> {
        self.engine.process_node_updates(node_id, &cancel).await
    }
}

/// Follows a node's docker events for as long as it is supervised
pub struct ContainerSyncWorkload {
    synchronizer: Arc<ContainerStateSynchronizer>,
}

impl ContainerSyncWorkload {
    pub fn new(synchronizer: Arc<ContainerStateSynchronizer>) -> Self {
        Self { synchronizer }
    }
}

#[async_trait]
impl NodeWorkload for ContainerSyncWorkload {
    fn name(&self) -> &'static str {
        "container_sync"
    }

    fn lease_key(&self, node_id: Uuid) -> String {
        format!("{}_listener", node_id)
    }

    async fn run(&self, node_id: Uuid, cancel: CancellationToken) -> Result<(), DirectorError> {
        self.synchronizer.run_live(node_id, &cancel).await
    }
}
