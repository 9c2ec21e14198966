//! In-memory store backed by a JSON state file

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::DirectorError;
use crate::filesys::file::File;
use crate::models::{
    AppliedDeployment, Compose, ComposeVersion, ConnectionLog, Container, Deployment,
    DeploymentSnapshot, Node,
};
use crate::store::{ContainerSyncBatch, Store};

/// Oldest audit entries are dropped past this many
const MAX_CONNECTION_LOGS: usize = 10_000;

/// Everything the director knows about the fleet
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetState {
    #[serde(default)]
    pub nodes: BTreeMap<Uuid, Node>,

    #[serde(default)]
    pub composes: BTreeMap<Uuid, Compose>,

    #[serde(default)]
    pub compose_versions: BTreeMap<Uuid, ComposeVersion>,

    #[serde(default)]
    pub deployments: BTreeMap<Uuid, Deployment>,

    #[serde(default)]
    pub containers: BTreeMap<Uuid, Container>,

    #[serde(default)]
    pub connection_logs: Vec<ConnectionLog>,
}

impl FleetState {
    fn snapshot(&self, deployment: &Deployment) -> Option<DeploymentSnapshot> {
        let node = self.nodes.get(&deployment.node_id)?;
        let compose = self.composes.get(&deployment.compose_id)?;
        let current = self.compose_versions.get(&compose.current_id)?;
        let last_deployed = deployment
            .last_deployed_compose_version_id
            .and_then(|id| self.compose_versions.get(&id))
            .cloned();

        Some(DeploymentSnapshot {
            deployment: deployment.clone(),
            node: node.clone(),
            compose: compose.clone(),
            current: current.clone(),
            last_deployed,
        })
    }

    fn node_mut(&mut self, node_id: Uuid) -> Result<&mut Node, DirectorError> {
        self.nodes
            .get_mut(&node_id)
            .ok_or_else(|| DirectorError::NotFound(format!("node {}", node_id)))
    }

    fn deployment_mut(&mut self, deployment_id: Uuid) -> Result<&mut Deployment, DirectorError> {
        self.deployments
            .get_mut(&deployment_id)
            .ok_or_else(|| DirectorError::NotFound(format!("deployment {}", deployment_id)))
    }

    fn clear_compose_failures(&mut self, compose_id: Uuid) {
        for deployment in self.deployments.values_mut() {
            if deployment.compose_id == compose_id {
                deployment.reconciliation_failed = false;
            }
        }
    }
}

/// [`Store`] keeping the fleet in memory, optionally persisted to a file
pub struct MemoryStore {
    state: RwLock<FleetState>,
    file: Option<File>,
}

impl MemoryStore {
    pub fn new(state: FleetState) -> Self {
        Self {
            state: RwLock::new(state),
            file: None,
        }
    }

    /// Seed from `file` if it exists. The same file receives [`MemoryStore::save`].
    pub async fn load(file: File) -> Result<Self, DirectorError> {
        let state = if file.exists().await {
            let state: FleetState = file.read_json().await.map_err(|e| {
                DirectorError::StorageError(format!("Failed to read {}: {}", file.path().display(), e))
            })?;
            info!(
                "Loaded {} nodes and {} deployments from {}",
                state.nodes.len(),
                state.deployments.len(),
                file.path().display()
            );
            state
        } else {
            debug!("No state file at {}, starting empty", file.path().display());
            FleetState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            file: Some(file),
        })
    }

    pub async fn save(&self) -> Result<(), DirectorError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let state = self.state.read().await;
        file.write_json(&*state).await?;
        debug!("Saved fleet state to {}", file.path().display());
        Ok(())
    }

    /// Copy of the whole state
    pub async fn snapshot(&self) -> FleetState {
        self.state.read().await.clone()
    }

    pub async fn insert_node(&self, node: Node) {
        self.state.write().await.nodes.insert(node.id, node);
    }

    /// Add a compose together with its first version
    pub async fn insert_compose(&self, compose: Compose, version: ComposeVersion) -> Result<(), DirectorError> {
        if version.compose_id != compose.id || compose.current_id != version.id {
            return Err(DirectorError::StorageError(format!(
                "version {} is not the current version of compose {}",
                version.id, compose.id
            )));
        }
        let mut state = self.state.write().await;
        state.compose_versions.insert(version.id, version);
        state.composes.insert(compose.id, compose);
        Ok(())
    }

    /// Bind a compose to a node. One deployment per pair.
    pub async fn create_deployment(
        &self,
        node_id: Uuid,
        compose_id: Uuid,
        enabled: bool,
    ) -> Result<Deployment, DirectorError> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(&node_id) {
            return Err(DirectorError::NotFound(format!("node {}", node_id)));
        }
        if !state.composes.contains_key(&compose_id) {
            return Err(DirectorError::NotFound(format!("compose {}", compose_id)));
        }
        if state
            .deployments
            .values()
            .any(|d| d.node_id == node_id && d.compose_id == compose_id)
        {
            return Err(DirectorError::StorageError(format!(
                "compose {} is already deployed to node {}",
                compose_id, node_id
            )));
        }

        let deployment = Deployment {
            id: Uuid::new_v4(),
            node_id,
            compose_id,
            enabled,
            last_deployed_compose_version_id: None,
            last_deployed_node_version: None,
            last_deployed_as_enabled: None,
            last_check: None,
            reconciliation_failed: false,
            redeployment_requested_at: None,
        };
        state.deployments.insert(deployment.id, deployment.clone());
        Ok(deployment)
    }

    pub async fn set_node_enabled(&self, node_id: Uuid, enabled: bool) -> Result<(), DirectorError> {
        self.update_node(node_id, |node| node.enabled = enabled).await
    }

    /// Change node configuration. Bumps the version and clears the failure flag.
    pub async fn update_node<F>(&self, node_id: Uuid, change: F) -> Result<(), DirectorError>
    where
        F: FnOnce(&mut Node) + Send,
    {
        let mut state = self.state.write().await;
        let node = state.node_mut(node_id)?;
        change(node);
        node.version = Uuid::new_v4();
        node.reconciliation_failed = false;
        Ok(())
    }

    pub async fn request_node_redeploy(&self, node_id: Uuid) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        let node = state.node_mut(node_id)?;
        node.redeployment_requested_at = Some(Utc::now());
        node.reconciliation_failed = false;
        Ok(())
    }

    pub async fn set_deployment_enabled(&self, deployment_id: Uuid, enabled: bool) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        let deployment = state.deployment_mut(deployment_id)?;
        deployment.enabled = enabled;
        deployment.reconciliation_failed = false;
        Ok(())
    }

    pub async fn request_deployment_redeploy(&self, deployment_id: Uuid) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        let deployment = state.deployment_mut(deployment_id)?;
        deployment.redeployment_requested_at = Some(Utc::now());
        deployment.reconciliation_failed = false;
        Ok(())
    }

    /// Store a new immutable version and make it current. Returns its id.
    pub async fn update_compose(
        &self,
        compose_id: Uuid,
        content: impl Into<String>,
        directory: impl Into<String>,
        service_name: impl Into<String>,
        service_enabled: bool,
    ) -> Result<Uuid, DirectorError> {
        let mut state = self.state.write().await;
        let version = ComposeVersion {
            id: Uuid::new_v4(),
            compose_id,
            content: content.into(),
            directory: directory.into(),
            service_name: service_name.into(),
            service_enabled,
            redeployment_requested_at: None,
        };
        let version_id = version.id;

        let compose = state
            .composes
            .get_mut(&compose_id)
            .ok_or_else(|| DirectorError::NotFound(format!("compose {}", compose_id)))?;
        compose.current_id = version_id;
        state.compose_versions.insert(version_id, version);
        state.clear_compose_failures(compose_id);
        Ok(version_id)
    }

    /// Ask for a restart of the current version wherever it is deployed
    pub async fn request_compose_redeploy(&self, compose_id: Uuid) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        let current_id = state
            .composes
            .get(&compose_id)
            .map(|c| c.current_id)
            .ok_or_else(|| DirectorError::NotFound(format!("compose {}", compose_id)))?;
        if let Some(version) = state.compose_versions.get_mut(&current_id) {
            version.redeployment_requested_at = Some(Utc::now());
        }
        state.clear_compose_failures(compose_id);
        Ok(())
    }

    pub async fn connection_logs(&self) -> Vec<ConnectionLog> {
        self.state.read().await.connection_logs.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_node(&self, node_id: Uuid) -> Result<Option<Node>, DirectorError> {
        Ok(self.state.read().await.nodes.get(&node_id).cloned())
    }

    async fn enabled_nodes(&self) -> Result<Vec<Node>, DirectorError> {
        Ok(self
            .state
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.enabled)
            .cloned()
            .collect())
    }

    async fn node_deployments(&self, node_id: Uuid) -> Result<Vec<DeploymentSnapshot>, DirectorError> {
        let state = self.state.read().await;
        let mut snapshots = Vec::new();
        for deployment in state.deployments.values().filter(|d| d.node_id == node_id) {
            match state.snapshot(deployment) {
                Some(snapshot) => snapshots.push(snapshot),
                None => warn!(
                    "Deployment {} references a missing node, compose or version",
                    deployment.id
                ),
            }
        }
        Ok(snapshots)
    }

    async fn get_deployment(&self, deployment_id: Uuid) -> Result<Option<DeploymentSnapshot>, DirectorError> {
        let state = self.state.read().await;
        Ok(state
            .deployments
            .get(&deployment_id)
            .and_then(|d| state.snapshot(d)))
    }

    async fn mark_node_failed(&self, node_id: Uuid) -> Result<(), DirectorError> {
        self.state.write().await.node_mut(node_id)?.reconciliation_failed = true;
        Ok(())
    }

    async fn mark_deployment_failed(&self, deployment_id: Uuid) -> Result<(), DirectorError> {
        self.state
            .write()
            .await
            .deployment_mut(deployment_id)?
            .reconciliation_failed = true;
        Ok(())
    }

    async fn record_deployment_applied(&self, applied: AppliedDeployment) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        let compose_id = state
            .deployments
            .get(&applied.deployment_id)
            .map(|d| d.compose_id)
            .ok_or_else(|| DirectorError::NotFound(format!("deployment {}", applied.deployment_id)))?;

        let version_compose = state
            .compose_versions
            .get(&applied.compose_version_id)
            .map(|v| v.compose_id);
        if version_compose != Some(compose_id) {
            return Err(DirectorError::StorageError(format!(
                "version {} does not belong to compose {}",
                applied.compose_version_id, compose_id
            )));
        }

        let deployment = state.deployment_mut(applied.deployment_id)?;
        deployment.last_deployed_compose_version_id = Some(applied.compose_version_id);
        deployment.last_deployed_node_version = Some(applied.node_version);
        deployment.last_deployed_as_enabled = Some(applied.as_enabled);
        deployment.last_check = Some(applied.checked_at);
        Ok(())
    }

    async fn deployment_containers(&self, deployment_ids: &[Uuid]) -> Result<Vec<Container>, DirectorError> {
        Ok(self
            .state
            .read()
            .await
            .containers
            .values()
            .filter(|c| deployment_ids.contains(&c.deployment_id))
            .cloned()
            .collect())
    }

    async fn commit_container_sync(&self, batch: ContainerSyncBatch) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        // validate first so a bad batch leaves nothing half applied
        if let Some(orphan) = batch
            .upserts
            .iter()
            .find(|c| !state.deployments.contains_key(&c.deployment_id))
        {
            return Err(DirectorError::StorageError(format!(
                "container {} references unknown deployment {}",
                orphan.id, orphan.deployment_id
            )));
        }

        for id in &batch.removals {
            state.containers.remove(id);
        }
        for container in batch.upserts {
            state.containers.insert(container.id, container);
        }
        Ok(())
    }

    async fn append_connection_log(&self, entry: ConnectionLog) -> Result<(), DirectorError> {
        let mut state = self.state.write().await;
        state.connection_logs.push(entry);
        let overflow = state.connection_logs.len().saturating_sub(MAX_CONNECTION_LOGS);
        if overflow > 0 {
            state.connection_logs.drain(..overflow);
        }
        Ok(())
    }
}
