//! Observed container table
//!
//! Rows are rebuilt from `docker inspect` on every pass: matched rows are
//! replaced, unmatched inspects become new rows and rows with no inspect left
//! are deleted. The pass is committed as one batch and change events go out
//! only after the commit.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::authn::credentials::{CredentialProvider, NodeCredentials};
use crate::context::LogContext;
use crate::errors::DirectorError;
use crate::events::{ContainerChange, ContainerChangeKind, ContainerEvents};
use crate::models::container::parse_docker_time;
use crate::models::{Container, ContainerState, DeploymentSnapshot, Node};
use crate::remote::docker::ContainerInspect;
use crate::remote::RemoteExecutor;
use crate::store::{ContainerSyncBatch, Store};

/// Row changes for one deployment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDiff {
    pub upserts: Vec<Container>,
    pub removals: Vec<Uuid>,
    pub changes: Vec<ContainerChange>,
}

/// Reconcile the stored rows of a deployment with the containers just inspected.
///
/// Inspects without a service name or container number label are ignored.
pub fn update_containers_for_deployment(
    existing: &[Container],
    inspected: &[&ContainerInspect],
    deployment_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ContainerDiff, DirectorError> {
    let mut diff = ContainerDiff::default();
    let mut seen: HashMap<(String, u32), Uuid> = HashMap::new();

    for inspect in inspected {
        let (Some(service), Some(number)) = (inspect.service(), inspect.container_number()) else {
            debug!("Container {} has no compose service labels", inspect.id);
            continue;
        };
        if service.is_empty() {
            continue;
        }

        let previous = existing
            .iter()
            .find(|c| c.service_name == service && c.container_number == number);

        let key = (service.to_string(), number);
        let id = match seen.get(&key) {
            Some(id) => *id,
            None => previous.map(|c| c.id).unwrap_or_else(Uuid::new_v4),
        };

        let row = Container {
            id,
            deployment_id,
            service_name: service.to_string(),
            container_number: number,
            container_name: inspect.name.clone(),
            state: ContainerState::from_docker_status(&inspect.status)?,
            started_at: parse_docker_time(inspect.started_at.as_deref()),
            finished_at: parse_docker_time(inspect.finished_at.as_deref()),
            last_inspect_at: now,
            last_inspect: inspect.raw.clone(),
        };

        let kind = match previous {
            None => Some(ContainerChangeKind::Created),
            Some(previous) if previous.differs_observably(&row) => Some(ContainerChangeKind::Changed),
            Some(_) => None,
        };
        if seen.insert(key, id).is_some() {
            // same (service, number) twice in one pass, keep the later one
            diff.upserts.retain(|c| c.id != row.id);
            diff.changes.retain(|c| c.container_id != row.id);
        }
        if let Some(kind) = kind {
            diff.changes.push(ContainerChange {
                kind,
                container_id: row.id,
                deployment_id,
            });
        }
        diff.upserts.push(row);
    }

    let kept: HashSet<Uuid> = seen.into_values().collect();
    for stale in existing
        .iter()
        .filter(|c| c.deployment_id == deployment_id && !kept.contains(&c.id))
    {
        diff.removals.push(stale.id);
        diff.changes.push(ContainerChange {
            kind: ContainerChangeKind::Removed,
            container_id: stale.id,
            deployment_id,
        });
    }

    Ok(diff)
}

/// Keeps the container table of nodes in line with docker
pub struct ContainerStateSynchronizer {
    store: Arc<dyn Store>,
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialProvider>,
    events: ContainerEvents,
}

impl ContainerStateSynchronizer {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<dyn RemoteExecutor>,
        credentials: Arc<dyn CredentialProvider>,
        events: ContainerEvents,
    ) -> Self {
        Self {
            store,
            executor,
            credentials,
            events,
        }
    }

    /// Rebuild the rows of a node's deployments, or only of those running
    /// compose `project`. Returns the published changes.
    pub async fn resync(
        &self,
        node: &Node,
        creds: &NodeCredentials,
        project: Option<&str>,
    ) -> Result<Vec<ContainerChange>, DirectorError> {
        let deployments: Vec<DeploymentSnapshot> = self
            .store
            .node_deployments(node.id)
            .await?
            .into_iter()
            .filter(|s| match (&s.last_deployed, project) {
                (Some(last), Some(project)) => last.service_name == project,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect();
        if deployments.is_empty() {
            debug!("No deployed composes to resync on node {}", node.id);
            return Ok(Vec::new());
        }

        let projects: HashSet<&str> = deployments
            .iter()
            .filter_map(|s| s.last_deployed.as_ref())
            .map(|v| v.service_name.as_str())
            .collect();

        let listing = self.executor.list_containers(creds).await?;
        let mut inspected = Vec::new();
        for summary in listing
            .iter()
            .filter(|s| s.project().is_some_and(|p| projects.contains(p)))
        {
            inspected.push(self.executor.inspect_container(creds, &summary.id).await?);
        }

        let ids: Vec<Uuid> = deployments.iter().map(|s| s.deployment.id).collect();
        let existing = self.store.deployment_containers(&ids).await?;

        let now = Utc::now();
        let mut batch = ContainerSyncBatch::default();
        let mut changes = Vec::new();
        for snapshot in &deployments {
            let Some(last) = &snapshot.last_deployed else {
                continue;
            };
            let own: Vec<Container> = existing
                .iter()
                .filter(|c| c.deployment_id == snapshot.deployment.id)
                .cloned()
                .collect();
            let matching: Vec<&ContainerInspect> = inspected
                .iter()
                .filter(|i| i.project() == Some(last.service_name.as_str()))
                .collect();

            let diff = update_containers_for_deployment(&own, &matching, snapshot.deployment.id, now)?;
            batch.upserts.extend(diff.upserts);
            batch.removals.extend(diff.removals);
            changes.extend(diff.changes);
        }

        if !batch.is_empty() {
            self.store.commit_container_sync(batch).await?;
        }
        if !changes.is_empty() {
            info!("{} container changes on node {}", changes.len(), node.id);
        }
        self.events.publish_all(changes.clone());
        Ok(changes)
    }

    /// Resync once, then follow the node's docker events until cancelled.
    ///
    /// The event stream ending is an error so that the caller reconnects.
    pub async fn run_live(&self, node_id: Uuid, cancel: &CancellationToken) -> Result<(), DirectorError> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| DirectorError::NotFound(format!("node {}", node_id)))?;
        let ctx = LogContext::for_node(&node);

        async {
            let creds = self.credentials.node_credentials(&node).await?;

            // subscribe before the first pass so no change falls in between
            let mut events = self.executor.docker_events(&creds).await?;
            self.resync(&node, &creds, None).await?;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Err(DirectorError::Cancelled),
                    next = events.next() => next,
                };

                match next {
                    Some(Ok(event)) => {
                        if let Some((project, service)) = event.relevant_target() {
                            debug!("'{}' on {}/{}, resyncing", event.action, project, service);
                            self.resync(&node, &creds, Some(&project)).await?;
                        }
                    }
                    Some(Err(DirectorError::ContainerInfo(reason))) => {
                        warn!("Skipping unreadable docker event: {}", reason);
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(DirectorError::ContainerInfo(
                            "docker events stream ended".to_string(),
                        ))
                    }
                }
            }
        }
        .instrument(ctx.span("container_sync"))
        .await
    }
}
