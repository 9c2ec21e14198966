//! Container table synchronization

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use supercompose_director::authn::credentials::{CredentialProvider, NodeCredentials, StoredCredentialProvider};
use supercompose_director::containers::ContainerStateSynchronizer;
use supercompose_director::events::{ContainerChangeKind, ContainerEvents};
use supercompose_director::models::{AppliedDeployment, ContainerState};
use supercompose_director::reconcile::{EngineOptions, ReconciliationEngine};
use supercompose_director::store::Store;

use crate::support::{container_json, FakeExecutor, Fleet};

async fn deployed_fleet() -> (Fleet, NodeCredentials) {
    let fleet = Fleet::new(false, true).await;
    fleet
        .store
        .record_deployment_applied(AppliedDeployment {
            deployment_id: fleet.deployment.id,
            compose_version_id: fleet.compose.current_id,
            node_version: fleet.node.version,
            as_enabled: true,
            checked_at: Utc::now(),
        })
        .await
        .unwrap();
    let creds = StoredCredentialProvider
        .node_credentials(&fleet.node)
        .await
        .unwrap();
    (fleet, creds)
}

fn synchronizer(fleet: &Fleet, executor: &Arc<FakeExecutor>, events: &ContainerEvents) -> ContainerStateSynchronizer {
    ContainerStateSynchronizer::new(
        fleet.store.clone(),
        executor.clone(),
        Arc::new(StoredCredentialProvider),
        events.clone(),
    )
}

#[tokio::test]
async fn test_rows_follow_docker_exactly() {
    let (fleet, creds) = deployed_fleet().await;
    let executor = FakeExecutor::new();
    let events = ContainerEvents::default();
    let mut rx = events.subscribe();
    let sync = synchronizer(&fleet, &executor, &events);

    executor.set_containers(vec![
        container_json("a1", "web", "app", 1, "running"),
        container_json("d1", "web", "db", 1, "running"),
        container_json("x1", "other", "app", 1, "running"),
    ]);
    let changes = sync.resync(&fleet.node, &creds, None).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|c| c.kind == ContainerChangeKind::Created));

    let rows = fleet
        .store
        .deployment_containers(&[fleet.deployment.id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    let app = rows.iter().find(|c| c.service_name == "app").unwrap();
    assert_eq!(app.container_name, "web_app_1");
    assert_eq!(app.state, ContainerState::Running);
    assert_eq!(app.finished_at, None);

    // app stopped, db removed
    executor.set_containers(vec![container_json("a2", "web", "app", 1, "exited")]);
    let changes = sync.resync(&fleet.node, &creds, None).await.unwrap();
    let kinds: Vec<_> = changes.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ContainerChangeKind::Changed, ContainerChangeKind::Removed]);

    let rows = fleet
        .store
        .deployment_containers(&[fleet.deployment.id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, app.id);
    assert_eq!(rows[0].state, ContainerState::Exited);

    // nothing observable changed
    let changes = sync.resync(&fleet.node, &creds, None).await.unwrap();
    assert!(changes.is_empty());

    let mut published = Vec::new();
    while let Ok(change) = rx.try_recv() {
        published.push(change.kind);
    }
    assert_eq!(
        published,
        vec![
            ContainerChangeKind::Created,
            ContainerChangeKind::Created,
            ContainerChangeKind::Changed,
            ContainerChangeKind::Removed,
        ]
    );
}

#[tokio::test]
async fn test_resync_of_unrelated_project_is_a_no_op() {
    let (fleet, creds) = deployed_fleet().await;
    let executor = FakeExecutor::new();
    let sync = synchronizer(&fleet, &executor, &ContainerEvents::default());

    executor.set_containers(vec![container_json("x1", "other", "app", 1, "running")]);
    let changes = sync.resync(&fleet.node, &creds, Some("other")).await.unwrap();
    assert!(changes.is_empty());
    assert!(fleet.store.snapshot().await.containers.is_empty());
}

#[tokio::test]
async fn test_never_deployed_compose_has_no_rows() {
    let fleet = Fleet::new(false, true).await;
    let creds = StoredCredentialProvider
        .node_credentials(&fleet.node)
        .await
        .unwrap();
    let executor = FakeExecutor::new();
    let sync = synchronizer(&fleet, &executor, &ContainerEvents::default());

    executor.set_containers(vec![container_json("a1", "web", "app", 1, "running")]);
    let changes = sync.resync(&fleet.node, &creds, None).await.unwrap();
    assert!(changes.is_empty());
    assert!(fleet.store.snapshot().await.containers.is_empty());
}

#[tokio::test]
async fn test_containers_of_project_outside_its_own_directory() {
    let fleet = Fleet::new(false, true).await;
    let content = fleet.current_version().await.content;
    fleet
        .store
        .update_compose(fleet.compose.id, content, "/opt/stacks/app", "web", false)
        .await
        .unwrap();

    let executor = FakeExecutor::new();
    ReconciliationEngine::new(
        fleet.store.clone(),
        executor.clone(),
        Arc::new(StoredCredentialProvider),
        EngineOptions::default(),
    )
    .process_node_updates(fleet.node.id, &CancellationToken::new())
    .await
    .unwrap();

    // docker labels containers with the project the command named
    let up = executor
        .calls()
        .into_iter()
        .find(|c| c.ends_with("up -d --remove-orphans"))
        .unwrap();
    let project = up
        .split("--project-name '")
        .nth(1)
        .and_then(|rest| rest.split('\'').next())
        .unwrap()
        .to_string();
    executor.set_containers(vec![container_json("a1", &project, "app", 1, "running")]);

    let creds = StoredCredentialProvider
        .node_credentials(&fleet.node)
        .await
        .unwrap();
    let events = ContainerEvents::default();
    let changes = synchronizer(&fleet, &executor, &events)
        .resync(&fleet.node, &creds, None)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);

    let rows = fleet
        .store
        .deployment_containers(&[fleet.deployment.id])
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].service_name, "app");
}
