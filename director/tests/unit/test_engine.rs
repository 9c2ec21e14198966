//! Reconciliation engine tests against an in-memory node

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use supercompose_director::authn::credentials::StoredCredentialProvider;
use supercompose_director::errors::DirectorError;
use supercompose_director::models::{Compose, Deployment, LogSeverity};
use supercompose_director::reconcile::{EngineOptions, ReconciliationEngine};
use supercompose_director::store::Store;

use crate::support::{compose, FakeExecutor, Fleet, COMPOSE_BINARY};

const COMPOSE_FILE: &str = "/srv/web/docker-compose.yml";
const UNIT_FILE: &str = "/etc/systemd/system/web.service";

fn engine(fleet: &Fleet, executor: &Arc<FakeExecutor>) -> ReconciliationEngine {
    ReconciliationEngine::new(
        fleet.store.clone(),
        executor.clone(),
        Arc::new(StoredCredentialProvider),
        EngineOptions::default(),
    )
}

fn compose_command(args: &str) -> String {
    format!("{} --project-name 'web' --file '{}' {}", COMPOSE_BINARY, COMPOSE_FILE, args)
}

async fn with_sibling(fleet: &Fleet) -> (Compose, Deployment) {
    let (api, api_version) = compose("api", false);
    fleet.store.insert_compose(api.clone(), api_version).await.unwrap();
    let deployment = fleet
        .store
        .create_deployment(fleet.node.id, api.id, true)
        .await
        .unwrap();
    (api, deployment)
}

#[tokio::test]
async fn test_fresh_deployment_is_brought_up() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let calls = executor.calls();
    assert_eq!(
        &calls[..3],
        &["systemctl --version", "docker --version", "docker-compose --version"]
    );
    assert_eq!(
        executor.file(COMPOSE_FILE).as_deref(),
        Some("services:\n  app:\n    image: nginx\n")
    );
    assert!(calls.contains(&compose_command("up -d --remove-orphans")));
    assert!(executor.file(UNIT_FILE).is_none());

    let deployment = fleet.deployment().await;
    assert_eq!(
        deployment.last_deployed_compose_version_id,
        Some(fleet.compose.current_id)
    );
    assert_eq!(deployment.last_deployed_as_enabled, Some(true));
    assert_eq!(deployment.last_deployed_node_version, Some(fleet.node.version));
    assert!(deployment.last_check.is_some());
    assert!(!deployment.reconciliation_failed);
}

#[tokio::test]
async fn test_service_mode_installs_unit_before_starting() {
    let fleet = Fleet::new(true, true).await;
    let executor = FakeExecutor::new();

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let unit = executor.file(UNIT_FILE).unwrap();
    assert!(unit.contains("WorkingDirectory=/srv/web"));
    assert!(unit.contains(&format!("ExecStart={} up -d --remove-orphans", COMPOSE_BINARY)));

    assert_eq!(
        executor.mutations(),
        vec![
            format!("write {}", COMPOSE_FILE),
            format!("write {}", UNIT_FILE),
            "systemctl daemon-reload".to_string(),
            "systemctl start 'web.service'".to_string(),
            "systemctl enable 'web.service'".to_string(),
            "systemctl daemon-reload".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_switching_off_service_mode_moves_to_compose() {
    let fleet = Fleet::new(true, true).await;
    let executor = FakeExecutor::new();
    let engine = engine(&fleet, &executor);
    let cancel = CancellationToken::new();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    let first = fleet.current_version().await;
    let second = fleet
        .store
        .update_compose(fleet.compose.id, first.content.clone(), "/srv/web", "web", false)
        .await
        .unwrap();
    executor.clear_calls();

    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    assert_eq!(
        executor.mutations(),
        vec![
            "systemctl stop 'web.service'".to_string(),
            "systemctl disable 'web.service'".to_string(),
            "systemctl daemon-reload".to_string(),
            compose_command("up -d --remove-orphans"),
            format!("delete {}", UNIT_FILE),
            "systemctl daemon-reload".to_string(),
        ]
    );
    assert!(executor.file(UNIT_FILE).is_none());
    assert_eq!(fleet.deployment().await.last_deployed_compose_version_id, Some(second));
}

#[tokio::test]
async fn test_redeploy_request_restarts_once() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    let engine = engine(&fleet, &executor);
    let cancel = CancellationToken::new();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    fleet.store.request_compose_redeploy(fleet.compose.id).await.unwrap();
    executor.clear_calls();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    let restarts = executor
        .calls()
        .iter()
        .filter(|c| **c == compose_command("restart"))
        .count();
    assert_eq!(restarts, 1);

    executor.clear_calls();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_missing_docker_fails_the_node_untouched() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    executor.script("docker --version", 127, "docker: command not found");

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fleet.node().await.reconciliation_failed);
    assert_eq!(executor.writes(), 0);
    assert!(executor.mutations().is_empty());
    assert!(!executor.calls().iter().any(|c| c.starts_with("docker-compose")));

    let deployment = fleet.deployment().await;
    assert_eq!(deployment.last_deployed_compose_version_id, None);
    assert!(!deployment.reconciliation_failed);

    let logs = fleet.store.connection_logs().await;
    assert!(logs
        .iter()
        .any(|l| l.severity == LogSeverity::Error && l.message.contains("docker unavailable")));
}

#[tokio::test]
async fn test_failed_node_is_skipped_until_cleared() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    fleet.store.mark_node_failed(fleet.node.id).await.unwrap();

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(executor.calls().is_empty());

    fleet.store.request_node_redeploy(fleet.node.id).await.unwrap();
    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();
    assert!(executor.calls().contains(&compose_command("up -d --remove-orphans")));
}

#[tokio::test]
async fn test_failed_deployment_does_not_block_siblings() {
    let fleet = Fleet::new(false, true).await;
    let (api, api_deployment) = with_sibling(&fleet).await;

    let executor = FakeExecutor::new();
    executor.script(&compose_command("up"), 1, "pull access denied");

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let state = fleet.store.snapshot().await;
    assert!(state.deployments[&fleet.deployment.id].reconciliation_failed);
    assert_eq!(state.deployments[&fleet.deployment.id].last_deployed_compose_version_id, None);
    assert_eq!(
        state.deployments[&api_deployment.id].last_deployed_compose_version_id,
        Some(api.current_id)
    );
    assert!(!state.nodes[&fleet.node.id].reconciliation_failed);

    // one failed attempt only, the latched deployment is left alone
    let ups = executor
        .calls()
        .iter()
        .filter(|c| **c == compose_command("up -d --remove-orphans"))
        .count();
    assert_eq!(ups, 1);
}

#[tokio::test]
async fn test_unchanged_file_is_not_rewritten() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    executor.put_file(COMPOSE_FILE, "services:\r\n  app:\r\n    image: nginx\r\n");
    let engine = engine(&fleet, &executor);
    let cancel = CancellationToken::new();

    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();
    assert_eq!(executor.writes(), 0);

    fleet
        .store
        .request_deployment_redeploy(fleet.deployment.id)
        .await
        .unwrap();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();
    assert_eq!(executor.writes(), 0);
}

#[tokio::test]
async fn test_disabling_the_node_brings_deployment_down() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    let engine = engine(&fleet, &executor);
    let cancel = CancellationToken::new();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    fleet.store.set_node_enabled(fleet.node.id, false).await.unwrap();
    executor.clear_calls();
    engine.process_node_updates(fleet.node.id, &cancel).await.unwrap();

    assert!(executor.calls().contains(&compose_command("down")));
    assert_eq!(fleet.deployment().await.last_deployed_as_enabled, Some(false));
}

#[tokio::test]
async fn test_cancelled_pass_touches_nothing() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DirectorError::Cancelled));
    assert!(executor.calls().is_empty());
    assert!(!fleet.node().await.reconciliation_failed);
}

#[tokio::test]
async fn test_timed_out_up_fails_only_that_deployment() {
    let fleet = Fleet::new(false, true).await;
    let (api, api_deployment) = with_sibling(&fleet).await;

    let executor = FakeExecutor::new();
    executor.hang(&compose_command("up"));

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let state = fleet.store.snapshot().await;
    assert!(state.deployments[&fleet.deployment.id].reconciliation_failed);
    assert_eq!(
        state.deployments[&api_deployment.id].last_deployed_compose_version_id,
        Some(api.current_id)
    );
    assert!(!state.nodes[&fleet.node.id].reconciliation_failed);

    let logs = fleet.store.connection_logs().await;
    assert!(logs
        .iter()
        .any(|l| l.severity == LogSeverity::Error && l.message == "Deployment reconciliation failed"));
}

#[tokio::test]
async fn test_timed_out_unit_start_fails_only_that_deployment() {
    let fleet = Fleet::new(true, true).await;
    let (api, api_deployment) = with_sibling(&fleet).await;

    let executor = FakeExecutor::new();
    executor.hang("systemctl start 'web.service'");

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let state = fleet.store.snapshot().await;
    assert!(state.deployments[&fleet.deployment.id].reconciliation_failed);
    assert_eq!(
        state.deployments[&api_deployment.id].last_deployed_compose_version_id,
        Some(api.current_id)
    );
    assert!(!state.nodes[&fleet.node.id].reconciliation_failed);
}

#[tokio::test]
async fn test_unresolvable_compose_binary_fails_the_deployment() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    executor.script("which docker-compose", 1, "");

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(fleet.deployment().await.reconciliation_failed);
    assert!(!fleet.node().await.reconciliation_failed);
}

#[tokio::test]
async fn test_project_name_follows_service_name() {
    let fleet = Fleet::new(false, true).await;
    let content = fleet.current_version().await.content;
    fleet
        .store
        .update_compose(fleet.compose.id, content, "/opt/stacks/app", "web", false)
        .await
        .unwrap();
    let executor = FakeExecutor::new();

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    assert!(executor.calls().contains(&format!(
        "{} --project-name 'web' --file '/opt/stacks/app/docker-compose.yml' up -d --remove-orphans",
        COMPOSE_BINARY
    )));
}

#[tokio::test]
async fn test_service_unit_pins_project_name() {
    let fleet = Fleet::new(true, true).await;
    let content = fleet.current_version().await.content;
    fleet
        .store
        .update_compose(fleet.compose.id, content, "/opt/stacks/app", "web", true)
        .await
        .unwrap();
    let executor = FakeExecutor::new();

    engine(&fleet, &executor)
        .process_node_updates(fleet.node.id, &CancellationToken::new())
        .await
        .unwrap();

    let unit = executor.file(UNIT_FILE).unwrap();
    assert!(unit.contains("Environment=\"COMPOSE_PROJECT_NAME=web\""));
    assert!(unit.contains("WorkingDirectory=/opt/stacks/app"));
}
