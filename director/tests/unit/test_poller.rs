//! Poller driving the reconcile supervisor end to end

use std::sync::Arc;
use std::time::Duration;

use supercompose_director::authn::credentials::StoredCredentialProvider;
use supercompose_director::reconcile::{EngineOptions, ReconciliationEngine};
use supercompose_director::store::Store;
use supercompose_director::supervisor::{LocalLeaseProvider, ReconcileWorkload, Supervisor, SupervisorOptions};
use supercompose_director::workers::poller::poll_once;

use crate::support::{FakeExecutor, Fleet};

fn reconcile_supervisor(fleet: &Fleet, executor: &Arc<FakeExecutor>) -> Supervisor {
    let engine = Arc::new(ReconciliationEngine::new(
        fleet.store.clone(),
        executor.clone(),
        Arc::new(StoredCredentialProvider),
        EngineOptions::default(),
    ));
    Supervisor::new(
        Arc::new(ReconcileWorkload::new(engine)),
        fleet.store.clone(),
        Arc::new(LocalLeaseProvider::new()),
        SupervisorOptions::default(),
    )
}

async fn wait_idle(supervisor: &Supervisor) {
    for _ in 0..1_000 {
        if supervisor.running_nodes().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("supervisor never went idle");
}

#[tokio::test]
async fn test_poll_starts_pending_nodes_only() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    let supervisor = reconcile_supervisor(&fleet, &executor);

    assert_eq!(poll_once(fleet.store.as_ref(), &supervisor).await.unwrap(), 1);
    wait_idle(&supervisor).await;

    let deployment = fleet.deployment().await;
    assert_eq!(deployment.last_deployed_compose_version_id, Some(fleet.compose.current_id));

    // converged, nothing left to poll for
    assert_eq!(poll_once(fleet.store.as_ref(), &supervisor).await.unwrap(), 0);
}

#[tokio::test]
async fn test_poll_skips_failed_nodes() {
    let fleet = Fleet::new(false, true).await;
    let executor = FakeExecutor::new();
    let supervisor = reconcile_supervisor(&fleet, &executor);
    fleet.store.mark_node_failed(fleet.node.id).await.unwrap();

    assert_eq!(poll_once(fleet.store.as_ref(), &supervisor).await.unwrap(), 0);
    assert!(supervisor.running_nodes().await.is_empty());
    assert!(executor.calls().is_empty());
}
