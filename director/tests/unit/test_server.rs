//! Status API over a real socket

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use supercompose_director::errors::DirectorError;
use supercompose_director::server::serve::router;
use supercompose_director::server::state::ServerState;
use supercompose_director::supervisor::{LocalLeaseProvider, NodeWorkload, Supervisor, SupervisorOptions};
use supercompose_director::workers::notifications::NotificationSinks;

use crate::support::Fleet;

struct Idle;

#[async_trait]
impl NodeWorkload for Idle {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn lease_key(&self, node_id: Uuid) -> String {
        node_id.to_string()
    }

    async fn run(&self, _node_id: Uuid, _cancel: CancellationToken) -> Result<(), DirectorError> {
        Ok(())
    }
}

struct Api {
    base: String,
    fleet: Fleet,
    changed: mpsc::Receiver<Uuid>,
    info: mpsc::Receiver<Uuid>,
}

async fn api() -> Api {
    let fleet = Fleet::new(false, true).await;
    let supervisor = || {
        Arc::new(Supervisor::new(
            Arc::new(Idle),
            fleet.store.clone(),
            Arc::new(LocalLeaseProvider::new()),
            SupervisorOptions::default(),
        ))
    };
    let (changed_tx, changed) = mpsc::channel(8);
    let (info_tx, info) = mpsc::channel(8);
    let state = ServerState::new(
        fleet.store.clone(),
        supervisor(),
        supervisor(),
        NotificationSinks {
            node_changed: changed_tx,
            node_info: info_tx,
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = router(Arc::new(state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Api {
        base,
        fleet,
        changed,
        info,
    }
}

async fn get(url: String) -> (u16, Option<Value>) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    let body = response.text().await.unwrap();
    (status, serde_json::from_str(&body).ok())
}

#[tokio::test]
async fn test_health() {
    let api = api().await;
    let (status, body) = get(format!("{}/health", api.base)).await;
    assert_eq!(status, 200);
    assert_eq!(body.unwrap()["status"], "healthy");
}

#[tokio::test]
async fn test_node_deployments_report_pending_work() {
    let api = api().await;
    let (status, body) = get(format!("{}/nodes/{}/deployments", api.base, api.fleet.node.id)).await;
    assert_eq!(status, 200);

    let body = body.unwrap();
    let deployments = body.as_array().unwrap();
    assert_eq!(deployments.len(), 1);
    assert_eq!(deployments[0]["deployment_id"], api.fleet.deployment.id.to_string());
    assert_eq!(deployments[0]["needs_update"], true);
    assert_eq!(deployments[0]["compose_name"], "web");

    let (status, _) = get(format!("{}/nodes/{}/deployments", api.base, Uuid::new_v4())).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_deployment_containers() {
    let api = api().await;
    let (status, body) = get(format!("{}/deployments/{}/containers", api.base, api.fleet.deployment.id)).await;
    assert_eq!(status, 200);
    assert_eq!(body.unwrap(), serde_json::json!([]));

    let (status, _) = get(format!("{}/deployments/{}/containers", api.base, Uuid::new_v4())).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn test_notifications_are_forwarded() {
    let mut api = api().await;
    let node_id = api.fleet.node.id;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/nodes/{}/changed", api.base, node_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(api.changed.recv().await, Some(node_id));

    let response = client
        .post(format!("{}/nodes/{}/info", api.base, node_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    assert_eq!(api.info.recv().await, Some(node_id));
}
