//! Node connection manager tests

use std::sync::atomic::Ordering;
use std::time::Duration;

use uuid::Uuid;

use supercompose_director::errors::{ConnectionErrorKind, DirectorError};
use supercompose_director::remote::connection::{ConnectionOptions, NodeConnectionManager};
use supercompose_director::remote::session_fsm::SessionState;
use supercompose_director::utils::CooldownOptions;

use crate::support::FakeConnector;

fn refused() -> DirectorError {
    DirectorError::connection(ConnectionErrorKind::Connection, "connection refused")
}

fn denied() -> DirectorError {
    DirectorError::connection(ConnectionErrorKind::Authentication, "permission denied (publickey)")
}

fn options() -> ConnectionOptions {
    ConnectionOptions {
        backoff: CooldownOptions {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        },
        ready_timeout: Duration::from_secs(5),
    }
}

async fn exec(manager: &NodeConnectionManager, command: &'static str) -> Result<String, DirectorError> {
    manager
        .with_session(|session| async move {
            let output = session.exec(command, None, Duration::from_secs(1)).await?;
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_operations_wait_for_reconnect() {
    let connector = FakeConnector::new(2, refused);
    let manager = NodeConnectionManager::start(Uuid::new_v4(), connector.clone(), options());

    assert_eq!(exec(&manager, "uptime").await.unwrap(), "uptime");
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(manager.state(), SessionState::Ready);

    manager.stop().await;
    assert_eq!(manager.state(), SessionState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_reports_last_connection_error() {
    let connector = FakeConnector::new(usize::MAX, denied);
    let manager = NodeConnectionManager::start(Uuid::new_v4(), connector.clone(), options());

    let err = exec(&manager, "uptime").await.unwrap_err();
    assert_eq!(err.connection_kind(), Some(ConnectionErrorKind::Authentication));
    assert!(connector.attempts.load(Ordering::SeqCst) > 1);

    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_operations_are_serialized() {
    let connector = FakeConnector::with_exec_delay(Duration::from_millis(100));
    let manager = NodeConnectionManager::start(Uuid::new_v4(), connector.clone(), options());

    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { exec(&manager, "docker ps").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let session = connector.last_session();
    assert_eq!(session.max_concurrent.load(Ordering::SeqCst), 1);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_session_is_replaced() {
    let connector = FakeConnector::new(0, refused);
    let manager = NodeConnectionManager::start(Uuid::new_v4(), connector.clone(), options());
    exec(&manager, "true").await.unwrap();

    connector.last_session().drop_connection();
    while connector.sessions.lock().unwrap().len() < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    exec(&manager, "true").await.unwrap();
    assert_eq!(connector.sessions.lock().unwrap().len(), 2);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stopped_manager_refuses_work() {
    let connector = FakeConnector::new(0, refused);
    let manager = NodeConnectionManager::start(Uuid::new_v4(), connector, options());
    exec(&manager, "true").await.unwrap();

    manager.stop().await;
    let err = exec(&manager, "true").await.unwrap_err();
    assert!(err.is_cancelled());
}
