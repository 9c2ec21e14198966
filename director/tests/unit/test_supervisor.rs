//! Supervisor tests on a paused clock

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use supercompose_director::errors::DirectorError;
use supercompose_director::store::{FleetState, MemoryStore};
use supercompose_director::supervisor::{LeaseProvider, LocalLeaseProvider, NodeWorkload, Supervisor, SupervisorOptions};

use crate::support::node;

/// Records every run. Fails the first `failures` runs, then either returns or
/// blocks until cancelled.
#[derive(Default)]
struct ScriptedWorkload {
    failures: usize,
    panics: bool,
    block: bool,
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: Mutex<Vec<Instant>>,
}

impl ScriptedWorkload {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl NodeWorkload for ScriptedWorkload {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn lease_key(&self, node_id: Uuid) -> String {
        node_id.to_string()
    }

    async fn run(&self, _node_id: Uuid, cancel: CancellationToken) -> Result<(), DirectorError> {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(Instant::now());

        if run < self.failures {
            if self.panics {
                panic!("scripted panic");
            }
            return Err(DirectorError::Internal(format!("scripted failure {}", run)));
        }
        if !self.block {
            return Ok(());
        }

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        cancel.cancelled().await;
        // still holding the node for a moment after cancellation
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Err(DirectorError::Cancelled)
    }
}

struct Harness {
    supervisor: Supervisor,
    workload: Arc<ScriptedWorkload>,
    leases: Arc<LocalLeaseProvider>,
    store: Arc<MemoryStore>,
    node_id: Uuid,
}

async fn harness(workload: ScriptedWorkload) -> Harness {
    let store = Arc::new(MemoryStore::new(FleetState::default()));
    let node = node("node-1");
    let node_id = node.id;
    store.insert_node(node).await;

    let workload = Arc::new(workload);
    let leases = Arc::new(LocalLeaseProvider::new());
    let supervisor = Supervisor::new(
        workload.clone(),
        store.clone(),
        leases.clone(),
        SupervisorOptions::default(),
    );
    Harness {
        supervisor,
        workload,
        leases,
        store,
        node_id,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

async fn wait_idle(supervisor: &Supervisor) {
    for _ in 0..10_000 {
        if supervisor.running_nodes().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("supervisor never went idle");
}

#[tokio::test(start_paused = true)]
async fn test_change_notification_replaces_task_without_overlap() {
    let h = harness(ScriptedWorkload {
        block: true,
        ..Default::default()
    })
    .await;

    h.supervisor.restart(h.node_id).await;
    wait_until(|| h.workload.runs() == 1).await;

    h.supervisor.handle_notification(h.node_id).await.unwrap();
    h.supervisor.handle_notification(h.node_id).await.unwrap();
    wait_until(|| h.workload.runs() == 2).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.workload.runs(), 2);
    assert_eq!(h.workload.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(h.supervisor.running_nodes().await, vec![h.node_id]);

    h.supervisor.shutdown().await;
    assert!(h.supervisor.running_nodes().await.is_empty());
    assert_eq!(h.workload.active.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_back_off_exponentially() {
    let h = harness(ScriptedWorkload {
        failures: 3,
        ..Default::default()
    })
    .await;

    h.supervisor.restart(h.node_id).await;
    wait_until(|| h.workload.runs() == 4).await;
    wait_idle(&h.supervisor).await;

    let expected = [
        Duration::from_millis(500),
        Duration::from_secs(1),
        Duration::from_secs(2),
    ];
    let gaps = h.workload.gaps();
    assert_eq!(gaps.len(), 3);
    for (gap, expected) in gaps.iter().zip(expected) {
        assert!(*gap >= expected, "{:?} shorter than {:?}", gap, expected);
        assert!(*gap < expected + Duration::from_millis(100), "{:?} longer than {:?}", gap, expected);
    }

    // the lease was released on every exit
    assert!(h
        .leases
        .try_acquire(&h.node_id.to_string(), "other", Duration::from_secs(10))
        .await
        .unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_panicking_workload_is_restarted() {
    let h = harness(ScriptedWorkload {
        failures: 1,
        panics: true,
        ..Default::default()
    })
    .await;

    h.supervisor.restart(h.node_id).await;
    wait_until(|| h.workload.runs() == 2).await;
    wait_idle(&h.supervisor).await;
}

#[tokio::test(start_paused = true)]
async fn test_lease_held_elsewhere_exits_quietly() {
    let h = harness(ScriptedWorkload::default()).await;
    assert!(h
        .leases
        .try_acquire(&h.node_id.to_string(), "another-instance", Duration::from_secs(60))
        .await
        .unwrap());

    h.supervisor.restart(h.node_id).await;
    wait_idle(&h.supervisor).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.workload.runs(), 0);
    assert!(h.supervisor.running_nodes().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabled_node_is_stopped() {
    let h = harness(ScriptedWorkload {
        block: true,
        ..Default::default()
    })
    .await;

    h.supervisor.start_all().await.unwrap();
    wait_until(|| h.workload.runs() == 1).await;

    h.store.set_node_enabled(h.node_id, false).await.unwrap();
    h.supervisor.handle_notification(h.node_id).await.unwrap();

    assert!(h.supervisor.running_nodes().await.is_empty());
    assert_eq!(h.workload.active.load(Ordering::SeqCst), 0);

    // disabled nodes are not picked up again
    h.supervisor.start_all().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.workload.runs(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_running_leaves_live_task_alone() {
    let h = harness(ScriptedWorkload {
        block: true,
        ..Default::default()
    })
    .await;

    h.supervisor.ensure_running(h.node_id).await;
    wait_until(|| h.workload.runs() == 1).await;
    h.supervisor.ensure_running(h.node_id).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.workload.runs(), 1);
    h.supervisor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_ensure_running_starts_one_task() {
    let h = harness(ScriptedWorkload {
        block: true,
        ..Default::default()
    })
    .await;

    tokio::join!(
        h.supervisor.ensure_running(h.node_id),
        h.supervisor.ensure_running(h.node_id),
        h.supervisor.ensure_running(h.node_id),
    );
    wait_until(|| h.workload.runs() == 1).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.workload.runs(), 1);
    assert_eq!(h.supervisor.running_nodes().await, vec![h.node_id]);
    h.supervisor.shutdown().await;
}
