//! Per-node task supervision
//!
//! A supervisor owns at most one task per node for its workload. A task takes
//! the node's lease, runs the workload and restarts it with backoff until it
//! completes, is cancelled or finds the lease held by another instance.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::context::LogContext;
use crate::errors::DirectorError;
use crate::store::Store;
use crate::supervisor::lease::{acquire_lease, LeaseOptions, LeaseProvider};
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Work a supervisor runs for each node
#[async_trait]
pub trait NodeWorkload: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Key of the lease guarding this workload on `node_id`
    fn lease_key(&self, node_id: Uuid) -> String;

    /// Run until done. Must return `Cancelled` soon after `cancel` fires.
    async fn run(&self, node_id: Uuid, cancel: CancellationToken) -> Result<(), DirectorError>;
}

/// Supervisor options
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Restart delay after consecutive failures
    pub backoff: CooldownOptions,

    /// An attempt that ran longer than this resets the backoff
    pub healthy_after: Duration,

    pub lease: LeaseOptions,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            backoff: CooldownOptions {
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(300),
                multiplier: 2.0,
            },
            healthy_after: Duration::from_secs(10),
            lease: LeaseOptions::default(),
        }
    }
}

struct NodeTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    generation: u64,
}

type TaskMap = Arc<Mutex<HashMap<Uuid, NodeTask>>>;

#[derive(Debug, PartialEq)]
enum AttemptOutcome {
    Completed,
    LeaseHeldElsewhere,
}

struct TaskContext {
    workload: Arc<dyn NodeWorkload>,
    leases: Arc<dyn LeaseProvider>,
    options: SupervisorOptions,
    tasks: TaskMap,
}

/// Owns the tasks of one workload across the fleet
pub struct Supervisor {
    ctx: Arc<TaskContext>,
    store: Arc<dyn Store>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        workload: Arc<dyn NodeWorkload>,
        store: Arc<dyn Store>,
        leases: Arc<dyn LeaseProvider>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            ctx: Arc::new(TaskContext {
                workload,
                leases,
                options,
                tasks: Arc::new(Mutex::new(HashMap::new())),
            }),
            store,
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.ctx.workload.name()
    }

    /// Start a task for every enabled node
    pub async fn start_all(&self) -> Result<(), DirectorError> {
        let nodes = self.store.enabled_nodes().await?;
        info!("Starting {} for {} nodes", self.name(), nodes.len());
        for node in nodes {
            self.restart(node.id).await;
        }
        Ok(())
    }

    /// React to a change of `node_id`: restart it if it still qualifies,
    /// otherwise stop it.
    pub async fn handle_notification(&self, node_id: Uuid) -> Result<(), DirectorError> {
        match self.store.get_node(node_id).await? {
            Some(node) if node.enabled => {
                debug!("Node {} changed, restarting {}", node_id, self.name());
                self.restart(node_id).await;
            }
            _ => {
                debug!("Node {} no longer qualifies for {}", node_id, self.name());
                self.stop(node_id).await;
            }
        }
        Ok(())
    }

    /// Cancel the node's task, if any, and start a fresh one.
    ///
    /// The new task waits for the cancelled one to finish first.
    pub async fn restart(&self, node_id: Uuid) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut tasks = self.ctx.tasks.lock().await;
        self.replace_task(&mut tasks, node_id);
    }

    /// Start the node's task unless one is already running
    pub async fn ensure_running(&self, node_id: Uuid) {
        if self.shutdown.is_cancelled() {
            return;
        }
        // check and spawn under one lock
        let mut tasks = self.ctx.tasks.lock().await;
        if tasks.get(&node_id).is_none_or(|task| task.handle.is_finished()) {
            self.replace_task(&mut tasks, node_id);
        }
    }

    fn replace_task(&self, tasks: &mut HashMap<Uuid, NodeTask>, node_id: Uuid) {
        let predecessor = tasks.remove(&node_id).map(|previous| {
            previous.token.cancel();
            previous.handle
        });

        let token = self.shutdown.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(
            supervise(self.ctx.clone(), node_id, token.clone(), predecessor, generation)
                .instrument(LogContext::for_node_id(node_id).span("supervisor")),
        );
        tasks.insert(
            node_id,
            NodeTask {
                token,
                handle,
                generation,
            },
        );
    }

    /// Cancel the node's task and wait for it to finish
    pub async fn stop(&self, node_id: Uuid) {
        let task = self.ctx.tasks.lock().await.remove(&node_id);
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("{} task for node {} ended abnormally: {}", self.name(), node_id, e);
            }
        }
    }

    /// Nodes with a task in flight
    pub async fn running_nodes(&self) -> Vec<Uuid> {
        let tasks = self.ctx.tasks.lock().await;
        let mut nodes: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, task)| !task.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        nodes.sort();
        nodes
    }

    /// Cancel every task and wait for all of them
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(Uuid, NodeTask)> = self.ctx.tasks.lock().await.drain().collect();
        for (node_id, task) in drained {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                warn!("{} task for node {} ended abnormally: {}", self.name(), node_id, e);
            }
        }
        info!("{} supervisor stopped", self.name());
    }

    /// Feed node change notifications into the supervisor until shutdown
    pub async fn listen(
        &self,
        mut notifications: mpsc::Receiver<Uuid>,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) {
        loop {
            let node_id = tokio::select! {
                _ = &mut shutdown_signal => break,
                next = notifications.recv() => match next {
                    Some(node_id) => node_id,
                    None => break,
                },
            };
            if let Err(e) = self.handle_notification(node_id).await {
                error!("Failed to handle notification for node {}: {}", node_id, e);
            }
        }
        debug!("{} notification listener stopped", self.name());
    }
}

async fn supervise(
    ctx: Arc<TaskContext>,
    node_id: Uuid,
    token: CancellationToken,
    predecessor: Option<JoinHandle<()>>,
    generation: u64,
) {
    if let Some(predecessor) = predecessor {
        let _ = predecessor.await;
    }

    let name = ctx.workload.name();
    let mut failures: u32 = 0;
    while !token.is_cancelled() {
        let started = Instant::now();
        match attempt(&ctx, node_id, &token).await {
            Ok(AttemptOutcome::Completed) => {
                debug!("{} completed for node {}", name, node_id);
                break;
            }
            Ok(AttemptOutcome::LeaseHeldElsewhere) => {
                debug!("{} for node {} is owned by another instance", name, node_id);
                break;
            }
            Err(e) if e.is_cancelled() => break,
            Err(e) => {
                if started.elapsed() > ctx.options.healthy_after {
                    failures = 0;
                }
                let delay = calc_exp_backoff(&ctx.options.backoff, failures);
                failures = failures.saturating_add(1);
                error!("{} failed for node {}, restarting in {:?}: {}", name, node_id, delay, e);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
    }

    let mut tasks = ctx.tasks.lock().await;
    if tasks.get(&node_id).is_some_and(|task| task.generation == generation) {
        tasks.remove(&node_id);
    }
}

async fn attempt(
    ctx: &TaskContext,
    node_id: Uuid,
    token: &CancellationToken,
) -> Result<AttemptOutcome, DirectorError> {
    let key = ctx.workload.lease_key(node_id);
    let Some(lease) = acquire_lease(ctx.leases.clone(), &key, &ctx.options.lease, token).await? else {
        return Ok(AttemptOutcome::LeaseHeldElsewhere);
    };

    let work = token.child_token();
    let lost = lease.lost();
    let run = AssertUnwindSafe(ctx.workload.run(node_id, work.clone())).catch_unwind();

    let result = tokio::select! {
        result = run => match result {
            Ok(result) => result,
            Err(_) => Err(DirectorError::Internal(format!("{} panicked", ctx.workload.name()))),
        },
        _ = lost.cancelled() => {
            work.cancel();
            Err(DirectorError::LeaseError(format!("lease {} lost", key)))
        }
    };

    lease.release().await;
    result.map(|_| AttemptOutcome::Completed)
}
