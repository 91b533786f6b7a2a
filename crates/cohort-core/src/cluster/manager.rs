//! Manager node: cluster coordination and query fan-out.

use crate::cluster::execution::{ExecutionManager, ExecutionStatus, ResultStream};
use crate::cluster::protocol::{ClusterMessage, WireError, PROTOCOL_VERSION};
use crate::concepts::Dataset;
use crate::error::{Error, Result};
use crate::jobs::JobManagerStatus;
use crate::query::QueryDescription;
use crate::worker::WorkerInfo;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Handle to one registered worker.
#[derive(Debug, Clone)]
struct WorkerHandle {
    info: WorkerInfo,
    shard: String,
}

/// Shared manager state, reachable from every connection task.
pub struct ManagerState {
    datasets: RwLock<HashMap<String, Arc<Dataset>>>,
    workers: DashMap<String, WorkerHandle>,
    shards: DashMap<String, mpsc::UnboundedSender<ClusterMessage>>,
    executions: ExecutionManager,
    job_statuses: DashMap<String, Vec<JobManagerStatus>>,
}

impl ManagerState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            datasets: RwLock::new(HashMap::new()),
            workers: DashMap::new(),
            shards: DashMap::new(),
            executions: ExecutionManager::new(),
            job_statuses: DashMap::new(),
        })
    }

    fn workers_of_dataset(&self, dataset: &str) -> Vec<WorkerHandle> {
        self.workers
            .iter()
            .filter(|w| w.info.dataset == dataset)
            .map(|w| w.clone())
            .collect()
    }

    fn send_to_shard(&self, shard: &str, message: ClusterMessage) {
        match self.shards.get(shard) {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::warn!("shard {shard} writer already closed");
                }
            }
            None => tracing::warn!("no connection to shard {shard}"),
        }
    }

    fn handle_shard_loss(&self, shard: &str) {
        self.shards.remove(shard);
        self.job_statuses.remove(shard);

        let lost: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.shard == shard)
            .map(|w| w.key().clone())
            .collect();
        for worker in &lost {
            self.workers.remove(worker);
        }
        if !lost.is_empty() {
            tracing::warn!("lost shard {shard} with workers {lost:?}");
            self.executions.fail_executions_of_workers(
                &lost,
                WireError {
                    code: "CONNECTION_LOST".into(),
                    message: format!("shard {shard} disconnected"),
                },
            );
        }
    }
}

/// The coordinating cluster role: accepts shard connections, resolves and
/// fans out queries, merges partial results.
pub struct ManagerNode {
    state: Arc<ManagerState>,
    running: AtomicBool,
    shutdown_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl ManagerNode {
    /// New manager with no datasets registered.
    pub fn new() -> Self {
        Self {
            state: ManagerState::new(),
            running: AtomicBool::new(false),
            shutdown_tx: parking_lot::Mutex::new(None),
        }
    }

    /// Register a dataset so queries against it can be resolved.
    pub fn register_dataset(&self, mut dataset: Dataset) {
        dataset.rebuild_indexes();
        let name = dataset.schema.name.clone();
        self.state
            .datasets
            .write()
            .insert(name.clone(), Arc::new(dataset));
        tracing::info!("registered dataset {name}");
    }

    /// Names of currently registered workers.
    pub fn registered_workers(&self) -> Vec<String> {
        self.state.workers.iter().map(|w| w.key().clone()).collect()
    }

    /// Latest job status heartbeats per shard, for observability.
    pub fn job_statuses(&self) -> HashMap<String, Vec<JobManagerStatus>> {
        self.state
            .job_statuses
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Resolve and dispatch a query.
    ///
    /// Validation failures (unknown dataset/concept/column) are returned
    /// synchronously; nothing reaches a worker in that case.
    pub fn submit_query(&self, query: &QueryDescription) -> Result<Uuid> {
        let dataset = self
            .state
            .datasets
            .read()
            .get(&query.dataset)
            .cloned()
            .ok_or_else(|| {
                Error::validation(
                    "UNKNOWN_DATASET",
                    format!("no such dataset: {}", query.dataset),
                )
            })?;

        let description = query.resolve(&dataset)?;

        let involved = self.state.workers_of_dataset(&query.dataset);
        if involved.is_empty() {
            return Err(Error::validation(
                "NO_WORKERS",
                format!("no workers registered for dataset {}", query.dataset),
            ));
        }

        let id = self.state.executions.create(description.clone());
        self.state
            .executions
            .start(id, involved.iter().map(|w| w.info.name.clone()));

        // One execute message per shard; the shard runs it on each of its
        // workers for the dataset.
        let mut notified_shards = std::collections::HashSet::new();
        for worker in &involved {
            if notified_shards.insert(worker.shard.clone()) {
                self.state.send_to_shard(
                    &worker.shard,
                    ClusterMessage::ExecuteQuery {
                        execution: id,
                        description: description.clone(),
                    },
                );
            }
        }
        tracing::info!(
            "execution {id} dispatched to {} workers on {} shards",
            involved.len(),
            notified_shards.len()
        );
        Ok(id)
    }

    /// User-visible status of an execution.
    pub fn poll_status(&self, id: Uuid) -> Option<ExecutionStatus> {
        self.state.executions.status(id)
    }

    /// Lazily stream a finished execution's rows.
    pub fn stream_results(&self, id: Uuid) -> Option<ResultStream> {
        self.state.executions.stream_results(id)
    }

    /// Cancel an execution, notifying every still-pending worker's shard.
    pub fn cancel_query(&self, id: Uuid) {
        let pending = self.state.executions.cancel(id);
        let mut notified_shards = std::collections::HashSet::new();
        for worker in pending {
            if let Some(handle) = self.state.workers.get(&worker) {
                if notified_shards.insert(handle.shard.clone()) {
                    self.state
                        .send_to_shard(&handle.shard, ClusterMessage::CancelQuery { execution: id });
                }
            }
        }
    }

    /// Direct access to the execution registry (used by in-process tests
    /// and the request layer).
    pub fn executions(&self) -> &ExecutionManager {
        &self.state.executions
    }

    /// Accept shard connections until shutdown.
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::cluster("manager already running"));
        }

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("manager listening on {addr}");

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            tracing::info!("shard connected from {peer}");
                            tokio::spawn(handle_connection(self.state.clone(), stream));
                        }
                        Err(e) => tracing::error!("accept error: {e}"),
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::info!("manager shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the accept loop to stop.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Default for ManagerNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection read/write tasks.
async fn handle_connection(state: Arc<ManagerState>, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ClusterMessage>();

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = message.write_to(&mut writer).await {
                tracing::error!("writing to shard failed: {e}");
                break;
            }
        }
    });

    let mut shard_name: Option<String> = None;
    loop {
        let message = match ClusterMessage::read_from(&mut reader).await {
            Ok(message) => message,
            Err(e) => {
                tracing::info!("shard connection closed: {e}");
                break;
            }
        };

        match message {
            ClusterMessage::AddShard {
                shard,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    tracing::error!(
                        "shard {shard} speaks protocol {protocol_version}, expected {PROTOCOL_VERSION}"
                    );
                    break;
                }
                tracing::info!("shard {shard} registered");
                state.shards.insert(shard.clone(), tx.clone());
                shard_name = Some(shard);
            }
            ClusterMessage::RegisterWorker { info } => {
                let Some(shard) = &shard_name else {
                    tracing::error!("worker registration before shard hello");
                    break;
                };
                tracing::info!("worker {} registered via shard {shard}", info.name);
                state.workers.insert(
                    info.name.clone(),
                    WorkerHandle {
                        info,
                        shard: shard.clone(),
                    },
                );
            }
            ClusterMessage::ShardResult {
                execution,
                worker,
                rows,
                error,
            } => {
                state.executions.add_result(execution, &worker, rows, error);
            }
            ClusterMessage::UpdateJobStatus { shard, statuses } => {
                state.job_statuses.insert(shard, statuses);
            }
            ClusterMessage::Shutdown => {
                tracing::info!("shard announced shutdown");
                break;
            }
            ClusterMessage::Error { error } => {
                tracing::error!("protocol error from shard: [{}] {}", error.code, error.message);
            }
            other => {
                tracing::warn!("unexpected message on manager: {:?}", other.kind());
            }
        }
    }

    writer_task.abort();
    if let Some(shard) = shard_name {
        state.handle_shard_loss(&shard);
    }
}
