//! Shard node: runs the workers of one process and speaks to the manager.
//!
//! The shard connects out to the manager with exponential backoff,
//! registers itself and every worker, then dispatches incoming messages:
//! slow ones (query execution) are queued on the slow job lane, control
//! messages on the fast lane. A periodic heartbeat reports aggregated job
//! queue depths.

use crate::cluster::protocol::{ClusterMessage, WireError, PROTOCOL_VERSION};
use crate::error::{Error, Result};
use crate::jobs::{JobManager, ReactingJob};
use crate::worker::Worker;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Heartbeat cadence for job status reports.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// First reconnect delay; doubled per attempt up to the cap.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// The executing cluster role: holds workers, executes fanned-out plans and
/// reports partial results.
pub struct ShardNode {
    name: String,
    workers: HashMap<String, Arc<Worker>>,
    job_manager: Arc<JobManager>,
    /// Best-effort cancellation flags per execution
    cancellations: Arc<DashMap<Uuid, Arc<AtomicBool>>>,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShardNode {
    /// Shard named `name` serving `workers`.
    pub fn new(name: impl Into<String>, workers: Vec<Arc<Worker>>) -> Self {
        let name = name.into();
        Self {
            job_manager: Arc::new(JobManager::new(format!("{name}-net"))),
            name,
            workers: workers
                .into_iter()
                .map(|w| (w.info().name.clone(), w))
                .collect(),
            cancellations: Arc::new(DashMap::new()),
            running: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Shard name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owned workers.
    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> {
        self.workers.values()
    }

    /// Whether any job lane still has work.
    pub fn is_busy(&self) -> bool {
        self.job_manager.report_status().is_busy()
            || self.workers.values().any(|w| w.job_status().is_busy())
    }

    /// Connect to the manager and serve until shutdown. Lost connections
    /// are retried with exponential backoff.
    pub async fn start(&self, manager_addr: SocketAddr) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::cluster("shard already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let mut reconnect_delay = RECONNECT_BASE;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("shard {} shutting down", self.name);
                    break;
                }
                result = self.connect_and_serve(manager_addr) => {
                    match result {
                        Ok(()) => {
                            reconnect_delay = RECONNECT_BASE;
                        }
                        Err(e) => {
                            tracing::error!(
                                "connection to manager lost: {e}. Reconnecting in {reconnect_delay:?}"
                            );
                            tokio::time::sleep(reconnect_delay).await;
                            reconnect_delay = std::cmp::min(reconnect_delay * 2, RECONNECT_CAP);
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the connection loop to stop.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    async fn connect_and_serve(&self, manager_addr: SocketAddr) -> Result<()> {
        tracing::info!("connecting to manager at {manager_addr}");
        let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(manager_addr))
            .await
            .map_err(|_| Error::cluster("connection timeout"))??;
        stream.set_nodelay(true)?;

        let (mut reader, mut writer) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClusterMessage>();

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = message.write_to(&mut writer).await {
                    tracing::error!("writing to manager failed: {e}");
                    break;
                }
            }
        });

        // Register the shard and each worker identity.
        tx.send(ClusterMessage::AddShard {
            shard: self.name.clone(),
            protocol_version: PROTOCOL_VERSION,
        })
        .map_err(|_| Error::cluster("writer task gone"))?;
        for worker in self.workers.values() {
            tracing::info!("sending worker identity {:?}", worker.info().name);
            tx.send(ClusterMessage::RegisterWorker {
                info: worker.info().clone(),
            })
            .map_err(|_| Error::cluster("writer task gone"))?;
        }

        let heartbeat = self.spawn_heartbeat(tx.clone());

        let result = self.read_loop(&mut reader, &tx).await;

        heartbeat.abort();
        writer_task.abort();
        result
    }

    fn spawn_heartbeat(
        &self,
        tx: mpsc::UnboundedSender<ClusterMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let shard = self.name.clone();
        let job_manager = self.job_manager.clone();
        let workers: Vec<Arc<Worker>> = self.workers.values().cloned().collect();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                interval.tick().await;
                let mut statuses = vec![job_manager.report_status()];
                statuses.extend(workers.iter().map(|w| w.job_status()));
                if tx
                    .send(ClusterMessage::UpdateJobStatus {
                        shard: shard.clone(),
                        statuses,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    async fn read_loop(
        &self,
        reader: &mut (impl tokio::io::AsyncRead + Unpin),
        tx: &mpsc::UnboundedSender<ClusterMessage>,
    ) -> Result<()> {
        loop {
            let message = ClusterMessage::read_from(reader).await?;
            tracing::trace!("shard {} received {:?}", self.name, message.kind());

            match message {
                ClusterMessage::ExecuteQuery {
                    execution,
                    description,
                } => {
                    self.queue_execution(execution, description, tx.clone());
                }
                ClusterMessage::CancelQuery { execution } => {
                    // Fast lane: flip the flag without waiting behind
                    // queued executions.
                    let cancellations = self.cancellations.clone();
                    self.job_manager.add_fast_job(Box::new(ReactingJob::new(
                        format!("cancel {execution}"),
                        move |_| {
                            if let Some(flag) = cancellations.get(&execution) {
                                flag.store(true, Ordering::SeqCst);
                                tracing::info!("execution {execution} cancelled");
                            }
                            Ok(())
                        },
                    )));
                }
                ClusterMessage::Shutdown => {
                    tracing::info!("manager requested shutdown");
                    return Ok(());
                }
                ClusterMessage::Error { error } => {
                    tracing::error!(
                        "protocol error from manager: [{}] {}",
                        error.code,
                        error.message
                    );
                }
                other => {
                    tracing::warn!("unexpected message on shard: {:?}", other.kind());
                }
            }
        }
    }

    /// Queue one slow execution job per owned worker of the target dataset.
    fn queue_execution(
        &self,
        execution: Uuid,
        description: crate::query::PlanDescription,
        tx: mpsc::UnboundedSender<ClusterMessage>,
    ) {
        let flag = self
            .cancellations
            .entry(execution)
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        for worker in self.workers.values() {
            if worker.info().dataset != description.dataset {
                continue;
            }
            let worker = worker.clone();
            let worker_name = worker.info().name.clone();
            let description = description.clone();
            let tx = tx.clone();
            let flag = flag.clone();

            self.job_manager.add_slow_job(Box::new(ReactingJob::new(
                format!("execute {execution} on {worker_name}"),
                move |_| {
                    let (rows, error) = match worker.execute_query(&description, &flag) {
                        Ok(rows) => (rows, None),
                        Err(e) => {
                            tracing::error!(
                                "worker {worker_name} failed execution {execution}: {e}"
                            );
                            (Vec::new(), Some(WireError::from_error(&e)))
                        }
                    };
                    tx.send(ClusterMessage::ShardResult {
                        execution,
                        worker: worker_name.clone(),
                        rows,
                        error,
                    })
                    .map_err(|_| Error::cluster("connection to manager gone"))?;
                    Ok(())
                },
            )));
        }
    }
}
