//! Worker-local background jobs.
//!
//! Two queues per manager: slow jobs (CBlock builds, full scans) and fast
//! jobs (control messages), each drained by its own thread so index builds
//! never starve interactive work. Queue depths are reported in heartbeats.

pub mod calculate_cblocks;

pub use calculate_cblocks::CalculateCBlocksJob;

use crate::error::Result;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A unit of background work.
pub trait Job: Send {
    /// Human-readable label for status reporting.
    fn label(&self) -> String;

    /// Run to completion. Errors abort only this job.
    fn execute(&mut self, progress: &ProgressReporter) -> Result<()>;
}

/// Progress of one running job.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    max: AtomicU64,
    done: AtomicU64,
}

impl ProgressReporter {
    /// Set the number of expected work units.
    pub fn set_max(&self, max: u64) {
        self.max.store(max, Ordering::Relaxed);
    }

    /// Report `units` completed work units.
    pub fn report(&self, units: u64) {
        self.done.fetch_add(units, Ordering::Relaxed);
    }

    /// Mark the job done regardless of reported units.
    pub fn done(&self) {
        let max = self.max.load(Ordering::Relaxed);
        self.done.store(max.max(1), Ordering::Relaxed);
    }

    /// Completed fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let max = self.max.load(Ordering::Relaxed);
        let done = self.done.load(Ordering::Relaxed);
        if max == 0 {
            // A job that never announced a maximum still reports completion
            // once `done()` ran.
            return if done > 0 { 1.0 } else { 0.0 };
        }
        (done as f64 / max as f64).min(1.0)
    }
}

/// Snapshot of one manager's queues, shipped in heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobManagerStatus {
    /// Manager name
    pub name: String,
    /// Queued slow jobs
    pub slow_queue: usize,
    /// Queued fast jobs
    pub fast_queue: usize,
    /// Labels of currently running jobs
    pub running: Vec<String>,
    /// Jobs that ended in an error since startup
    pub failed: u64,
}

impl JobManagerStatus {
    /// Whether any work is queued or running.
    pub fn is_busy(&self) -> bool {
        self.slow_queue > 0 || self.fast_queue > 0 || !self.running.is_empty()
    }
}

/// One-shot job wrapping a closure, used to react to network messages.
pub struct ReactingJob {
    label: String,
    action: Option<Box<dyn FnOnce(&ProgressReporter) -> Result<()> + Send>>,
}

impl ReactingJob {
    /// Job running `action` once under `label`.
    pub fn new(
        label: impl Into<String>,
        action: impl FnOnce(&ProgressReporter) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            action: Some(Box::new(action)),
        }
    }
}

impl Job for ReactingJob {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn execute(&mut self, progress: &ProgressReporter) -> Result<()> {
        match self.action.take() {
            Some(action) => action(progress),
            None => Ok(()),
        }
    }
}

struct QueuedJob {
    job: Box<dyn Job>,
    progress: Arc<ProgressReporter>,
}

struct QueueState {
    depth: AtomicUsize,
    current: Mutex<Option<String>>,
}

impl QueueState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            depth: AtomicUsize::new(0),
            current: Mutex::new(None),
        })
    }
}

/// Dual-queue job manager, one per worker plus one per shard process.
pub struct JobManager {
    name: String,
    slow_tx: Option<Sender<QueuedJob>>,
    fast_tx: Option<Sender<QueuedJob>>,
    slow_state: Arc<QueueState>,
    fast_state: Arc<QueueState>,
    failed: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl JobManager {
    /// Start a manager with one slow and one fast worker thread.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let (slow_tx, slow_rx) = unbounded();
        let (fast_tx, fast_rx) = unbounded();
        let slow_state = QueueState::new();
        let fast_state = QueueState::new();
        let failed = Arc::new(AtomicU64::new(0));

        let handles = vec![
            spawn_queue_worker(
                format!("{name}-slow"),
                slow_rx,
                slow_state.clone(),
                failed.clone(),
            ),
            spawn_queue_worker(
                format!("{name}-fast"),
                fast_rx,
                fast_state.clone(),
                failed.clone(),
            ),
        ];

        Self {
            name,
            slow_tx: Some(slow_tx),
            fast_tx: Some(fast_tx),
            slow_state,
            fast_state,
            failed,
            handles,
        }
    }

    /// Enqueue a long-running job (index builds, scans).
    pub fn add_slow_job(&self, job: Box<dyn Job>) -> Arc<ProgressReporter> {
        self.enqueue(job, &self.slow_tx, &self.slow_state)
    }

    /// Enqueue a control job.
    pub fn add_fast_job(&self, job: Box<dyn Job>) -> Arc<ProgressReporter> {
        self.enqueue(job, &self.fast_tx, &self.fast_state)
    }

    fn enqueue(
        &self,
        job: Box<dyn Job>,
        tx: &Option<Sender<QueuedJob>>,
        state: &Arc<QueueState>,
    ) -> Arc<ProgressReporter> {
        let progress = Arc::new(ProgressReporter::default());
        if let Some(tx) = tx {
            state.depth.fetch_add(1, Ordering::SeqCst);
            let queued = QueuedJob {
                job,
                progress: progress.clone(),
            };
            if tx.send(queued).is_err() {
                state.depth.fetch_sub(1, Ordering::SeqCst);
                tracing::warn!("job manager {} already closed, job dropped", self.name);
            }
        }
        progress
    }

    /// Queue snapshot for heartbeats.
    pub fn report_status(&self) -> JobManagerStatus {
        let mut running = Vec::new();
        if let Some(label) = self.slow_state.current.lock().clone() {
            running.push(label);
        }
        if let Some(label) = self.fast_state.current.lock().clone() {
            running.push(label);
        }
        JobManagerStatus {
            name: self.name.clone(),
            slow_queue: self.slow_state.depth.load(Ordering::SeqCst),
            fast_queue: self.fast_state.depth.load(Ordering::SeqCst),
            running,
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    /// Whether the slow lane has queued or running work.
    pub fn is_slow_worker_busy(&self) -> bool {
        self.slow_state.depth.load(Ordering::SeqCst) > 0
            || self.slow_state.current.lock().is_some()
    }

    /// Drain both queues and join the worker threads.
    pub fn close(&mut self) {
        self.slow_tx.take();
        self.fast_tx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("job worker thread of {} panicked", self.name);
            }
        }
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_queue_worker(
    thread_name: String,
    rx: Receiver<QueuedJob>,
    state: Arc<QueueState>,
    failed: Arc<AtomicU64>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            while let Ok(mut queued) = rx.recv() {
                state.depth.fetch_sub(1, Ordering::SeqCst);
                let label = queued.job.label();
                *state.current.lock() = Some(label.clone());

                tracing::debug!("executing job: {label}");
                if let Err(e) = queued.job.execute(&queued.progress) {
                    failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("job {label} failed: {e}");
                }
                queued.progress.done();

                *state.current.lock() = None;
            }
        })
        .unwrap_or_else(|e| panic!("failed to spawn job worker {thread_name}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    struct FlagJob {
        flag: Arc<AtomicBool>,
    }

    impl Job for FlagJob {
        fn label(&self) -> String {
            "flag".into()
        }

        fn execute(&mut self, progress: &ProgressReporter) -> Result<()> {
            progress.set_max(1);
            self.flag.store(true, Ordering::SeqCst);
            progress.report(1);
            Ok(())
        }
    }

    struct FailingJob;

    impl Job for FailingJob {
        fn label(&self) -> String {
            "failing".into()
        }

        fn execute(&mut self, _progress: &ProgressReporter) -> Result<()> {
            Err(Error::job("intentional"))
        }
    }

    #[test]
    fn test_jobs_execute_and_complete() {
        let mut manager = JobManager::new("test");
        let flag = Arc::new(AtomicBool::new(false));
        let progress = manager.add_slow_job(Box::new(FlagJob { flag: flag.clone() }));

        manager.close();
        assert!(flag.load(Ordering::SeqCst));
        assert!((progress.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_job_error_does_not_stop_manager() {
        let mut manager = JobManager::new("test");
        let flag = Arc::new(AtomicBool::new(false));
        manager.add_slow_job(Box::new(FailingJob));
        manager.add_slow_job(Box::new(FlagJob { flag: flag.clone() }));

        manager.close();
        assert!(flag.load(Ordering::SeqCst), "job after a failure must run");
        assert_eq!(manager.report_status().failed, 1);
    }

    #[test]
    fn test_fast_lane_independent_of_slow_lane() {
        let mut manager = JobManager::new("test");

        struct SlowJob;
        impl Job for SlowJob {
            fn label(&self) -> String {
                "slow".into()
            }
            fn execute(&mut self, _progress: &ProgressReporter) -> Result<()> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }
        }

        let flag = Arc::new(AtomicBool::new(false));
        manager.add_slow_job(Box::new(SlowJob));
        manager.add_fast_job(Box::new(FlagJob { flag: flag.clone() }));

        // The fast job must complete while the slow one is still sleeping.
        let deadline = std::time::Instant::now() + Duration::from_millis(200);
        while !flag.load(Ordering::SeqCst) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.load(Ordering::SeqCst), "fast job starved by slow job");
        manager.close();
    }
}
