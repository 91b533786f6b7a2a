//! Managed query executions and their state machine.
//!
//! `Created -> Running(pending-worker-set) -> {Done | Failed | Cancelled}`.
//! `Done` is only reached when the pending set empties without an error; a
//! single worker error fails the whole execution immediately and discards
//! every other partial, because a missing partition makes the aggregate
//! unsound.

use crate::cluster::protocol::WireError;
use crate::query::{EntityRow, PlanDescription};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

pub use crate::cluster::protocol::WireError as StructuredError;

/// Coarse state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Accepted, not yet dispatched
    Created,
    /// Dispatched, waiting for workers
    Running,
    /// All partials merged successfully
    Done,
    /// At least one worker reported an error
    Failed,
    /// Cancelled by the user
    Cancelled,
}

/// User-visible status of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    /// Execution id
    pub id: Uuid,
    /// Coarse state
    pub state: ExecutionState,
    /// Merged row count, only meaningful once `Done`
    pub result_count: u64,
    /// Structured error, only set when `Failed`
    pub error: Option<StructuredError>,
}

#[derive(Debug)]
struct ExecutionInner {
    state: ExecutionState,
    pending: HashSet<String>,
    rows: Vec<EntityRow>,
    error: Option<WireError>,
}

/// One submitted query on the manager.
#[derive(Debug)]
pub struct ManagedExecution {
    id: Uuid,
    description: PlanDescription,
    inner: Mutex<ExecutionInner>,
}

impl ManagedExecution {
    /// The plan fanned out to workers.
    pub fn description(&self) -> &PlanDescription {
        &self.description
    }
}

/// Registry of all executions on the manager.
#[derive(Default)]
pub struct ExecutionManager {
    executions: DashMap<Uuid, Arc<ManagedExecution>>,
}

impl ExecutionManager {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new execution in `Created` state.
    pub fn create(&self, description: PlanDescription) -> Uuid {
        let id = Uuid::new_v4();
        self.executions.insert(
            id,
            Arc::new(ManagedExecution {
                id,
                description,
                inner: Mutex::new(ExecutionInner {
                    state: ExecutionState::Created,
                    pending: HashSet::new(),
                    rows: Vec::new(),
                    error: None,
                }),
            }),
        );
        id
    }

    /// Execution by id.
    pub fn get(&self, id: Uuid) -> Option<Arc<ManagedExecution>> {
        self.executions.get(&id).map(|e| e.clone())
    }

    /// Transition to `Running` with the given pending worker set.
    pub fn start(&self, id: Uuid, involved_workers: impl IntoIterator<Item = String>) {
        if let Some(execution) = self.get(id) {
            let mut inner = execution.inner.lock();
            inner.pending = involved_workers.into_iter().collect();
            inner.state = ExecutionState::Running;
            tracing::debug!(
                "execution {id} running, waiting for {} workers",
                inner.pending.len()
            );
        }
    }

    /// Merge one worker's partial result.
    ///
    /// An error in any partial transitions to `Failed` immediately and drops
    /// the rows merged so far; late partials after a terminal state are
    /// ignored.
    pub fn add_result(
        &self,
        id: Uuid,
        worker: &str,
        rows: Vec<EntityRow>,
        error: Option<WireError>,
    ) {
        let Some(execution) = self.get(id) else {
            tracing::warn!("result from {worker} for unknown execution {id}");
            return;
        };
        let mut inner = execution.inner.lock();
        if inner.state != ExecutionState::Running {
            tracing::debug!(
                "late result from {worker} for execution {id} in state {:?}",
                inner.state
            );
            return;
        }

        if let Some(error) = error {
            tracing::warn!(
                "worker {worker} failed execution {id}: [{}] {}",
                error.code,
                error.message
            );
            inner.state = ExecutionState::Failed;
            inner.error = Some(error);
            inner.rows.clear();
            inner.pending.clear();
            return;
        }

        if !inner.pending.remove(worker) {
            tracing::warn!("unexpected result from {worker} for execution {id}");
            return;
        }

        tracing::debug!(
            "merged {} rows from {worker} into execution {id}",
            rows.len()
        );
        inner.rows.extend(rows);

        if inner.pending.is_empty() {
            inner.state = ExecutionState::Done;
            // Merging is keyed by entity id, never by arrival order.
            inner.rows.sort_by_key(|row| row.entity);
            tracing::info!(
                "execution {id} done with {} result rows",
                inner.rows.len()
            );
        }
    }

    /// Mark an execution cancelled, returning the workers still pending so
    /// the cancellation can be propagated.
    pub fn cancel(&self, id: Uuid) -> Vec<String> {
        let Some(execution) = self.get(id) else {
            return Vec::new();
        };
        let mut inner = execution.inner.lock();
        if !matches!(
            inner.state,
            ExecutionState::Created | ExecutionState::Running
        ) {
            return Vec::new();
        }
        inner.state = ExecutionState::Cancelled;
        inner.rows.clear();
        inner.pending.drain().collect()
    }

    /// Fail every running execution waiting on one of `workers`, used when
    /// a shard connection is lost.
    pub fn fail_executions_of_workers(&self, workers: &[String], error: WireError) {
        for entry in self.executions.iter() {
            let mut inner = entry.inner.lock();
            if inner.state == ExecutionState::Running
                && workers.iter().any(|w| inner.pending.contains(w))
            {
                tracing::warn!(
                    "failing execution {} after losing workers {workers:?}",
                    entry.id
                );
                inner.state = ExecutionState::Failed;
                inner.error = Some(error.clone());
                inner.rows.clear();
                inner.pending.clear();
            }
        }
    }

    /// User-visible status. Failed executions never report rows.
    pub fn status(&self, id: Uuid) -> Option<ExecutionStatus> {
        let execution = self.get(id)?;
        let inner = execution.inner.lock();
        Some(ExecutionStatus {
            id,
            state: inner.state,
            result_count: match inner.state {
                ExecutionState::Done => inner.rows.len() as u64,
                _ => 0,
            },
            error: inner.error.clone(),
        })
    }

    /// Lazily stream the merged rows of a `Done` execution.
    ///
    /// Returns `None` unless the execution finished successfully; a failed
    /// or cancelled execution never exposes partial-looking results.
    pub fn stream_results(&self, id: Uuid) -> Option<ResultStream> {
        let execution = self.get(id)?;
        {
            let inner = execution.inner.lock();
            if inner.state != ExecutionState::Done {
                return None;
            }
        }
        Some(ResultStream {
            execution,
            next: 0,
        })
    }
}

/// Lazy iterator over the merged rows of one execution.
pub struct ResultStream {
    execution: Arc<ManagedExecution>,
    next: usize,
}

impl Iterator for ResultStream {
    type Item = EntityRow;

    fn next(&mut self) -> Option<EntityRow> {
        let inner = self.execution.inner.lock();
        let row = inner.rows.get(self.next)?.clone();
        self.next += 1;
        Some(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::description::NodeDescription;
    use crate::query::ResultValue;

    fn description() -> PlanDescription {
        PlanDescription {
            dataset: "test".into(),
            root: NodeDescription::Leaf,
            generate_date_aggregator: false,
        }
    }

    fn row(entity: u32) -> EntityRow {
        EntityRow {
            entity,
            values: vec![ResultValue::Integer(1)],
        }
    }

    #[test]
    fn test_done_only_when_pending_empty() {
        let manager = ExecutionManager::new();
        let id = manager.create(description());
        manager.start(id, ["w0".to_string(), "w1".to_string()]);

        manager.add_result(id, "w0", vec![row(1)], None);
        assert_eq!(manager.status(id).unwrap().state, ExecutionState::Running);

        manager.add_result(id, "w1", vec![row(2)], None);
        let status = manager.status(id).unwrap();
        assert_eq!(status.state, ExecutionState::Done);
        assert_eq!(status.result_count, 2);

        let rows: Vec<u32> = manager
            .stream_results(id)
            .unwrap()
            .map(|r| r.entity)
            .collect();
        assert_eq!(rows, vec![1, 2]);
    }

    #[test]
    fn test_single_error_fails_and_discards_partials() {
        let manager = ExecutionManager::new();
        let id = manager.create(description());
        manager.start(id, ["w0".to_string(), "w1".to_string(), "w2".to_string()]);

        manager.add_result(id, "w0", vec![row(1), row(2)], None);
        manager.add_result(
            id,
            "w1",
            vec![],
            Some(WireError {
                code: "EXECUTION".into(),
                message: "boom".into(),
            }),
        );
        // A late healthy partial must not resurrect the execution.
        manager.add_result(id, "w2", vec![row(3)], None);

        let status = manager.status(id).unwrap();
        assert_eq!(status.state, ExecutionState::Failed);
        assert_eq!(status.result_count, 0);
        assert_eq!(status.error.unwrap().code, "EXECUTION");
        assert!(manager.stream_results(id).is_none());
    }

    #[test]
    fn test_cancel_returns_pending_workers() {
        let manager = ExecutionManager::new();
        let id = manager.create(description());
        manager.start(id, ["w0".to_string(), "w1".to_string()]);
        manager.add_result(id, "w0", vec![row(1)], None);

        let mut pending = manager.cancel(id);
        pending.sort();
        assert_eq!(pending, vec!["w1".to_string()]);
        assert_eq!(
            manager.status(id).unwrap().state,
            ExecutionState::Cancelled
        );
        assert!(manager.stream_results(id).is_none());

        // Cancelling a terminal execution is a no-op.
        assert!(manager.cancel(id).is_empty());
    }

    #[test]
    fn test_lost_workers_fail_running_executions() {
        let manager = ExecutionManager::new();
        let id = manager.create(description());
        manager.start(id, ["w0".to_string(), "w1".to_string()]);

        manager.fail_executions_of_workers(
            &["w1".to_string()],
            WireError {
                code: "CONNECTION_LOST".into(),
                message: "shard gone".into(),
            },
        );
        let status = manager.status(id).unwrap();
        assert_eq!(status.state, ExecutionState::Failed);
        assert_eq!(status.error.unwrap().code, "CONNECTION_LOST");
    }

    #[test]
    fn test_rows_merged_by_entity_id() {
        let manager = ExecutionManager::new();
        let id = manager.create(description());
        manager.start(id, ["w0".to_string(), "w1".to_string()]);

        manager.add_result(id, "w1", vec![row(10), row(12)], None);
        manager.add_result(id, "w0", vec![row(3)], None);

        let rows: Vec<u32> = manager
            .stream_results(id)
            .unwrap()
            .map(|r| r.entity)
            .collect();
        assert_eq!(rows, vec![3, 10, 12]);
    }
}
