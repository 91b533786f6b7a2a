//! Workers: process-local partition owners.
//!
//! One worker exists per (shard process, dataset). It owns its entity
//! partition's buckets and CBlocks, a job manager, and an execution pool,
//! and is rebuilt from persisted storage at process start.

pub mod bucket_manager;
pub mod query_executor;
pub mod storage;

pub use bucket_manager::BucketManager;
pub use query_executor::QueryExecutor;
pub use storage::{WorkerInfo, WorkerStorage};

use crate::concepts::{ConceptTreeCache, Dataset};
use crate::error::{Error, Result};
use crate::jobs::{CalculateCBlocksJob, JobManager, JobManagerStatus, ProgressReporter};
use crate::loader::ImportResult;
use crate::query::description::NodeDescription;
use crate::query::{EntityRow, PlanDescription};
use crate::schema::{ConnectorId, ImportId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// A worker: storage, bucket registry, job queues and an execution pool for
/// one dataset partition.
pub struct Worker {
    storage: Arc<Mutex<WorkerStorage>>,
    dataset: Arc<Dataset>,
    bucket_manager: Arc<BucketManager>,
    job_manager: JobManager,
    executor: QueryExecutor,
    /// Resolution caches per (connector, import)
    caches: Mutex<HashMap<(ConnectorId, ImportId), Arc<ConceptTreeCache>>>,
    info: WorkerInfo,
}

impl Worker {
    /// Bring a worker up from its storage image, registering every persisted
    /// bucket and CBlock.
    pub fn new(storage: WorkerStorage, executor_threads: usize) -> Result<Self> {
        let info = storage.info().clone();
        let dataset = storage.dataset().clone();

        let bucket_manager = Arc::new(BucketManager::new());
        for bucket in storage.buckets() {
            bucket_manager.add_bucket(bucket.clone());
        }
        for cblock in storage.cblocks() {
            bucket_manager.add_cblock(cblock.clone());
        }

        let job_manager = JobManager::new(info.name.clone());
        let executor = QueryExecutor::new(&info.name, executor_threads)?;

        tracing::info!(
            "worker {} up for dataset {} (buckets {}..{})",
            info.name,
            info.dataset,
            info.bucket_range.0,
            info.bucket_range.1
        );

        Ok(Self {
            storage: Arc::new(Mutex::new(storage)),
            dataset,
            bucket_manager,
            job_manager,
            executor,
            caches: Mutex::new(HashMap::new()),
            info,
        })
    }

    /// Worker identity.
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Dataset metadata.
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// The worker's bucket registry.
    pub fn bucket_manager(&self) -> &Arc<BucketManager> {
        &self.bucket_manager
    }

    /// Job queue status for heartbeats.
    pub fn job_status(&self) -> JobManagerStatus {
        self.job_manager.report_status()
    }

    /// Register an import's output, keeping only buckets this worker is
    /// responsible for, then schedule the CBlock builds they need.
    pub fn add_import(&self, result: ImportResult) {
        let mut storage = self.storage.lock();
        for dictionary in &result.dictionaries {
            storage.add_dictionary(dictionary.clone());
        }
        let mut owned = 0usize;
        for bucket in result.buckets {
            if !self.info.responsible_for(bucket.bucket()) {
                continue;
            }
            let bucket = Arc::new(bucket);
            storage.add_bucket(bucket.clone());
            self.bucket_manager.add_bucket(bucket);
            owned += 1;
        }
        drop(storage);

        tracing::debug!(
            "worker {} took {owned} buckets from {}",
            self.info.name,
            result.import
        );
        self.schedule_cblock_jobs();
    }

    /// Schedule build jobs for every missing (bucket, connector) CBlock.
    /// Returns the progress handles of the scheduled jobs.
    pub fn schedule_cblock_jobs(&self) -> Vec<Arc<ProgressReporter>> {
        let mut progresses = Vec::new();
        for connector in &self.dataset.connectors {
            let missing = self
                .bucket_manager
                .missing_cblocks(connector.table, connector.id);
            if missing.is_empty() {
                continue;
            }

            // One job per import so the resolution cache stays keyed to a
            // single dictionary universe.
            let mut by_import: HashMap<ImportId, Vec<_>> = HashMap::new();
            for bucket in missing {
                by_import.entry(bucket.import()).or_default().push(bucket);
            }

            for (import, buckets) in by_import {
                let cache = self
                    .caches
                    .lock()
                    .entry((connector.id, import))
                    .or_insert_with(|| Arc::new(ConceptTreeCache::new()))
                    .clone();

                let manager = self.bucket_manager.clone();
                let storage = self.storage.clone();
                let presence_manager = self.bucket_manager.clone();
                let mut job = CalculateCBlocksJob::new(
                    self.dataset.clone(),
                    connector.id,
                    cache,
                    Box::new(move |id| presence_manager.has_cblock(id)),
                    Box::new(move |cblock| {
                        let cblock = Arc::new(cblock);
                        storage.lock().add_cblock(cblock.clone());
                        manager.add_cblock(cblock);
                        Ok(())
                    }),
                );
                for bucket in buckets {
                    job.add_cblock(bucket);
                }
                progresses.push(self.job_manager.add_slow_job(Box::new(job)));
            }
        }
        progresses
    }

    /// Block until every CBlock the given connectors need exists,
    /// (re)scheduling builds rather than silently skipping.
    fn ensure_cblocks(&self, connectors: &BTreeSet<ConnectorId>) -> Result<()> {
        loop {
            let mut missing_any = false;
            for &id in connectors {
                let connector = self
                    .dataset
                    .connector(id)
                    .ok_or_else(|| Error::execution(format!("unknown connector {id}")))?;
                if !self
                    .bucket_manager
                    .missing_cblocks(connector.table, id)
                    .is_empty()
                {
                    missing_any = true;
                }
            }
            if !missing_any {
                return Ok(());
            }

            let progresses = self.schedule_cblock_jobs();
            for progress in &progresses {
                while progress.progress() < 1.0 {
                    std::thread::sleep(Duration::from_millis(2));
                }
            }

            // Jobs are done; anything still missing means a build failed.
            for &id in connectors {
                let connector = self
                    .dataset
                    .connector(id)
                    .ok_or_else(|| Error::execution(format!("unknown connector {id}")))?;
                if !self
                    .bucket_manager
                    .missing_cblocks(connector.table, id)
                    .is_empty()
                {
                    return Err(Error::job(format!(
                        "cblock build for {id} failed, query cannot run"
                    )));
                }
            }
        }
    }

    /// Execute a resolved plan over every owned entity.
    pub fn execute_query(
        &self,
        description: &PlanDescription,
        cancelled: &AtomicBool,
    ) -> Result<Vec<EntityRow>> {
        let mut connectors = BTreeSet::new();
        collect_connectors(&description.root, &mut connectors);
        self.ensure_cblocks(&connectors)?;

        let entities = self.bucket_manager.entities();
        self.executor.execute(
            &self.dataset,
            self.bucket_manager.as_ref(),
            description,
            &entities,
            cancelled,
        )
    }

    /// Snapshot the storage to disk.
    pub fn save(&self) -> Result<()> {
        self.storage.lock().save()
    }

    /// Drain job queues and shut down.
    pub fn close(&mut self) {
        self.job_manager.close();
    }
}

/// Connectors referenced anywhere in a plan.
fn collect_connectors(node: &NodeDescription, out: &mut BTreeSet<ConnectorId>) {
    match node {
        NodeDescription::Leaf => {}
        NodeDescription::Concept { connector, .. } => {
            out.insert(*connector);
        }
        NodeDescription::And(children) | NodeDescription::Or(children) => {
            for child in children {
                collect_connectors(child, out);
            }
        }
        NodeDescription::Negation(child) => collect_connectors(child, out),
        NodeDescription::DateRestriction { child, .. } => collect_connectors(child, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::{Condition, ConceptTree, Connector};
    use crate::loader::{ImportRow, RawValue, TableImporter};
    use crate::query::description::{QueryDescription, QueryFilter, QueryNode, QuerySelect};
    use crate::query::ResultValue;
    use crate::schema::{Column, ColumnKind, DatasetSchema, Table};

    fn dataset() -> Dataset {
        let mut tree = ConceptTree::new("icd");
        tree.add_child(
            0,
            "a",
            Condition::Prefix {
                prefixes: vec!["A".into()],
            },
        )
        .unwrap();
        tree.build_prefix_index();

        Dataset {
            schema: DatasetSchema {
                name: "test".into(),
                tables: vec![Table {
                    name: "diagnoses".into(),
                    index: 0,
                    columns: vec![
                        Column {
                            name: "code".into(),
                            position: 0,
                            kind: ColumnKind::String,
                        },
                        Column {
                            name: "date".into(),
                            position: 1,
                            kind: ColumnKind::Date,
                        },
                    ],
                }],
                entity_bucket_size: 100,
            },
            concepts: vec![tree],
            connectors: vec![Connector {
                id: ConnectorId(0),
                name: "diagnoses".into(),
                concept: 0,
                table: 0,
                column: 0,
                condition: None,
                validity_date_columns: vec![1],
            }],
        }
    }

    fn worker_with_data(dir: &std::path::Path) -> Worker {
        let dataset = dataset();
        let storage = WorkerStorage::create(
            dir,
            WorkerInfo {
                name: "w0".into(),
                dataset: "test".into(),
                bucket_range: (0, 100),
            },
            dataset.clone(),
        );
        let worker = Worker::new(storage, 2).unwrap();

        let importer = TableImporter::new(
            dataset.schema.tables[0].clone(),
            ImportId { table: 0, seq: 1 },
            100,
        );
        let result = importer
            .import(vec![
                ImportRow {
                    entity: 1,
                    values: vec![
                        Some(RawValue::String("A01".into())),
                        Some(RawValue::Date(10)),
                    ],
                },
                ImportRow {
                    entity: 2,
                    values: vec![
                        Some(RawValue::String("B01".into())),
                        Some(RawValue::Date(20)),
                    ],
                },
            ])
            .unwrap();
        worker.add_import(result);
        worker
    }

    fn count_query() -> QueryDescription {
        QueryDescription {
            dataset: "test".into(),
            root: QueryNode::Concept {
                concept: "icd.a".into(),
                connector: "diagnoses".into(),
                filters: vec![QueryFilter::CountRange {
                    column: None,
                    min: Some(1),
                    max: None,
                }],
                selects: vec![QuerySelect::Count { column: None }],
            },
            generate_date_aggregator: false,
        }
    }

    #[test]
    fn test_query_awaits_cblock_builds() {
        let dir = tempfile::tempdir().unwrap();
        let worker = worker_with_data(dir.path());
        let description = count_query().resolve(worker.dataset()).unwrap();

        // No explicit wait for the scheduled jobs: execute_query must block
        // on the presence check itself.
        let rows = worker
            .execute_query(&description, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, 1);
        assert_eq!(rows[0].values, vec![ResultValue::Integer(1)]);
    }

    #[test]
    fn test_worker_survives_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let worker = worker_with_data(dir.path());
            let description = count_query().resolve(worker.dataset()).unwrap();
            worker
                .execute_query(&description, &AtomicBool::new(false))
                .unwrap();
            worker.save().unwrap();
        }

        let storage = WorkerStorage::load(dir.path()).unwrap();
        let worker = Worker::new(storage, 2).unwrap();
        let description = count_query().resolve(worker.dataset()).unwrap();
        let rows = worker
            .execute_query(&description, &AtomicBool::new(false))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, 1);
    }

    #[test]
    fn test_irresponsible_buckets_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset();
        let storage = WorkerStorage::create(
            dir.path(),
            WorkerInfo {
                name: "w1".into(),
                dataset: "test".into(),
                bucket_range: (5, 10),
            },
            dataset.clone(),
        );
        let worker = Worker::new(storage, 1).unwrap();

        let importer = TableImporter::new(
            dataset.schema.tables[0].clone(),
            ImportId { table: 0, seq: 1 },
            100,
        );
        // Entity 1 lives in bucket 0, outside this worker's range.
        let result = importer
            .import(vec![ImportRow {
                entity: 1,
                values: vec![Some(RawValue::String("A01".into())), None],
            }])
            .unwrap();
        worker.add_import(result);
        assert!(worker.bucket_manager().entities().is_empty());
    }
}
