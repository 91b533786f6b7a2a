//! Per-entity plan execution on a bounded thread pool.

use crate::concepts::Dataset;
use crate::error::{Error, Result};
use crate::query::plan::{BucketRegistry, ExecutionContext};
use crate::query::{EntityRow, PlanDescription};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Executes one plan clone per entity on a bounded rayon pool.
///
/// Buckets and CBlocks are read-only during queries, so concurrent entity
/// evaluations need no locking. Cancellation is best-effort: entities
/// already being evaluated run to completion, unstarted ones are skipped.
pub struct QueryExecutor {
    pool: rayon::ThreadPool,
}

impl QueryExecutor {
    /// Executor with `threads` worker threads (0 = number of cores).
    pub fn new(name: &str, threads: usize) -> Result<Self> {
        let name = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |i| format!("{name}-exec-{i}"))
            .build()
            .map_err(|e| Error::execution(format!("building executor pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Evaluate `description` for every entity in `entities`.
    ///
    /// Per-entity failures are logged and skipped; only a description that
    /// cannot produce a plan at all fails the query.
    pub fn execute(
        &self,
        dataset: &Arc<Dataset>,
        registry: &dyn BucketRegistry,
        description: &PlanDescription,
        entities: &[u32],
        cancelled: &AtomicBool,
    ) -> Result<Vec<EntityRow>> {
        // Probe once so a structurally broken description is an error, not
        // an empty result.
        description.build_plan(dataset)?;

        let rows = self.pool.install(|| {
            entities
                .par_iter()
                .filter_map(|&entity| {
                    if cancelled.load(Ordering::Relaxed) {
                        return None;
                    }
                    let mut plan = match description.build_plan(dataset) {
                        Ok(plan) => plan,
                        Err(e) => {
                            tracing::error!("building plan for entity {entity} failed: {e}");
                            return None;
                        }
                    };
                    let ctx = ExecutionContext::new(dataset, registry);
                    plan.execute(&ctx, entity)
                })
                .collect()
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::{Condition, ConceptTree, Connector};
    use crate::concepts::ConceptTreeCache;
    use crate::jobs::calculate_cblocks::CalculateCBlocksJob;
    use crate::jobs::{Job, ProgressReporter};
    use crate::loader::{ImportRow, RawValue, TableImporter};
    use crate::query::description::{QueryDescription, QueryNode, QuerySelect};
    use crate::query::ResultValue;
    use crate::schema::{Column, ColumnKind, ConnectorId, DatasetSchema, ImportId, Table};
    use crate::worker::bucket_manager::BucketManager;

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

    fn populated_manager(dataset: &Arc<Dataset>) -> Arc<BucketManager> {
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
                    entity: 1,
                    values: vec![
                        Some(RawValue::String("A02".into())),
                        Some(RawValue::Date(20)),
                    ],
                },
                ImportRow {
                    entity: 2,
                    values: vec![
                        Some(RawValue::String("Z99".into())),
                        Some(RawValue::Date(30)),
                    ],
                },
            ])
            .unwrap();

        let manager = Arc::new(BucketManager::new());
        for bucket in result.buckets {
            manager.add_bucket(Arc::new(bucket));
        }

        // Build the CBlocks synchronously for the fixture.
        let sink_manager = manager.clone();
        let mut job = CalculateCBlocksJob::new(
            dataset.clone(),
            ConnectorId(0),
            Arc::new(ConceptTreeCache::new()),
            Box::new(|_| false),
            Box::new(move |cblock| {
                sink_manager.add_cblock(Arc::new(cblock));
                Ok(())
            }),
        );
        for bucket in manager.table_buckets(0) {
            job.add_cblock(bucket);
        }
        job.execute(&ProgressReporter::default()).unwrap();
        manager
    }

    #[test]
    fn test_execute_filters_entities() {
        let dataset = Arc::new(dataset());
        let manager = populated_manager(&dataset);
        let executor = QueryExecutor::new("test", 2).unwrap();

        let query = QueryDescription {
            dataset: "test".into(),
            root: QueryNode::Concept {
                concept: "icd.a".into(),
                connector: "diagnoses".into(),
                filters: vec![],
                selects: vec![QuerySelect::Count { column: None }],
            },
            generate_date_aggregator: false,
        };
        let description = query.resolve(&dataset).unwrap();

        let mut rows = executor
            .execute(
                &dataset,
                manager.as_ref(),
                &description,
                &manager.entities(),
                &AtomicBool::new(false),
            )
            .unwrap();
        rows.sort_by_key(|r| r.entity);

        // Entity 1 has two matching events, entity 2 none.
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, 1);
        assert_eq!(rows[0].values, vec![ResultValue::Integer(2)]);
    }

    #[test]
    fn test_cancelled_execution_schedules_nothing() {
        let dataset = Arc::new(dataset());
        let manager = populated_manager(&dataset);
        let executor = QueryExecutor::new("test", 2).unwrap();

        let query = QueryDescription {
            dataset: "test".into(),
            root: QueryNode::Concept {
                concept: "icd.a".into(),
                connector: "diagnoses".into(),
                filters: vec![],
                selects: vec![],
            },
            generate_date_aggregator: false,
        };
        let description = query.resolve(&dataset).unwrap();

        let rows = executor
            .execute(
                &dataset,
                manager.as_ref(),
                &description,
                &manager.entities(),
                &AtomicBool::new(true),
            )
            .unwrap();
        assert!(rows.is_empty());
    }
}
