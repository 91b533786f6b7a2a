//! End-to-end engine fixture: one table, one bucket of three events, a
//! boolean column `[true, null, false]` for entities `[1, 2, 3]`, and a
//! count filter over `[1, 3]`.

use cohort_core::concepts::{ConceptTree, ConceptTreeCache, Condition, Connector, Dataset};
use cohort_core::jobs::calculate_cblocks::CalculateCBlocksJob;
use cohort_core::jobs::{Job, ProgressReporter};
use cohort_core::loader::{ImportRow, RawValue, TableImporter};
use cohort_core::query::description::{QueryDescription, QueryFilter, QueryNode, QuerySelect};
use cohort_core::query::ResultValue;
use cohort_core::schema::{Column, ColumnKind, ConnectorId, DatasetSchema, ImportId, Table};
use cohort_core::worker::BucketManager;
use cohort_core::worker::QueryExecutor;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn dataset() -> Dataset {
    let mut tree = ConceptTree::new("visits");
    tree.add_child(
        0,
        "any",
        Condition::Prefix {
            prefixes: vec!["".into()],
        },
    )
    .unwrap();
    tree.build_prefix_index();

    Dataset {
        schema: DatasetSchema {
            name: "scenario".into(),
            tables: vec![Table {
                name: "events".into(),
                index: 0,
                columns: vec![
                    Column {
                        name: "kind".into(),
                        position: 0,
                        kind: ColumnKind::String,
                    },
                    Column {
                        name: "flag".into(),
                        position: 1,
                        kind: ColumnKind::Boolean,
                    },
                ],
            }],
            entity_bucket_size: 10,
        },
        concepts: vec![tree],
        connectors: vec![Connector {
            id: ConnectorId(0),
            name: "events".into(),
            concept: 0,
            table: 0,
            column: 0,
            condition: None,
            validity_date_columns: vec![],
        }],
    }
}

fn populated_manager(dataset: &Arc<Dataset>) -> Arc<BucketManager> {
    let importer = TableImporter::new(
        dataset.schema.tables[0].clone(),
        ImportId { table: 0, seq: 1 },
        dataset.schema.entity_bucket_size,
    );
    let flags = [Some(true), None, Some(false)];
    let rows = flags
        .iter()
        .enumerate()
        .map(|(i, flag)| ImportRow {
            entity: i as u32 + 1,
            values: vec![
                Some(RawValue::String("visit".into())),
                flag.map(RawValue::Boolean),
            ],
        })
        .collect();
    let result = importer.import(rows).unwrap();
    assert_eq!(result.buckets.len(), 1, "one bucket of size 3 expected");
    assert_eq!(result.buckets[0].number_of_events(), 3);

    let manager = Arc::new(BucketManager::new());
    for bucket in result.buckets {
        manager.add_bucket(Arc::new(bucket));
    }

    let sink = manager.clone();
    let mut job = CalculateCBlocksJob::new(
        dataset.clone(),
        ConnectorId(0),
        Arc::new(ConceptTreeCache::new()),
        Box::new(|_| false),
        Box::new(move |cblock| {
            sink.add_cblock(Arc::new(cblock));
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
fn count_filter_excludes_entity_without_values() {
    let dataset = Arc::new(dataset());
    let manager = populated_manager(&dataset);
    let executor = QueryExecutor::new("scenario", 2).unwrap();

    let query = QueryDescription {
        dataset: "scenario".into(),
        root: QueryNode::Concept {
            concept: "visits.any".into(),
            connector: "events".into(),
            filters: vec![QueryFilter::CountRange {
                column: Some("flag".into()),
                min: Some(1),
                max: Some(3),
            }],
            selects: vec![QuerySelect::Count {
                column: Some("flag".into()),
            }],
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

    // Entity 2's flag is null: it contributes to no aggregator and the
    // count filter excludes it. Entities 1 and 3 count exactly one value
    // each (true and false are both *present* values).
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].entity, 1);
    assert_eq!(rows[0].values, vec![ResultValue::Integer(1)]);
    assert_eq!(rows[1].entity, 3);
    assert_eq!(rows[1].values, vec![ResultValue::Integer(1)]);
}

#[test]
fn unfiltered_existence_includes_all_entities() {
    let dataset = Arc::new(dataset());
    let manager = populated_manager(&dataset);
    let executor = QueryExecutor::new("scenario", 2).unwrap();

    let query = QueryDescription {
        dataset: "scenario".into(),
        root: QueryNode::Concept {
            concept: "visits".into(),
            connector: "events".into(),
            filters: vec![],
            selects: vec![QuerySelect::Exists],
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

    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.values, vec![ResultValue::Boolean(true)]);
    }
}
