//! CBlock calculation job.
//!
//! For every event of every bucket the connector covers: skip events the
//! connector's row condition rejects, decode the string value through the
//! column dictionary, resolve the deepest matching concept node via the
//! per-import cache, and OR the full ancestor bit chain into the owning
//! entity's bitmask. Unmatched events are recorded as unmatched, never as
//! errors, and contribute nothing to the date index.

use crate::concepts::{ConceptTreeCache, Dataset, LazyRow};
use crate::error::{Error, Result};
use crate::events::{Bucket, CBlock, CBlockBuilder};
use crate::jobs::{Job, ProgressReporter};
use crate::schema::{CBlockId, ConnectorId};
use std::sync::Arc;

/// Storage sink receiving each finished CBlock.
pub type CBlockSink = Box<dyn FnMut(CBlock) -> Result<()> + Send>;

/// Presence check used to skip already-built CBlocks.
pub type CBlockPresence = Box<dyn Fn(CBlockId) -> bool + Send>;

struct CalculationInfo {
    bucket: Arc<Bucket>,
    cblock_id: CBlockId,
}

/// Builds the CBlocks of one connector over a set of buckets.
pub struct CalculateCBlocksJob {
    dataset: Arc<Dataset>,
    connector: ConnectorId,
    cache: Arc<ConceptTreeCache>,
    infos: Vec<CalculationInfo>,
    has_cblock: CBlockPresence,
    sink: CBlockSink,
}

impl CalculateCBlocksJob {
    /// Job for `connector`, resolving through `cache` and handing finished
    /// CBlocks to `sink`.
    pub fn new(
        dataset: Arc<Dataset>,
        connector: ConnectorId,
        cache: Arc<ConceptTreeCache>,
        has_cblock: CBlockPresence,
        sink: CBlockSink,
    ) -> Self {
        Self {
            dataset,
            connector,
            cache,
            infos: Vec::new(),
            has_cblock,
            sink,
        }
    }

    /// Register one bucket for calculation.
    pub fn add_cblock(&mut self, bucket: Arc<Bucket>) {
        let cblock_id = CBlockId {
            bucket: bucket.id(),
            connector: self.connector,
        };
        self.infos.push(CalculationInfo { bucket, cblock_id });
    }

    /// Whether no buckets are registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    fn calculate(&self, info: &CalculationInfo) -> Result<CBlock> {
        let connector = self
            .dataset
            .connector(self.connector)
            .ok_or_else(|| Error::concept(format!("unknown connector {}", self.connector)))?;
        let tree = self
            .dataset
            .concept(connector.concept)
            .ok_or_else(|| Error::concept(format!("unknown concept tree {}", connector.concept)))?;
        let table = self
            .dataset
            .schema
            .tables
            .get(connector.table as usize)
            .ok_or_else(|| Error::concept(format!("connector {} without table", connector.name)))?;

        let bucket = &info.bucket;
        let mut builder = CBlockBuilder::new(
            info.cblock_id,
            bucket.number_of_events(),
            bucket.bucket_size(),
        );

        let date_columns: Vec<_> = table
            .columns
            .iter()
            .filter(|c| c.kind.is_date_compatible())
            .map(|c| c.position)
            .collect();

        for entry in bucket.entries() {
            let event = entry.event;
            let local = bucket.to_local(entry.entity);
            let row = LazyRow::new(bucket, &table.columns, event);

            // Events without values are skipped. Events can also be filtered
            // by the row condition, allowing a single table to be shared by
            // multiple connectors.
            let Some(code) = bucket.string(event, connector.column) else {
                builder.push_event(None);
                continue;
            };
            let value = match bucket.stores().get(connector.column as usize) {
                Some(crate::events::ColumnStore::String(store)) => match store.decode(event) {
                    Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                    None => {
                        tracing::error!(
                            "failed to decode event {}-{event} of {}: code {code} missing from dictionary",
                            bucket.id(),
                            connector.name
                        );
                        builder.push_event(None);
                        continue;
                    }
                },
                _ => {
                    return Err(Error::concept(format!(
                        "connector {} column {} is not a string column",
                        connector.name, connector.column
                    )))
                }
            };

            if let Some(condition) = &connector.condition {
                if !condition.matches(&value, &row) {
                    builder.push_event(None);
                    continue;
                }
            }

            match self.cache.find_most_specific_child(tree, code, &value, &row) {
                Some(matched) => {
                    builder.push_event(Some(matched));
                    for ancestor in tree.ancestor_chain(matched) {
                        if let Some(node) = tree.node(ancestor) {
                            builder.include_concept(local, node.bit);
                        }
                    }
                    for &column in &date_columns {
                        if let Some(range) = bucket.date_range(event, column) {
                            builder.span_dates(local, &range);
                        }
                    }
                }
                None => builder.push_event(None),
            }
        }

        Ok(builder.freeze())
    }
}

impl Job for CalculateCBlocksJob {
    fn label(&self) -> String {
        format!(
            "Calculate {} cblocks for {}",
            self.infos.len(),
            self.connector
        )
    }

    fn execute(&mut self, progress: &ProgressReporter) -> Result<()> {
        progress.set_max(self.infos.len() as u64);

        let infos = std::mem::take(&mut self.infos);
        for info in &infos {
            if (self.has_cblock)(info.cblock_id) {
                progress.report(1);
                continue;
            }
            let cblock = self.calculate(info).map_err(|e| {
                Error::job(format!(
                    "cblock calculation failed (cblock={}, connector={}): {e}",
                    info.cblock_id, self.connector
                ))
            })?;
            (self.sink)(cblock)?;
            progress.report(1);
        }

        tracing::trace!(
            "concept cache for {}: hits={}, misses={}, entries={}",
            self.connector,
            self.cache.hits(),
            self.cache.misses(),
            self.cache.len()
        );
        progress.done();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::{Condition, ConceptTree, Connector};
    use crate::loader::{ImportRow, RawValue, TableImporter};
    use crate::schema::{Column, ColumnKind, DatasetSchema, ImportId, Table};
    use parking_lot::Mutex;

    fn dataset() -> Dataset {
        let table = Table {
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
        };

        let mut tree = ConceptTree::new("icd");
        let a = tree
            .add_child(
                0,
                "a",
                Condition::Prefix {
                    prefixes: vec!["A".into()],
                },
            )
            .unwrap();
        tree.add_child(
            a,
            "a01",
            Condition::Prefix {
                prefixes: vec!["A01".into()],
            },
        )
        .unwrap();
        tree.build_prefix_index();

        Dataset {
            schema: DatasetSchema {
                name: "test".into(),
                tables: vec![table],
                entity_bucket_size: 10,
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

    fn import_fixture(dataset: &Dataset) -> Arc<Bucket> {
        let importer = TableImporter::new(
            dataset.schema.tables[0].clone(),
            ImportId { table: 0, seq: 1 },
            dataset.schema.entity_bucket_size,
        );
        let rows = vec![
            ImportRow {
                entity: 0,
                values: vec![
                    Some(RawValue::String("A01".into())),
                    Some(RawValue::Date(100)),
                ],
            },
            ImportRow {
                entity: 0,
                values: vec![Some(RawValue::String("Z99".into())), None],
            },
            ImportRow {
                entity: 1,
                values: vec![
                    Some(RawValue::String("A99".into())),
                    Some(RawValue::Date(200)),
                ],
            },
            ImportRow {
                entity: 2,
                values: vec![None, Some(RawValue::Date(300))],
            },
        ];
        Arc::new(importer.import(rows).unwrap().buckets.remove(0))
    }

    fn run_job(dataset: Arc<Dataset>, bucket: Arc<Bucket>) -> CBlock {
        let produced = Arc::new(Mutex::new(Vec::new()));
        let sink_produced = produced.clone();
        let mut job = CalculateCBlocksJob::new(
            dataset,
            ConnectorId(0),
            Arc::new(ConceptTreeCache::new()),
            Box::new(|_| false),
            Box::new(move |cblock| {
                sink_produced.lock().push(cblock);
                Ok(())
            }),
        );
        job.add_cblock(bucket);
        job.execute(&ProgressReporter::default()).unwrap();
        let mut produced = produced.lock();
        assert_eq!(produced.len(), 1);
        produced.remove(0)
    }

    #[test]
    fn test_build_matches_and_bitmask() {
        let dataset = Arc::new(dataset());
        let bucket = import_fixture(&dataset);
        let cblock = run_job(dataset.clone(), bucket);

        let tree = dataset.concept(0).unwrap();
        let a01 = tree.resolve_path("icd.a.a01").unwrap();
        let a = tree.resolve_path("icd.a").unwrap();

        // entity 0: "A01" matches the deepest node, "Z99" nothing
        assert_eq!(cblock.most_specific_child(0), Some(a01));
        assert_eq!(cblock.most_specific_child(1), None);
        // entity 1: "A99" matches only the first level
        assert_eq!(cblock.most_specific_child(2), Some(a));
        // entity 2: absent value
        assert_eq!(cblock.most_specific_child(3), None);

        // entity 0 bitmask covers a01's whole ancestor chain
        let mask0 = cblock.included_concepts(0);
        for ancestor in tree.ancestor_chain(a01) {
            let bit = tree.node(ancestor).unwrap().bit;
            assert_ne!(mask0 & (1 << (bit % 64)), 0);
        }
        // entity 2 matched nothing
        assert_eq!(cblock.included_concepts(2), 0);
    }

    #[test]
    fn test_date_index_skips_unmatched_events() {
        let dataset = Arc::new(dataset());
        let bucket = import_fixture(&dataset);
        let cblock = run_job(dataset.clone(), bucket);

        use crate::common::DateRange;
        assert_eq!(cblock.entity_date_range(0), Some(DateRange::of(100, 100)));
        assert_eq!(cblock.entity_date_range(1), Some(DateRange::of(200, 200)));
        // entity 2 has a dated event but no concept match
        assert_eq!(cblock.entity_date_range(2), None);
    }

    #[test]
    fn test_rebuild_is_identical() {
        let dataset = Arc::new(dataset());
        let bucket = import_fixture(&dataset);
        let first = run_job(dataset.clone(), bucket.clone());
        let second = run_job(dataset.clone(), bucket);

        assert_eq!(
            bincode::serialize(&first).unwrap(),
            bincode::serialize(&second).unwrap()
        );
    }

    #[test]
    fn test_row_condition_filters_events() {
        let mut dataset = dataset();
        dataset.connectors[0].condition = Some(Condition::Prefix {
            prefixes: vec!["A0".into()],
        });
        let dataset = Arc::new(dataset);
        let bucket = import_fixture(&dataset);
        let cblock = run_job(dataset.clone(), bucket);

        let tree = dataset.concept(0).unwrap();
        let a01 = tree.resolve_path("icd.a.a01").unwrap();
        assert_eq!(cblock.most_specific_child(0), Some(a01));
        // "A99" passes no row condition now
        assert_eq!(cblock.most_specific_child(2), None);
        assert_eq!(cblock.included_concepts(1), 0);
    }
}
