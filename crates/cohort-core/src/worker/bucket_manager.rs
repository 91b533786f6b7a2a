//! Registry of a worker's buckets and CBlocks.

use crate::events::{Bucket, CBlock};
use crate::query::plan::BucketRegistry;
use crate::schema::{BucketId, CBlockId, ConnectorId, TableIndex};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Holds every bucket and CBlock a worker owns and answers the pruning
/// queries of the plan executor. Buckets/CBlocks are registered during
/// import and CBlock builds and only ever read during queries.
#[derive(Default)]
pub struct BucketManager {
    /// Buckets per table, keyed by id so iteration ascends by
    /// (import, bucket number)
    by_table: RwLock<HashMap<TableIndex, BTreeMap<BucketId, Arc<Bucket>>>>,
    cblocks: RwLock<HashMap<CBlockId, Arc<CBlock>>>,
    /// Every entity with at least one event in any owned bucket
    entities: RwLock<RoaringBitmap>,
}

impl BucketManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a bucket.
    pub fn add_bucket(&self, bucket: Arc<Bucket>) {
        let mut entities = self.entities.write();
        for entity in bucket.entities() {
            entities.insert(entity);
        }
        drop(entities);

        self.by_table
            .write()
            .entry(bucket.import().table)
            .or_default()
            .insert(bucket.id(), bucket);
    }

    /// Register a finished CBlock.
    pub fn add_cblock(&self, cblock: Arc<CBlock>) {
        self.cblocks.write().insert(cblock.id(), cblock);
    }

    /// Whether a CBlock has been built.
    pub fn has_cblock(&self, id: CBlockId) -> bool {
        self.cblocks.read().contains_key(&id)
    }

    /// All entities with data on this worker, ascending.
    pub fn entities(&self) -> Vec<u32> {
        self.entities.read().iter().collect()
    }

    /// All buckets of one table, ascending by bucket id.
    pub fn table_buckets(&self, table: TableIndex) -> Vec<Arc<Bucket>> {
        self.by_table
            .read()
            .get(&table)
            .map(|buckets| buckets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Bucket/connector pairs of `table` that still miss their CBlock.
    pub fn missing_cblocks(&self, table: TableIndex, connector: ConnectorId) -> Vec<Arc<Bucket>> {
        let cblocks = self.cblocks.read();
        self.by_table
            .read()
            .get(&table)
            .map(|buckets| {
                buckets
                    .values()
                    .filter(|bucket| {
                        !cblocks.contains_key(&CBlockId {
                            bucket: bucket.id(),
                            connector,
                        })
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop all buckets and CBlocks of one import, ahead of a re-import.
    pub fn remove_import(&self, import: crate::schema::ImportId) {
        if let Some(buckets) = self.by_table.write().get_mut(&import.table) {
            buckets.retain(|id, _| id.import != import);
        }
        self.cblocks
            .write()
            .retain(|id, _| id.bucket.import != import);
    }
}

impl BucketRegistry for BucketManager {
    fn entity_buckets(&self, table: TableIndex, entity: u32) -> Vec<Arc<Bucket>> {
        self.by_table
            .read()
            .get(&table)
            .map(|buckets| {
                buckets
                    .values()
                    .filter(|bucket| bucket.contains_entity(entity))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn cblock(&self, id: CBlockId) -> Option<Arc<CBlock>> {
        self.cblocks.read().get(&id).cloned()
    }

    fn entity_has_data(&self, table: TableIndex, entity: u32) -> bool {
        self.by_table
            .read()
            .get(&table)
            .is_some_and(|buckets| buckets.values().any(|b| b.contains_entity(entity)))
    }
}
