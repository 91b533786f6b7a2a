//! Immutable, entity-partitioned columnar slices of one imported table.

use crate::common::DateRange;
use crate::dictionary::DictId;
use crate::events::stores::{ColumnStore, StoreValue};
use crate::schema::{BucketId, Column, ColumnIndex, ImportId, TableIndex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;

/// Sentinel table index for the synthetic "all ids" pass that establishes
/// entity existence before any real table is visited.
pub const ALL_IDS_TABLE: TableIndex = TableIndex::MAX;

/// One (entity, event) position inside a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketEntry {
    /// Global entity id
    pub entity: u32,
    /// Event index within the bucket
    pub event: usize,
}

/// Contains events of possibly multiple entities, loaded in a single import.
///
/// A bucket covers the contiguous entity range
/// `[bucket * bucket_size, (bucket + 1) * bucket_size)`. It is immutable and
/// replaced wholesale on re-import.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    id: BucketId,
    number_of_events: usize,
    bucket_size: u32,
    stores: Vec<ColumnStore>,
    /// Global entity id -> first owned event
    entity_start: BTreeMap<u32, u32>,
    /// Global entity id -> one past the last owned event
    entity_end: BTreeMap<u32, u32>,
}

impl Bucket {
    /// Assemble a bucket. Entity ranges must be half-open, non-overlapping
    /// and within `number_of_events`; the loader guarantees this.
    pub fn new(
        id: BucketId,
        bucket_size: u32,
        number_of_events: usize,
        stores: Vec<ColumnStore>,
        entity_start: BTreeMap<u32, u32>,
        entity_end: BTreeMap<u32, u32>,
    ) -> Self {
        debug_assert_eq!(entity_start.len(), entity_end.len());
        Self {
            id,
            number_of_events,
            bucket_size,
            stores,
            entity_start,
            entity_end,
        }
    }

    /// The synthetic zero-column bucket used for the all-ids pass. Carries a
    /// single event so existence nodes get exactly one `accept_event` call.
    pub fn empty() -> Self {
        Self {
            id: BucketId {
                import: ImportId {
                    table: ALL_IDS_TABLE,
                    seq: 0,
                },
                bucket: 0,
            },
            number_of_events: 1,
            bucket_size: 0,
            stores: Vec::new(),
            entity_start: BTreeMap::new(),
            entity_end: BTreeMap::new(),
        }
    }

    /// Bucket identity.
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// Bucket number within the import.
    pub fn bucket(&self) -> u32 {
        self.id.bucket
    }

    /// Owning import.
    pub fn import(&self) -> ImportId {
        self.id.import
    }

    /// Total number of events across all contained entities.
    pub fn number_of_events(&self) -> usize {
        self.number_of_events
    }

    /// Entity range width of the dataset this bucket belongs to.
    pub fn bucket_size(&self) -> u32 {
        self.bucket_size
    }

    /// Whether this is the synthetic all-ids bucket.
    pub fn is_empty_bucket(&self) -> bool {
        self.id.import.table == ALL_IDS_TABLE
    }

    /// Column stores in position order.
    pub fn stores(&self) -> &[ColumnStore] {
        &self.stores
    }

    /// Whether the bucket holds events of `entity`.
    pub fn contains_entity(&self, entity: u32) -> bool {
        self.entity_start.contains_key(&entity)
    }

    /// First owned event of `entity`.
    pub fn entity_start(&self, entity: u32) -> Option<usize> {
        self.entity_start.get(&entity).map(|&e| e as usize)
    }

    /// One past the last owned event of `entity`.
    pub fn entity_end(&self, entity: u32) -> Option<usize> {
        self.entity_end.get(&entity).map(|&e| e as usize)
    }

    /// Contained entities in ascending id order.
    pub fn entities(&self) -> impl Iterator<Item = u32> + '_ {
        self.entity_start.keys().copied()
    }

    /// Map a global entity id to the bucket-local slot used by CBlock
    /// per-entity arrays.
    pub fn to_local(&self, entity: u32) -> u32 {
        entity - self.bucket_size * self.id.bucket
    }

    /// Iterate `(entity, event)` pairs, entities ascending, events ascending
    /// within each entity. The deterministic order is load-bearing for
    /// reproducible CBlock builds.
    pub fn entries(&self) -> impl Iterator<Item = BucketEntry> + '_ {
        self.entity_start.iter().flat_map(move |(&entity, &start)| {
            let end = self.entity_end.get(&entity).copied().unwrap_or(start);
            (start as usize..end as usize).map(move |event| BucketEntry { entity, event })
        })
    }

    fn store(&self, column: ColumnIndex) -> &ColumnStore {
        &self.stores[column as usize]
    }

    /// Whether `column` carries a value at `event`. Compound date ranges are
    /// present when either referenced column is.
    pub fn has(&self, event: usize, column: ColumnIndex) -> bool {
        let store = self.store(column);
        if let Some((start, end)) = store.compound_range_columns() {
            return self.store(start).has(event) || self.store(end).has(event);
        }
        store.has(event)
    }

    /// Dictionary code of a string column.
    pub fn string(&self, event: usize, column: ColumnIndex) -> Option<DictId> {
        self.store(column).string(event)
    }

    /// Value of an integer column.
    pub fn integer(&self, event: usize, column: ColumnIndex) -> Option<i64> {
        self.store(column).integer(event)
    }

    /// Value of a real column.
    pub fn real(&self, event: usize, column: ColumnIndex) -> Option<f64> {
        self.store(column).real(event)
    }

    /// Value of a decimal column as `(unscaled, scale)`.
    pub fn decimal(&self, event: usize, column: ColumnIndex) -> Option<(i128, i32)> {
        self.store(column).decimal(event)
    }

    /// Value of a money column in minor units.
    pub fn money(&self, event: usize, column: ColumnIndex) -> Option<i64> {
        self.store(column).money(event)
    }

    /// Value of a boolean column.
    pub fn boolean(&self, event: usize, column: ColumnIndex) -> Option<bool> {
        self.store(column).boolean(event)
    }

    /// Value of a date column as an epoch day.
    pub fn date(&self, event: usize, column: ColumnIndex) -> Option<i32> {
        self.store(column).date(event)
    }

    /// Value of a date or date-range column as a range. Compound payloads
    /// combine the two referenced date columns; a missing end leaves the
    /// range open on that side.
    pub fn date_range(&self, event: usize, column: ColumnIndex) -> Option<DateRange> {
        let store = self.store(column);
        if let Some((start_col, end_col)) = store.compound_range_columns() {
            let start = self.store(start_col).date(event);
            let end = self.store(end_col).date(event);
            return match (start, end) {
                (Some(min), Some(max)) => Some(DateRange::of(min.min(max), max.max(min))),
                (Some(min), None) => Some(DateRange::at_least(min)),
                (None, Some(max)) => Some(DateRange::at_most(max)),
                (None, None) => None,
            };
        }
        match store.kind() {
            crate::schema::ColumnKind::Date => store.date(event).map(DateRange::exactly),
            _ => store.date_range(event),
        }
    }

    /// Decoded value of any column.
    pub fn value(&self, event: usize, column: ColumnIndex) -> Option<StoreValue> {
        let store = self.store(column);
        if store.compound_range_columns().is_some() {
            return self.date_range(event, column).map(StoreValue::DateRange);
        }
        store.value(event)
    }

    /// Whether the event's range in `column` intersects `ranges`.
    pub fn event_is_contained_in(
        &self,
        event: usize,
        column: ColumnIndex,
        ranges: &crate::common::DateSet,
    ) -> bool {
        match self.date_range(event, column) {
            Some(range) => ranges.intersects(&range),
            None => false,
        }
    }

    /// Materialize the present values of one event, keyed by column name.
    /// Used by connector row conditions; built lazily by callers.
    pub fn calculate_row(&self, event: usize, columns: &[Column]) -> HashMap<String, String> {
        let mut row = HashMap::with_capacity(self.stores.len());
        for column in columns {
            if let Some(value) = self.value(event, column.position) {
                row.insert(column.name.clone(), value.to_string());
            }
        }
        row
    }

    /// Re-inject the shared dictionary into all string stores after load.
    pub fn attach_dictionaries(
        &mut self,
        dictionaries: &HashMap<String, std::sync::Arc<crate::dictionary::Dictionary>>,
    ) {
        for store in &mut self.stores {
            if let ColumnStore::String(s) = store {
                if let Some(dict) = dictionaries.get(s.dictionary_name()) {
                    s.attach_dictionary(dict.clone());
                }
            }
        }
    }

    /// Check the coverage invariant: every contained entity has
    /// `start <= end <= number_of_events` and ranges never overlap.
    pub fn validate(&self) -> crate::Result<()> {
        let mut previous_end = 0u32;
        for (&entity, &start) in &self.entity_start {
            let end = *self
                .entity_end
                .get(&entity)
                .ok_or_else(|| crate::Error::import(format!("entity {entity} missing end")))?;
            if start > end || end as usize > self.number_of_events {
                return Err(crate::Error::import(format!(
                    "entity {entity} range {start}..{end} outside bucket {}",
                    self.id
                )));
            }
            if start < previous_end {
                return Err(crate::Error::import(format!(
                    "entity {entity} range {start}..{end} overlaps predecessor in {}",
                    self.id
                )));
            }
            previous_end = end;
        }
        Ok(())
    }
}
