//! Import-time bucket assembly and storage type selection.
//!
//! The preprocessing pipeline delivers typed rows pre-partitioned by entity.
//! This module groups them into entity-range buckets and freezes each column
//! into the narrowest store representation fitting the observed values.
//! All of this runs off the query hot path; what matters downstream is the
//! output contract: frozen, typed, presence-tracked stores.

use crate::common::DateRange;
use crate::dictionary::Dictionary;
use crate::events::stores::{
    ColumnStore, DateRangePayload, DecimalData, IntegerData, Presence, RealData, StringStore,
};
use crate::events::Bucket;
use crate::error::{Error, Result};
use crate::schema::{BucketId, ColumnKind, ImportId, Table};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A single raw cell value delivered by preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    /// String, dictionary-coded on import
    String(String),
    /// Integer
    Integer(i64),
    /// Real
    Real(f64),
    /// Decimal as (unscaled, scale)
    Decimal(i128, i32),
    /// Money in minor units
    Money(i64),
    /// Boolean
    Boolean(bool),
    /// Epoch day
    Date(i32),
    /// Day range
    DateRange(DateRange),
}

/// One event row: owning entity plus one optional value per column.
#[derive(Debug, Clone)]
pub struct ImportRow {
    /// Global entity id
    pub entity: u32,
    /// Values in column position order; `None` is an absent cell
    pub values: Vec<Option<RawValue>>,
}

/// Result of importing one batch of rows for a table.
#[derive(Debug)]
pub struct ImportResult {
    /// The import's identity
    pub import: ImportId,
    /// Assembled buckets, ascending by bucket number
    pub buckets: Vec<Bucket>,
    /// Dictionaries grown during this import, keyed by name
    pub dictionaries: Vec<Arc<Dictionary>>,
}

/// Assembles buckets for one table import.
pub struct TableImporter {
    table: Table,
    import: ImportId,
    bucket_size: u32,
}

impl TableImporter {
    /// Importer for `table`, writing buckets of `bucket_size` entity range.
    pub fn new(table: Table, import: ImportId, bucket_size: u32) -> Self {
        Self {
            table,
            import,
            bucket_size,
        }
    }

    /// Group `rows` into buckets and freeze their column stores.
    ///
    /// Rows are sorted by entity (stable, preserving the delivered event
    /// order within each entity), so one entity's events are contiguous in
    /// its bucket.
    pub fn import(&self, mut rows: Vec<ImportRow>) -> Result<ImportResult> {
        for row in &rows {
            if row.values.len() != self.table.columns.len() {
                return Err(Error::import(format!(
                    "row of entity {} has {} values, table {} has {} columns",
                    row.entity,
                    row.values.len(),
                    self.table.name,
                    self.table.columns.len()
                )));
            }
        }
        rows.sort_by_key(|r| r.entity);

        // Shared dictionaries, one per string column, grown across buckets.
        let mut dictionaries: Vec<Option<Dictionary>> = self
            .table
            .columns
            .iter()
            .map(|c| {
                (c.kind == ColumnKind::String)
                    .then(|| Dictionary::new(format!("{}.{}", self.table.name, c.name)))
            })
            .collect();

        let mut buckets = Vec::new();
        let mut start = 0usize;
        while start < rows.len() {
            let bucket_number = rows[start].entity / self.bucket_size;
            let mut end = start;
            while end < rows.len() && rows[end].entity / self.bucket_size == bucket_number {
                end += 1;
            }
            buckets.push(self.build_bucket(bucket_number, &rows[start..end], &mut dictionaries)?);
            start = end;
        }

        let dictionaries = dictionaries.into_iter().flatten().map(Arc::new).collect();
        let mut result = ImportResult {
            import: self.import,
            buckets,
            dictionaries,
        };
        // Stores were frozen before the dictionaries stopped growing, so the
        // shared instances are injected once at the end.
        let dicts: std::collections::HashMap<String, Arc<Dictionary>> = result
            .dictionaries
            .iter()
            .map(|d| (d.name().to_string(), d.clone()))
            .collect();
        for bucket in &mut result.buckets {
            bucket.attach_dictionaries(&dicts);
        }
        Ok(result)
    }

    fn build_bucket(
        &self,
        bucket_number: u32,
        rows: &[ImportRow],
        dictionaries: &mut [Option<Dictionary>],
    ) -> Result<Bucket> {
        let number_of_events = rows.len();
        let mut entity_start = BTreeMap::new();
        let mut entity_end = BTreeMap::new();
        for (event, row) in rows.iter().enumerate() {
            entity_start.entry(row.entity).or_insert(event as u32);
            entity_end.insert(row.entity, event as u32 + 1);
        }

        let mut stores = Vec::with_capacity(self.table.columns.len());
        for (position, column) in self.table.columns.iter().enumerate() {
            let cells: Vec<Option<&RawValue>> =
                rows.iter().map(|r| r.values[position].as_ref()).collect();
            stores.push(freeze_column(
                column.kind,
                &cells,
                dictionaries[position].as_mut(),
            )?);
        }

        let bucket = Bucket::new(
            BucketId {
                import: self.import,
                bucket: bucket_number,
            },
            self.bucket_size,
            number_of_events,
            stores,
            entity_start,
            entity_end,
        );
        bucket.validate()?;
        Ok(bucket)
    }
}

/// Freeze one column's cells into the narrowest fitting store.
fn freeze_column(
    kind: ColumnKind,
    cells: &[Option<&RawValue>],
    dictionary: Option<&mut Dictionary>,
) -> Result<ColumnStore> {
    let mut presence = Presence::with_len(cells.len());
    match kind {
        ColumnKind::String => {
            let dictionary =
                dictionary.ok_or_else(|| Error::import("string column without dictionary"))?;
            let mut codes = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::String(s)) => {
                        presence.set(i);
                        codes.push(Some(dictionary.put(s.as_bytes())));
                    }
                    None => codes.push(None),
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            // A placeholder snapshot; the shared instance replaces it after
            // the import's dictionaries stop growing.
            let snapshot = Arc::new(dictionary.clone());
            Ok(ColumnStore::String(StringStore::from_codes(
                &codes, snapshot,
            )))
        }
        ColumnKind::Integer => {
            let mut values = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::Integer(v)) => {
                        presence.set(i);
                        values.push(*v);
                    }
                    None => values.push(0),
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            Ok(ColumnStore::Integer {
                data: IntegerData::from_values(&values),
                presence,
            })
        }
        ColumnKind::Real => {
            let mut values = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::Real(v)) => {
                        presence.set(i);
                        values.push(*v);
                    }
                    None => values.push(0.0),
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            // Demote to f32 only when every value round-trips without loss.
            let lossless = values.iter().all(|&v| f64::from(v as f32) == v);
            let data = if lossless {
                RealData::F32(values.iter().map(|&v| v as f32).collect())
            } else {
                RealData::F64(values)
            };
            Ok(ColumnStore::Real { data, presence })
        }
        ColumnKind::Decimal => {
            let mut raw = Vec::with_capacity(cells.len());
            let mut max_scale = 0i32;
            for cell in cells {
                if let Some(RawValue::Decimal(unscaled, scale)) = cell {
                    max_scale = max_scale.max(*scale);
                    raw.push(Some((*unscaled, *scale)));
                } else if cell.is_none() {
                    raw.push(None);
                } else if let Some(other) = cell {
                    return Err(type_error(kind, other));
                }
            }
            let mut unscaled = Vec::with_capacity(cells.len());
            for (i, cell) in raw.iter().enumerate() {
                match cell {
                    Some((value, scale)) => {
                        presence.set(i);
                        let rescaled = value
                            .checked_mul(10i128.pow((max_scale - scale) as u32))
                            .ok_or_else(|| Error::import("decimal overflow on rescale"))?;
                        unscaled.push(rescaled);
                    }
                    None => unscaled.push(0),
                }
            }
            // Promote to a plain integer store when the unscaled magnitude
            // fits signed-64.
            let fits_i64 = unscaled
                .iter()
                .all(|&v| v >= i128::from(i64::MIN) && v <= i128::from(i64::MAX));
            let data = if fits_i64 {
                let narrow: Vec<i64> = unscaled.iter().map(|&v| v as i64).collect();
                DecimalData::Scaled(IntegerData::from_values(&narrow))
            } else {
                DecimalData::Big(unscaled)
            };
            Ok(ColumnStore::Decimal {
                scale: max_scale,
                data,
                presence,
            })
        }
        ColumnKind::Money => {
            let mut values = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::Money(v)) => {
                        presence.set(i);
                        values.push(*v);
                    }
                    None => values.push(0),
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            Ok(ColumnStore::Money {
                data: IntegerData::from_values(&values),
                presence,
            })
        }
        ColumnKind::Boolean => {
            let mut values = Presence::with_len(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::Boolean(v)) => {
                        presence.set(i);
                        if *v {
                            values.set(i);
                        }
                    }
                    None => {}
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            Ok(ColumnStore::Boolean { values, presence })
        }
        ColumnKind::Date => {
            let mut days = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::Date(v)) => {
                        presence.set(i);
                        days.push(*v);
                    }
                    None => days.push(0),
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            Ok(ColumnStore::Date { days, presence })
        }
        ColumnKind::DateRange => {
            let mut mins = Vec::with_capacity(cells.len());
            let mut maxs = Vec::with_capacity(cells.len());
            for (i, cell) in cells.iter().enumerate() {
                match cell {
                    Some(RawValue::DateRange(range)) => {
                        presence.set(i);
                        mins.push(range.min());
                        maxs.push(range.max());
                    }
                    None => {
                        mins.push(0);
                        maxs.push(0);
                    }
                    Some(other) => return Err(type_error(kind, other)),
                }
            }
            Ok(ColumnStore::DateRange {
                payload: DateRangePayload::Ranges { mins, maxs },
                presence,
            })
        }
    }
}

fn type_error(expected: ColumnKind, actual: &RawValue) -> Error {
    Error::import(format!("expected {expected} cell, got {actual:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;

    fn table() -> Table {
        Table {
            name: "visits".into(),
            index: 0,
            columns: vec![
                Column {
                    name: "code".into(),
                    position: 0,
                    kind: ColumnKind::String,
                },
                Column {
                    name: "amount".into(),
                    position: 1,
                    kind: ColumnKind::Integer,
                },
            ],
        }
    }

    fn row(entity: u32, code: Option<&str>, amount: Option<i64>) -> ImportRow {
        ImportRow {
            entity,
            values: vec![
                code.map(|c| RawValue::String(c.into())),
                amount.map(RawValue::Integer),
            ],
        }
    }

    #[test]
    fn test_import_partitions_by_bucket() {
        let importer = TableImporter::new(table(), ImportId { table: 0, seq: 1 }, 10);
        let result = importer
            .import(vec![
                row(3, Some("A"), Some(1)),
                row(25, Some("B"), None),
                row(3, Some("A"), Some(2)),
                row(11, None, Some(9)),
            ])
            .unwrap();

        assert_eq!(result.buckets.len(), 3);
        assert_eq!(result.buckets[0].bucket(), 0);
        assert_eq!(result.buckets[1].bucket(), 1);
        assert_eq!(result.buckets[2].bucket(), 2);

        let first = &result.buckets[0];
        assert_eq!(first.number_of_events(), 2);
        assert_eq!(first.entity_start(3), Some(0));
        assert_eq!(first.entity_end(3), Some(2));
    }

    #[test]
    fn test_entity_events_stay_in_delivered_order() {
        let importer = TableImporter::new(table(), ImportId { table: 0, seq: 1 }, 100);
        let result = importer
            .import(vec![
                row(1, None, Some(10)),
                row(2, None, Some(99)),
                row(1, None, Some(20)),
            ])
            .unwrap();

        let bucket = &result.buckets[0];
        assert_eq!(bucket.integer(0, 1), Some(10));
        assert_eq!(bucket.integer(1, 1), Some(20));
        assert_eq!(bucket.integer(2, 1), Some(99));
    }

    #[test]
    fn test_string_column_is_dictionary_coded() {
        let importer = TableImporter::new(table(), ImportId { table: 0, seq: 1 }, 100);
        let result = importer
            .import(vec![
                row(1, Some("A01"), None),
                row(1, Some("B20"), None),
                row(2, Some("A01"), None),
            ])
            .unwrap();

        assert_eq!(result.dictionaries.len(), 1);
        let dict = &result.dictionaries[0];
        assert_eq!(dict.len(), 2);

        let bucket = &result.buckets[0];
        assert_eq!(bucket.string(0, 0), bucket.string(2, 0));
        assert_ne!(bucket.string(0, 0), bucket.string(1, 0));
    }

    #[test]
    fn test_rejects_arity_mismatch() {
        let importer = TableImporter::new(table(), ImportId { table: 0, seq: 1 }, 100);
        let bad = ImportRow {
            entity: 1,
            values: vec![None],
        };
        assert!(importer.import(vec![bad]).is_err());
    }

    #[test]
    fn test_decimal_promotion() {
        let cells = [
            Some(RawValue::Decimal(1234, 2)),
            None,
            Some(RawValue::Decimal(5, 1)),
        ];
        let refs: Vec<Option<&RawValue>> = cells.iter().map(|c| c.as_ref()).collect();
        let store = freeze_column(ColumnKind::Decimal, &refs, None).unwrap();
        match &store {
            ColumnStore::Decimal {
                scale,
                data: DecimalData::Scaled(_),
                ..
            } => assert_eq!(*scale, 2),
            other => panic!("expected scaled decimal store, got {other:?}"),
        }
        assert_eq!(store.decimal(0), Some((1234, 2)));
        assert_eq!(store.decimal(2), Some((50, 2)));
        assert_eq!(store.decimal(1), None);
    }

    #[test]
    fn test_real_precision_selection() {
        let exact = [Some(RawValue::Real(1.5)), Some(RawValue::Real(-2.25))];
        let refs: Vec<Option<&RawValue>> = exact.iter().map(|c| c.as_ref()).collect();
        let store = freeze_column(ColumnKind::Real, &refs, None).unwrap();
        assert!(matches!(
            store,
            ColumnStore::Real {
                data: RealData::F32(_),
                ..
            }
        ));

        let lossy = [Some(RawValue::Real(0.1))];
        let refs: Vec<Option<&RawValue>> = lossy.iter().map(|c| c.as_ref()).collect();
        let store = freeze_column(ColumnKind::Real, &refs, None).unwrap();
        assert!(matches!(
            store,
            ColumnStore::Real {
                data: RealData::F64(_),
                ..
            }
        ));
        assert_eq!(store.real(0), Some(0.1));
    }
}
