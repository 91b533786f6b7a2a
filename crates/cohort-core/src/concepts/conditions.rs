//! Match conditions attached to concept-tree nodes and connectors.

use crate::events::Bucket;
use crate::schema::Column;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;

/// Lazily materialized row of one event, keyed by column name.
///
/// Row conditions rarely fire; the map is only computed on first access and
/// reused for every condition evaluated against the same event.
pub struct LazyRow<'a> {
    bucket: &'a Bucket,
    columns: &'a [Column],
    event: usize,
    cached: RefCell<Option<HashMap<String, String>>>,
}

impl<'a> LazyRow<'a> {
    /// Row view for `event` of `bucket`.
    pub fn new(bucket: &'a Bucket, columns: &'a [Column], event: usize) -> Self {
        Self {
            bucket,
            columns,
            event,
            cached: RefCell::new(None),
        }
    }

    /// Value of `column` in display form, `None` when absent.
    pub fn value(&self, column: &str) -> Option<String> {
        let mut cached = self.cached.borrow_mut();
        let row = cached
            .get_or_insert_with(|| self.bucket.calculate_row(self.event, self.columns));
        row.get(column).cloned()
    }
}

/// Node or connector match condition over a decoded string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Condition {
    /// Value starts with any of the given prefixes
    Prefix {
        /// Accepted prefixes
        prefixes: Vec<String>,
    },
    /// Value is one of the given strings
    Equal {
        /// Accepted values
        values: Vec<String>,
    },
    /// Value falls lexicographically between two prefixes (inclusive)
    PrefixRange {
        /// Lower prefix bound
        min: String,
        /// Upper prefix bound
        max: String,
    },
    /// Another column of the same row is one of the given strings
    ColumnEqual {
        /// Tested column name
        column: String,
        /// Accepted values
        values: Vec<String>,
    },
    /// All sub-conditions hold
    And(Vec<Condition>),
    /// Any sub-condition holds
    Or(Vec<Condition>),
    /// The sub-condition does not hold
    Not(Box<Condition>),
}

impl Condition {
    /// Whether the condition accepts `value` for the row behind `row`.
    pub fn matches(&self, value: &str, row: &LazyRow<'_>) -> bool {
        match self {
            Condition::Prefix { prefixes } => prefixes.iter().any(|p| value.starts_with(p.as_str())),
            Condition::Equal { values } => values.iter().any(|v| v == value),
            Condition::PrefixRange { min, max } => {
                let lower = value.get(..min.len()).unwrap_or(value);
                let upper = value.get(..max.len()).unwrap_or(value);
                lower >= min.as_str() && upper <= max.as_str()
            }
            Condition::ColumnEqual { column, values } => match row.value(column) {
                Some(actual) => values.iter().any(|v| *v == actual),
                None => false,
            },
            Condition::And(children) => children.iter().all(|c| c.matches(value, row)),
            Condition::Or(children) => children.iter().any(|c| c.matches(value, row)),
            Condition::Not(child) => !child.matches(value, row),
        }
    }

    /// Common prefixes accepted by this condition, used to key the
    /// child-prefix index. `None` when the condition is not prefix-shaped.
    pub fn index_prefixes(&self) -> Option<&[String]> {
        match self {
            Condition::Prefix { prefixes } if !prefixes.is_empty() => Some(prefixes),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::stores::{ColumnStore, IntegerData, Presence};
    use crate::schema::{BucketId, ColumnKind, ImportId};
    use std::collections::BTreeMap;

    fn row_fixture() -> (Bucket, Vec<Column>) {
        let mut presence = Presence::with_len(1);
        presence.set(0);
        let store = ColumnStore::Integer {
            data: IntegerData::from_values(&[7]),
            presence,
        };
        let bucket = Bucket::new(
            BucketId {
                import: ImportId { table: 0, seq: 0 },
                bucket: 0,
            },
            10,
            1,
            vec![store],
            BTreeMap::new(),
            BTreeMap::new(),
        );
        let columns = vec![Column {
            name: "kind".into(),
            position: 0,
            kind: ColumnKind::Integer,
        }];
        (bucket, columns)
    }

    #[test]
    fn test_prefix_condition() {
        let (bucket, columns) = row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        let cond = Condition::Prefix {
            prefixes: vec!["A0".into(), "B".into()],
        };
        assert!(cond.matches("A01", &row));
        assert!(cond.matches("B99", &row));
        assert!(!cond.matches("C00", &row));
    }

    #[test]
    fn test_equal_condition() {
        let (bucket, columns) = row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        let cond = Condition::Equal {
            values: vec!["X".into()],
        };
        assert!(cond.matches("X", &row));
        assert!(!cond.matches("X1", &row));
    }

    #[test]
    fn test_column_equal_reads_row() {
        let (bucket, columns) = row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        let cond = Condition::ColumnEqual {
            column: "kind".into(),
            values: vec!["7".into()],
        };
        assert!(cond.matches("anything", &row));

        let miss = Condition::ColumnEqual {
            column: "kind".into(),
            values: vec!["8".into()],
        };
        assert!(!miss.matches("anything", &row));
    }

    #[test]
    fn test_grouped_conditions() {
        let (bucket, columns) = row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        let cond = Condition::And(vec![
            Condition::Prefix {
                prefixes: vec!["A".into()],
            },
            Condition::Not(Box::new(Condition::Equal {
                values: vec!["A00".into()],
            })),
        ]);
        assert!(cond.matches("A01", &row));
        assert!(!cond.matches("A00", &row));
    }
}
