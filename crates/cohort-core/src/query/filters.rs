//! Filter nodes: per-entity inclusion conditions evaluated inside a
//! concept node.
//!
//! Two families exist, mirroring how they consume events: aggregation-result
//! filters accumulate like an aggregator and test the final value against a
//! range, event filters latch as soon as a single event satisfies them.

use crate::dictionary::DictId;
use crate::events::Bucket;
use crate::query::aggregators::{Aggregator, SumState};
use crate::query::results::ResultValue;
use crate::schema::ColumnIndex;
use std::collections::HashSet;

/// Inclusive numeric range with optional bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumberRange {
    /// Lower bound, `None` for unbounded
    pub min: Option<i64>,
    /// Upper bound, `None` for unbounded
    pub max: Option<i64>,
}

impl NumberRange {
    /// Whether `value` falls inside the range.
    pub fn contains(&self, value: i64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// A filter attached to a concept node.
#[derive(Debug)]
pub enum FilterNode {
    /// Event count (over a column's present values) must fall in a range
    CountRange {
        /// Backing count aggregator
        aggregator: Aggregator,
        /// Accepted range
        range: NumberRange,
    },
    /// Column sum must fall in a range
    SumRange {
        /// Backing sum aggregator
        aggregator: Aggregator,
        /// Accepted range
        range: NumberRange,
    },
    /// Some event's string value is one of the given values
    MultiSelect {
        /// Tested column
        column: ColumnIndex,
        /// Accepted raw values
        values: Vec<String>,
        /// Dictionary ids of `values` in the current bucket's dictionary
        resolved: HashSet<DictId>,
        /// Latched once any event matched
        hit: bool,
    },
}

impl FilterNode {
    /// Count filter over `column` (all events when `None`).
    pub fn count_range(column: Option<ColumnIndex>, range: NumberRange) -> Self {
        FilterNode::CountRange {
            aggregator: Aggregator::count(column),
            range,
        }
    }

    /// Sum filter over an integer-like column.
    pub fn sum_range(column: ColumnIndex, state: SumState, range: NumberRange) -> Self {
        FilterNode::SumRange {
            aggregator: Aggregator::sum(column, state),
            range,
        }
    }

    /// Multi-select filter over a string column.
    pub fn multi_select(column: ColumnIndex, values: Vec<String>) -> Self {
        FilterNode::MultiSelect {
            column,
            values,
            resolved: HashSet::new(),
            hit: false,
        }
    }

    /// Reset per-entity state.
    pub fn init(&mut self) {
        match self {
            FilterNode::CountRange { aggregator, .. } | FilterNode::SumRange { aggregator, .. } => {
                aggregator.init()
            }
            FilterNode::MultiSelect { hit, .. } => *hit = false,
        }
    }

    /// Latch bucket context: multi-select filters resolve their values
    /// against the bucket's dictionary here, once per bucket.
    pub fn next_block(&mut self, bucket: &Bucket) {
        if let FilterNode::MultiSelect {
            column,
            values,
            resolved,
            ..
        } = self
        {
            resolved.clear();
            let store = bucket.stores().get(*column as usize);
            let dictionary = match store {
                Some(crate::events::ColumnStore::String(s)) => s.dictionary(),
                _ => None,
            };
            if let Some(dictionary) = dictionary {
                for value in values.iter() {
                    if let Some(id) = dictionary.id(value.as_bytes()) {
                        resolved.insert(id);
                    }
                }
            }
        }
    }

    /// Consume one accepted event.
    pub fn accept_event(&mut self, bucket: &Bucket, event: usize) {
        match self {
            FilterNode::CountRange { aggregator, .. } | FilterNode::SumRange { aggregator, .. } => {
                aggregator.accept_event(bucket, event)
            }
            FilterNode::MultiSelect {
                column,
                resolved,
                hit,
                ..
            } => {
                if *hit {
                    return;
                }
                if let Some(code) = bucket.string(event, *column) {
                    if resolved.contains(&code) {
                        *hit = true;
                    }
                }
            }
        }
    }

    /// Final verdict for the entity.
    pub fn is_contained(&self) -> bool {
        match self {
            FilterNode::CountRange { aggregator, range } => {
                let count = match aggregator.result() {
                    ResultValue::Integer(count) => count,
                    _ => 0,
                };
                range.contains(count)
            }
            FilterNode::SumRange { aggregator, range } => match aggregator.result() {
                ResultValue::Integer(sum) | ResultValue::Money(sum) => range.contains(sum),
                ResultValue::Real(sum) => {
                    range.min.map_or(true, |min| sum >= min as f64)
                        && range.max.map_or(true, |max| sum <= max as f64)
                }
                ResultValue::Decimal(unscaled, scale) => {
                    let value = unscaled as f64 / 10f64.powi(scale);
                    range.min.map_or(true, |min| value >= min as f64)
                        && range.max.map_or(true, |max| value <= max as f64)
                }
                _ => range.contains(0),
            },
            FilterNode::MultiSelect { hit, .. } => *hit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dictionary::Dictionary;
    use crate::events::stores::{ColumnStore, StringStore};
    use crate::schema::{BucketId, ImportId};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn string_bucket(values: &[Option<&str>]) -> Bucket {
        let mut dict = Dictionary::new("t.code");
        let codes: Vec<Option<u32>> = values
            .iter()
            .map(|v| v.map(|v| dict.put(v.as_bytes())))
            .collect();
        let store = StringStore::from_codes(&codes, Arc::new(dict));
        Bucket::new(
            BucketId {
                import: ImportId { table: 0, seq: 0 },
                bucket: 0,
            },
            100,
            values.len(),
            vec![ColumnStore::String(store)],
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_number_range() {
        let range = NumberRange {
            min: Some(1),
            max: Some(3),
        };
        assert!(!range.contains(0));
        assert!(range.contains(1));
        assert!(range.contains(3));
        assert!(!range.contains(4));

        let open = NumberRange {
            min: Some(2),
            max: None,
        };
        assert!(open.contains(i64::MAX));
    }

    #[test]
    fn test_count_range_filter() {
        let bucket = string_bucket(&[Some("A"), Some("B"), None]);
        let mut filter = FilterNode::count_range(
            Some(0),
            NumberRange {
                min: Some(2),
                max: None,
            },
        );
        filter.init();
        filter.next_block(&bucket);
        for event in 0..3 {
            filter.accept_event(&bucket, event);
        }
        assert!(filter.is_contained());
    }

    #[test]
    fn test_count_range_rejects_below_min() {
        let bucket = string_bucket(&[Some("A"), None]);
        let mut filter = FilterNode::count_range(
            Some(0),
            NumberRange {
                min: Some(2),
                max: None,
            },
        );
        filter.init();
        filter.next_block(&bucket);
        for event in 0..2 {
            filter.accept_event(&bucket, event);
        }
        assert!(!filter.is_contained());
    }

    #[test]
    fn test_multi_select_resolves_per_bucket() {
        let bucket = string_bucket(&[Some("A"), Some("B")]);
        let mut filter = FilterNode::multi_select(0, vec!["B".into(), "Z".into()]);
        filter.init();
        filter.next_block(&bucket);
        filter.accept_event(&bucket, 0);
        assert!(!filter.is_contained());
        filter.accept_event(&bucket, 1);
        assert!(filter.is_contained());
    }

    #[test]
    fn test_multi_select_unknown_values_never_match() {
        let bucket = string_bucket(&[Some("A")]);
        let mut filter = FilterNode::multi_select(0, vec!["Q".into()]);
        filter.init();
        filter.next_block(&bucket);
        filter.accept_event(&bucket, 0);
        assert!(!filter.is_contained());
    }
}
