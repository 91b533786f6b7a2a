//! Event aggregators.
//!
//! An aggregator accumulates over `accept_event` calls for one entity and
//! produces a single [`ResultValue`]. Instances live inside exactly one plan
//! evaluation; they are never shared across entities or threads.

use crate::common::{DateRange, DateSet};
use crate::events::{Bucket, StoreValue};
use crate::query::results::ResultValue;
use crate::schema::ColumnIndex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

/// Sum accumulator variants, picked by the aggregated column's kind.
#[derive(Debug, Clone, Copy)]
pub enum SumState {
    /// Integer columns
    Integer(i64),
    /// Real columns
    Real(f64),
    /// Decimal columns, `(unscaled, scale)`
    Decimal(i128, i32),
    /// Money columns
    Money(i64),
}

/// All aggregator kinds understood by the plan executor.
#[derive(Debug)]
pub enum Aggregator {
    /// Count events carrying a value in `column`, or all events when `None`
    Count {
        /// Counted column; `None` counts every accepted event
        column: Option<ColumnIndex>,
        /// Events counted so far
        count: u64,
    },
    /// Sum the values of a column
    Sum {
        /// Summed column
        column: ColumnIndex,
        /// Running sum
        state: SumState,
        /// Whether any value contributed
        any: bool,
    },
    /// Value of the event with the earliest validity date
    First {
        /// Sampled column
        column: ColumnIndex,
        /// Best (date, value) so far; earlier date wins, first event on ties
        best: Option<(i32, StoreValue)>,
        /// Validity-date column of the current table
        validity: Option<ColumnIndex>,
    },
    /// Value of the event with the latest validity date
    Last {
        /// Sampled column
        column: ColumnIndex,
        /// Best (date, value) so far; later date wins, last event on ties
        best: Option<(i32, StoreValue)>,
        /// Validity-date column of the current table
        validity: Option<ColumnIndex>,
    },
    /// Uniformly sampled value over all eligible events
    Random {
        /// Sampled column
        column: ColumnIndex,
        /// Current winner
        value: Option<StoreValue>,
        /// Eligible events seen so far
        seen: u64,
        /// Sampling rng
        rng: StdRng,
    },
    /// Union of event validity dates intersected with the date restriction
    DateUnion {
        /// Accumulated days
        set: DateSet,
        /// Validity-date column of the current table
        validity: Option<ColumnIndex>,
        /// Active date restriction
        restriction: DateSet,
    },
    /// Distinct values of a column, lexicographically ordered
    Distinct {
        /// Collected column
        column: ColumnIndex,
        /// Distinct display values
        seen: BTreeSet<String>,
    },
    /// Whether any event was accepted at all
    Exists {
        /// Latched on the first accepted event
        triggered: bool,
    },
    /// Number of distinct calendar quarters touched by event dates
    CountQuarters {
        /// Date column
        column: ColumnIndex,
        /// Distinct quarter keys
        quarters: BTreeSet<i32>,
    },
    /// Distinct values of a column starting with a prefix
    PrefixText {
        /// Collected column
        column: ColumnIndex,
        /// Required prefix
        prefix: String,
        /// Matching distinct values
        seen: BTreeSet<String>,
    },
}

impl Aggregator {
    /// Reset per-entity state. Called once per evaluation before any event.
    pub fn init(&mut self) {
        match self {
            Aggregator::Count { count, .. } => *count = 0,
            Aggregator::Sum { state, any, .. } => {
                *any = false;
                *state = match state {
                    SumState::Integer(_) => SumState::Integer(0),
                    SumState::Real(_) => SumState::Real(0.0),
                    SumState::Decimal(_, scale) => SumState::Decimal(0, *scale),
                    SumState::Money(_) => SumState::Money(0),
                };
            }
            Aggregator::First { best, .. } | Aggregator::Last { best, .. } => *best = None,
            Aggregator::Random { value, seen, .. } => {
                *value = None;
                *seen = 0;
            }
            Aggregator::DateUnion { set, .. } => *set = DateSet::new(),
            Aggregator::Distinct { seen, .. } => seen.clear(),
            Aggregator::Exists { triggered } => *triggered = false,
            Aggregator::CountQuarters { quarters, .. } => quarters.clear(),
            Aggregator::PrefixText { seen, .. } => seen.clear(),
        }
    }

    /// Latch the table context: the active validity-date column and the
    /// date restriction in force.
    pub fn next_table(&mut self, validity_column: Option<ColumnIndex>, date_restriction: &DateSet) {
        match self {
            Aggregator::First { validity, .. } | Aggregator::Last { validity, .. } => {
                *validity = validity_column;
            }
            Aggregator::DateUnion {
                validity,
                restriction,
                ..
            } => {
                *validity = validity_column;
                *restriction = date_restriction.clone();
            }
            _ => {}
        }
    }

    /// Accumulate one accepted event.
    pub fn accept_event(&mut self, bucket: &Bucket, event: usize) {
        match self {
            Aggregator::Count { column, count } => {
                let counts = match column {
                    Some(column) => bucket.has(event, *column),
                    None => true,
                };
                if counts {
                    *count += 1;
                }
            }
            Aggregator::Sum { column, state, any } => {
                if !bucket.has(event, *column) {
                    return;
                }
                match state {
                    SumState::Integer(sum) => {
                        if let Some(v) = bucket.integer(event, *column) {
                            *sum += v;
                            *any = true;
                        }
                    }
                    SumState::Real(sum) => {
                        if let Some(v) = bucket.real(event, *column) {
                            *sum += v;
                            *any = true;
                        }
                    }
                    SumState::Decimal(sum, scale) => {
                        if let Some((unscaled, value_scale)) = bucket.decimal(event, *column) {
                            // Stores of one column share a scale; align
                            // defensively anyway.
                            if value_scale == *scale {
                                *sum += unscaled;
                            } else if value_scale < *scale {
                                *sum += unscaled * 10i128.pow((*scale - value_scale) as u32);
                            } else {
                                *sum = *sum * 10i128.pow((value_scale - *scale) as u32) + unscaled;
                                *scale = value_scale;
                            }
                            *any = true;
                        }
                    }
                    SumState::Money(sum) => {
                        if let Some(v) = bucket.money(event, *column) {
                            *sum += v;
                            *any = true;
                        }
                    }
                }
            }
            Aggregator::First {
                column,
                best,
                validity,
            } => {
                let Some(value) = bucket.value(event, *column) else {
                    return;
                };
                let date = event_date(bucket, event, *validity);
                match best {
                    Some((best_date, _)) if *best_date <= date => {}
                    _ => *best = Some((date, value)),
                }
            }
            Aggregator::Last {
                column,
                best,
                validity,
            } => {
                let Some(value) = bucket.value(event, *column) else {
                    return;
                };
                let date = event_date(bucket, event, *validity);
                match best {
                    Some((best_date, _)) if *best_date > date => {}
                    _ => *best = Some((date, value)),
                }
            }
            Aggregator::Random {
                column,
                value,
                seen,
                rng,
            } => {
                let Some(candidate) = bucket.value(event, *column) else {
                    return;
                };
                // Reservoir of one: replace the winner with probability 1/n
                // on the n-th eligible event, so every event ends up equally
                // likely without knowing the total count.
                *seen += 1;
                if rng.gen_range(0..*seen) == 0 {
                    *value = Some(candidate);
                }
            }
            Aggregator::DateUnion {
                set,
                validity,
                restriction,
            } => {
                if let Some(column) = validity {
                    if let Some(range) = bucket.date_range(event, *column) {
                        let mut add = restriction.clone();
                        add.retain_all(&DateSet::from_range(range));
                        set.add_all(&add);
                        return;
                    }
                }
                // No event date: a closed restriction stands in for it.
                if restriction.count_days().is_some() {
                    set.add_all(restriction);
                }
            }
            Aggregator::Distinct { column, seen } => {
                if let Some(value) = bucket.value(event, *column) {
                    seen.insert(value.to_string());
                }
            }
            Aggregator::Exists { triggered } => *triggered = true,
            Aggregator::CountQuarters { column, quarters } => {
                if let Some(range) = bucket.date_range(event, *column) {
                    if !range.has_open_min() {
                        quarters.insert(DateRange::quarter_of(range.min()));
                    }
                    if !range.has_open_max() {
                        quarters.insert(DateRange::quarter_of(range.max()));
                    }
                }
            }
            Aggregator::PrefixText {
                column,
                prefix,
                seen,
            } => {
                if let Some(value) = bucket.value(event, *column) {
                    let text = value.to_string();
                    if text.starts_with(prefix.as_str()) {
                        seen.insert(text);
                    }
                }
            }
        }
    }

    /// Final output after all events of the entity.
    pub fn result(&self) -> ResultValue {
        match self {
            Aggregator::Count { count, .. } => {
                if *count > 0 {
                    ResultValue::Integer(*count as i64)
                } else {
                    ResultValue::Null
                }
            }
            Aggregator::Sum { state, any, .. } => {
                if !*any {
                    return ResultValue::Null;
                }
                match state {
                    SumState::Integer(sum) => ResultValue::Integer(*sum),
                    SumState::Real(sum) => ResultValue::Real(*sum),
                    SumState::Decimal(sum, scale) => ResultValue::Decimal(*sum, *scale),
                    SumState::Money(sum) => ResultValue::Money(*sum),
                }
            }
            Aggregator::First { best, .. } | Aggregator::Last { best, .. } => best
                .as_ref()
                .map(|(_, value)| store_value_to_result(value))
                .unwrap_or(ResultValue::Null),
            Aggregator::Random { value, .. } => value
                .as_ref()
                .map(store_value_to_result)
                .unwrap_or(ResultValue::Null),
            Aggregator::DateUnion { set, .. } => ResultValue::DateSet(set.clone()),
            Aggregator::Distinct { seen, .. } => ResultValue::List(
                seen.iter()
                    .map(|v| ResultValue::String(v.clone()))
                    .collect(),
            ),
            Aggregator::Exists { triggered } => ResultValue::Boolean(*triggered),
            Aggregator::CountQuarters { quarters, .. } => {
                if quarters.is_empty() {
                    ResultValue::Null
                } else {
                    ResultValue::Integer(quarters.len() as i64)
                }
            }
            Aggregator::PrefixText { seen, .. } => ResultValue::List(
                seen.iter()
                    .map(|v| ResultValue::String(v.clone()))
                    .collect(),
            ),
        }
    }

    /// Count aggregated over `column`, or over all events when `None`.
    pub fn count(column: Option<ColumnIndex>) -> Self {
        Aggregator::Count { column, count: 0 }
    }

    /// Sum over a column of the given kind state.
    pub fn sum(column: ColumnIndex, state: SumState) -> Self {
        Aggregator::Sum {
            column,
            state,
            any: false,
        }
    }

    /// Reservoir-sampled random value with an entropy-seeded rng.
    pub fn random(column: ColumnIndex) -> Self {
        Aggregator::Random {
            column,
            value: None,
            seen: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Reservoir-sampled random value with a fixed seed, for reproducible
    /// sampling tests.
    pub fn random_seeded(column: ColumnIndex, seed: u64) -> Self {
        Aggregator::Random {
            column,
            value: None,
            seen: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Special date union.
    pub fn date_union() -> Self {
        Aggregator::DateUnion {
            set: DateSet::new(),
            validity: None,
            restriction: DateSet::all(),
        }
    }
}

/// Validity date of an event: the range minimum of the validity column, or
/// `i32::MIN` so dateless events sort before any dated one.
fn event_date(bucket: &Bucket, event: usize, validity: Option<ColumnIndex>) -> i32 {
    validity
        .and_then(|column| bucket.date_range(event, column))
        .map(|range| range.min())
        .unwrap_or(i32::MIN)
}

fn store_value_to_result(value: &StoreValue) -> ResultValue {
    match value {
        StoreValue::String(bytes) => {
            ResultValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
        StoreValue::Integer(v) => ResultValue::Integer(*v),
        StoreValue::Real(v) => ResultValue::Real(*v),
        StoreValue::Decimal(unscaled, scale) => ResultValue::Decimal(*unscaled, *scale),
        StoreValue::Money(v) => ResultValue::Money(*v),
        StoreValue::Boolean(v) => ResultValue::Boolean(*v),
        StoreValue::Date(v) => ResultValue::Date(*v),
        StoreValue::DateRange(range) => {
            ResultValue::DateSet(DateSet::from_range(*range))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::stores::{ColumnStore, IntegerData, Presence};
    use crate::schema::{BucketId, ImportId};
    use std::collections::BTreeMap;
    use std::collections::HashMap;

    fn bucket_with_integers(values: &[Option<i64>]) -> Bucket {
        let mut presence = Presence::with_len(values.len());
        let mut dense = Vec::new();
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => {
                    presence.set(i);
                    dense.push(*v);
                }
                None => dense.push(0),
            }
        }
        Bucket::new(
            BucketId {
                import: ImportId { table: 0, seq: 0 },
                bucket: 0,
            },
            100,
            values.len(),
            vec![ColumnStore::Integer {
                data: IntegerData::from_values(&dense),
                presence,
            }],
            BTreeMap::new(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_count_skips_absent_values() {
        let bucket = bucket_with_integers(&[Some(1), None, Some(3)]);
        let mut agg = Aggregator::count(Some(0));
        agg.init();
        for event in 0..3 {
            agg.accept_event(&bucket, event);
        }
        assert_eq!(agg.result(), ResultValue::Integer(2));
    }

    #[test]
    fn test_count_zero_is_null() {
        let bucket = bucket_with_integers(&[None, None]);
        let mut agg = Aggregator::count(Some(0));
        agg.init();
        for event in 0..2 {
            agg.accept_event(&bucket, event);
        }
        assert_eq!(agg.result(), ResultValue::Null);
    }

    #[test]
    fn test_sum_integer() {
        let bucket = bucket_with_integers(&[Some(5), None, Some(-2)]);
        let mut agg = Aggregator::sum(0, SumState::Integer(0));
        agg.init();
        for event in 0..3 {
            agg.accept_event(&bucket, event);
        }
        assert_eq!(agg.result(), ResultValue::Integer(3));
    }

    #[test]
    fn test_sum_without_values_is_null() {
        let bucket = bucket_with_integers(&[None]);
        let mut agg = Aggregator::sum(0, SumState::Integer(0));
        agg.init();
        agg.accept_event(&bucket, 0);
        assert_eq!(agg.result(), ResultValue::Null);
    }

    #[test]
    fn test_random_reservoir_uniformity() {
        // Fixed sequence of 4 eligible events; over many seeds every event
        // must win about equally often.
        let bucket = bucket_with_integers(&[Some(0), Some(1), Some(2), Some(3)]);
        let runs = 4000usize;
        let mut wins: HashMap<i64, usize> = HashMap::new();
        for seed in 0..runs {
            let mut agg = Aggregator::random_seeded(0, seed as u64);
            agg.init();
            for event in 0..4 {
                agg.accept_event(&bucket, event);
            }
            match agg.result() {
                ResultValue::Integer(v) => *wins.entry(v).or_default() += 1,
                other => panic!("unexpected result {other:?}"),
            }
        }
        let expected = runs as f64 / 4.0;
        for value in 0..4i64 {
            let observed = *wins.get(&value).unwrap_or(&0) as f64;
            let deviation = (observed - expected).abs() / expected;
            assert!(
                deviation < 0.15,
                "event {value} won {observed} of {runs} runs (expected ~{expected})"
            );
        }
    }

    #[test]
    fn test_random_skips_absent_values() {
        let bucket = bucket_with_integers(&[None, Some(7), None]);
        let mut agg = Aggregator::random_seeded(0, 42);
        agg.init();
        for event in 0..3 {
            agg.accept_event(&bucket, event);
        }
        assert_eq!(agg.result(), ResultValue::Integer(7));
    }

    #[test]
    fn test_exists_latches() {
        let bucket = bucket_with_integers(&[Some(1)]);
        let mut agg = Aggregator::Exists { triggered: false };
        agg.init();
        assert_eq!(agg.result(), ResultValue::Boolean(false));
        agg.accept_event(&bucket, 0);
        assert_eq!(agg.result(), ResultValue::Boolean(true));
    }

    #[test]
    fn test_distinct_sorted_output() {
        let bucket = bucket_with_integers(&[Some(3), Some(1), Some(3)]);
        let mut agg = Aggregator::Distinct {
            column: 0,
            seen: BTreeSet::new(),
        };
        agg.init();
        for event in 0..3 {
            agg.accept_event(&bucket, event);
        }
        assert_eq!(
            agg.result(),
            ResultValue::List(vec![
                ResultValue::String("1".into()),
                ResultValue::String("3".into()),
            ])
        );
    }
}
