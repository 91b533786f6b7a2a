//! Typed, presence-tracked columnar stores.
//!
//! One store exists per (bucket, column). Stores are append-free: the import
//! parser collects raw values, picks the narrowest fitting representation and
//! freezes it into one of these types. After that they are strictly
//! read-only, so query-time access needs no locking.
//!
//! Readers must check presence before interpreting a slot; every typed getter
//! returns `None` for absent slots, which is the null-sentinel contract the
//! aggregators rely on.

use crate::common::DateRange;
use crate::dictionary::{DictId, Dictionary};
use crate::schema::{ColumnIndex, ColumnKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Per-slot presence bitmap, one bit per event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    bits: Vec<u8>,
    len: usize,
}

impl Presence {
    /// All-absent bitmap for `len` slots.
    pub fn with_len(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Mark slot `index` present.
    pub fn set(&mut self, index: usize) {
        self.bits[index / 8] |= 1 << (index % 8);
    }

    /// Whether slot `index` is present.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bits[index / 8] >> (index % 8)) & 1 != 0
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Restricted copy containing the named half-open slices, in order.
    pub fn select(&self, starts: &[usize], lengths: &[usize]) -> Presence {
        let total: usize = lengths.iter().sum();
        let mut out = Presence::with_len(total);
        let mut cursor = 0;
        for (&start, &length) in starts.iter().zip(lengths) {
            for offset in 0..length {
                if self.get(start + offset) {
                    out.set(cursor + offset);
                }
            }
            cursor += length;
        }
        out
    }
}

/// Integer payload at the narrowest width fitting the observed value range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntegerData {
    /// Values fit i8
    I8(Vec<i8>),
    /// Values fit i16
    I16(Vec<i16>),
    /// Values fit i32
    I32(Vec<i32>),
    /// Full-width fallback
    I64(Vec<i64>),
}

impl IntegerData {
    /// Widened value at `index`.
    pub fn get(&self, index: usize) -> i64 {
        match self {
            IntegerData::I8(v) => i64::from(v[index]),
            IntegerData::I16(v) => i64::from(v[index]),
            IntegerData::I32(v) => i64::from(v[index]),
            IntegerData::I64(v) => v[index],
        }
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        match self {
            IntegerData::I8(v) => v.len(),
            IntegerData::I16(v) => v.len(),
            IntegerData::I32(v) => v.len(),
            IntegerData::I64(v) => v.len(),
        }
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build from widened values, choosing the narrowest width that fits.
    pub fn from_values(values: &[i64]) -> IntegerData {
        let min = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        if min >= i64::from(i8::MIN) && max <= i64::from(i8::MAX) {
            IntegerData::I8(values.iter().map(|&v| v as i8).collect())
        } else if min >= i64::from(i16::MIN) && max <= i64::from(i16::MAX) {
            IntegerData::I16(values.iter().map(|&v| v as i16).collect())
        } else if min >= i64::from(i32::MIN) && max <= i64::from(i32::MAX) {
            IntegerData::I32(values.iter().map(|&v| v as i32).collect())
        } else {
            IntegerData::I64(values.to_vec())
        }
    }

    fn select(&self, starts: &[usize], lengths: &[usize]) -> IntegerData {
        fn slice<T: Copy>(data: &[T], starts: &[usize], lengths: &[usize]) -> Vec<T> {
            let mut out = Vec::with_capacity(lengths.iter().sum());
            for (&start, &length) in starts.iter().zip(lengths) {
                out.extend_from_slice(&data[start..start + length]);
            }
            out
        }
        match self {
            IntegerData::I8(v) => IntegerData::I8(slice(v, starts, lengths)),
            IntegerData::I16(v) => IntegerData::I16(slice(v, starts, lengths)),
            IntegerData::I32(v) => IntegerData::I32(slice(v, starts, lengths)),
            IntegerData::I64(v) => IntegerData::I64(slice(v, starts, lengths)),
        }
    }
}

/// Dictionary-coded string store.
///
/// The dictionary is dataset-scoped and shared; it is not persisted with the
/// store and gets re-injected after storage load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringStore {
    codes: IntegerData,
    presence: Presence,
    dictionary_name: String,
    #[serde(skip)]
    dictionary: Option<Arc<Dictionary>>,
}

impl StringStore {
    /// Build a frozen store from optional dictionary codes.
    pub fn from_codes(codes: &[Option<DictId>], dictionary: Arc<Dictionary>) -> Self {
        let mut presence = Presence::with_len(codes.len());
        let mut dense = Vec::with_capacity(codes.len());
        for (i, code) in codes.iter().enumerate() {
            match code {
                Some(code) => {
                    presence.set(i);
                    dense.push(i64::from(*code));
                }
                None => dense.push(0),
            }
        }
        Self {
            codes: IntegerData::from_values(&dense),
            presence,
            dictionary_name: dictionary.name().to_string(),
            dictionary: Some(dictionary),
        }
    }

    /// Dictionary code at `event`, `None` if absent.
    pub fn code(&self, event: usize) -> Option<DictId> {
        if !self.presence.get(event) {
            return None;
        }
        Some(self.codes.get(event) as DictId)
    }

    /// Decoded bytes at `event`.
    pub fn decode(&self, event: usize) -> Option<&[u8]> {
        let code = self.code(event)?;
        self.dictionary.as_ref()?.element(code)
    }

    /// Name of the backing dictionary.
    pub fn dictionary_name(&self) -> &str {
        &self.dictionary_name
    }

    /// The backing dictionary, once injected.
    pub fn dictionary(&self) -> Option<&Arc<Dictionary>> {
        self.dictionary.as_ref()
    }

    /// Re-inject the shared dictionary after deserialization.
    pub fn attach_dictionary(&mut self, dictionary: Arc<Dictionary>) {
        debug_assert_eq!(dictionary.name(), self.dictionary_name);
        self.dictionary = Some(dictionary);
    }
}

/// Fixed-scale decimal payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecimalData {
    /// Unscaled values fit signed-64; demoted to an integer store
    Scaled(IntegerData),
    /// Wide fallback for unscaled values beyond signed-64
    Big(Vec<i128>),
}

impl DecimalData {
    fn get(&self, index: usize) -> i128 {
        match self {
            DecimalData::Scaled(data) => i128::from(data.get(index)),
            DecimalData::Big(v) => v[index],
        }
    }

    fn select(&self, starts: &[usize], lengths: &[usize]) -> DecimalData {
        match self {
            DecimalData::Scaled(data) => DecimalData::Scaled(data.select(starts, lengths)),
            DecimalData::Big(v) => {
                let mut out = Vec::with_capacity(lengths.iter().sum());
                for (&start, &length) in starts.iter().zip(lengths) {
                    out.extend_from_slice(&v[start..start + length]);
                }
                DecimalData::Big(out)
            }
        }
    }
}

/// Real payload at the precision the parser measured as lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RealData {
    /// Round-trips through f32 without measured loss
    F32(Vec<f32>),
    /// Full-precision fallback
    F64(Vec<f64>),
}

impl RealData {
    fn get(&self, index: usize) -> f64 {
        match self {
            RealData::F32(v) => f64::from(v[index]),
            RealData::F64(v) => v[index],
        }
    }

    fn select(&self, starts: &[usize], lengths: &[usize]) -> RealData {
        match self {
            RealData::F32(v) => {
                let mut out = Vec::with_capacity(lengths.iter().sum());
                for (&start, &length) in starts.iter().zip(lengths) {
                    out.extend_from_slice(&v[start..start + length]);
                }
                RealData::F32(out)
            }
            RealData::F64(v) => {
                let mut out = Vec::with_capacity(lengths.iter().sum());
                for (&start, &length) in starts.iter().zip(lengths) {
                    out.extend_from_slice(&v[start..start + length]);
                }
                RealData::F64(out)
            }
        }
    }
}

/// Date-range payload: inline min/max pairs, or a reference to two sibling
/// date columns realized at bucket level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DateRangePayload {
    /// Materialized ranges
    Ranges {
        /// Lower bounds per event
        mins: Vec<i32>,
        /// Upper bounds per event
        maxs: Vec<i32>,
    },
    /// Start and end live in two other date columns of the same table;
    /// the bucket combines them on read
    Compound {
        /// Position of the start-date column
        start_column: ColumnIndex,
        /// Position of the end-date column
        end_column: ColumnIndex,
    },
}

/// A frozen, typed, presence-tracked column store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ColumnStore {
    /// Dictionary-coded strings
    String(StringStore),
    /// Integers at observed width
    Integer {
        /// Payload
        data: IntegerData,
        /// Per-slot presence
        presence: Presence,
    },
    /// Reals at observed precision
    Real {
        /// Payload
        data: RealData,
        /// Per-slot presence
        presence: Presence,
    },
    /// Fixed-scale decimals
    Decimal {
        /// Common scale of all values
        scale: i32,
        /// Payload
        data: DecimalData,
        /// Per-slot presence
        presence: Presence,
    },
    /// Currency minor units
    Money {
        /// Payload
        data: IntegerData,
        /// Per-slot presence
        presence: Presence,
    },
    /// Booleans as a bitset
    Boolean {
        /// Value bits
        values: Presence,
        /// Per-slot presence
        presence: Presence,
    },
    /// Epoch days
    Date {
        /// Payload
        days: Vec<i32>,
        /// Per-slot presence
        presence: Presence,
    },
    /// Day ranges
    DateRange {
        /// Payload
        payload: DateRangePayload,
        /// Per-slot presence; for compound payloads presence means
        /// "at least one of the referenced columns is present"
        presence: Presence,
    },
}

/// A single decoded slot value, used for row maps and value aggregators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    /// Decoded string bytes
    String(Vec<u8>),
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

impl std::fmt::Display for StoreValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreValue::String(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            StoreValue::Integer(v) => write!(f, "{v}"),
            StoreValue::Real(v) => write!(f, "{v}"),
            StoreValue::Decimal(unscaled, scale) => write!(f, "{unscaled}e-{scale}"),
            StoreValue::Money(v) => write!(f, "{v}"),
            StoreValue::Boolean(v) => write!(f, "{v}"),
            StoreValue::Date(v) => write!(f, "{v}"),
            StoreValue::DateRange(r) => write!(f, "{r}"),
        }
    }
}

impl ColumnStore {
    /// Kind of this store.
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnStore::String(_) => ColumnKind::String,
            ColumnStore::Integer { .. } => ColumnKind::Integer,
            ColumnStore::Real { .. } => ColumnKind::Real,
            ColumnStore::Decimal { .. } => ColumnKind::Decimal,
            ColumnStore::Money { .. } => ColumnKind::Money,
            ColumnStore::Boolean { .. } => ColumnKind::Boolean,
            ColumnStore::Date { .. } => ColumnKind::Date,
            ColumnStore::DateRange { .. } => ColumnKind::DateRange,
        }
    }

    /// Number of event slots.
    pub fn len(&self) -> usize {
        self.presence().len()
    }

    /// Whether the store has no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `event` carries a defined value.
    pub fn has(&self, event: usize) -> bool {
        self.presence().get(event)
    }

    fn presence(&self) -> &Presence {
        match self {
            ColumnStore::String(s) => &s.presence,
            ColumnStore::Integer { presence, .. }
            | ColumnStore::Real { presence, .. }
            | ColumnStore::Decimal { presence, .. }
            | ColumnStore::Money { presence, .. }
            | ColumnStore::Boolean { presence, .. }
            | ColumnStore::Date { presence, .. }
            | ColumnStore::DateRange { presence, .. } => presence,
        }
    }

    /// Dictionary code at `event` for string stores.
    pub fn string(&self, event: usize) -> Option<DictId> {
        match self {
            ColumnStore::String(s) => s.code(event),
            _ => None,
        }
    }

    /// Integer at `event` for integer stores.
    pub fn integer(&self, event: usize) -> Option<i64> {
        match self {
            ColumnStore::Integer { data, presence } if presence.get(event) => {
                Some(data.get(event))
            }
            _ => None,
        }
    }

    /// Real at `event` for real stores.
    pub fn real(&self, event: usize) -> Option<f64> {
        match self {
            ColumnStore::Real { data, presence } if presence.get(event) => Some(data.get(event)),
            _ => None,
        }
    }

    /// Decimal `(unscaled, scale)` at `event` for decimal stores.
    pub fn decimal(&self, event: usize) -> Option<(i128, i32)> {
        match self {
            ColumnStore::Decimal {
                scale,
                data,
                presence,
            } if presence.get(event) => Some((data.get(event), *scale)),
            _ => None,
        }
    }

    /// Money minor units at `event` for money stores.
    pub fn money(&self, event: usize) -> Option<i64> {
        match self {
            ColumnStore::Money { data, presence } if presence.get(event) => Some(data.get(event)),
            _ => None,
        }
    }

    /// Boolean at `event` for boolean stores.
    pub fn boolean(&self, event: usize) -> Option<bool> {
        match self {
            ColumnStore::Boolean { values, presence } if presence.get(event) => {
                Some(values.get(event))
            }
            _ => None,
        }
    }

    /// Epoch day at `event` for date stores.
    pub fn date(&self, event: usize) -> Option<i32> {
        match self {
            ColumnStore::Date { days, presence } if presence.get(event) => Some(days[event]),
            _ => None,
        }
    }

    /// Materialized range at `event` for non-compound date-range stores.
    ///
    /// Compound payloads are resolved by the owning bucket, which can reach
    /// the referenced sibling columns.
    pub fn date_range(&self, event: usize) -> Option<DateRange> {
        match self {
            ColumnStore::DateRange {
                payload: DateRangePayload::Ranges { mins, maxs },
                presence,
            } if presence.get(event) => Some(DateRange::of(mins[event], maxs[event])),
            _ => None,
        }
    }

    /// Compound column references, if this is a compound date-range store.
    pub fn compound_range_columns(&self) -> Option<(ColumnIndex, ColumnIndex)> {
        match self {
            ColumnStore::DateRange {
                payload:
                    DateRangePayload::Compound {
                        start_column,
                        end_column,
                    },
                ..
            } => Some((*start_column, *end_column)),
            _ => None,
        }
    }

    /// Decoded value at `event`, `None` when absent.
    pub fn value(&self, event: usize) -> Option<StoreValue> {
        if !self.has(event) {
            return None;
        }
        match self {
            ColumnStore::String(s) => s.decode(event).map(|b| StoreValue::String(b.to_vec())),
            ColumnStore::Integer { .. } => self.integer(event).map(StoreValue::Integer),
            ColumnStore::Real { .. } => self.real(event).map(StoreValue::Real),
            ColumnStore::Decimal { .. } => {
                self.decimal(event).map(|(u, s)| StoreValue::Decimal(u, s))
            }
            ColumnStore::Money { .. } => self.money(event).map(StoreValue::Money),
            ColumnStore::Boolean { .. } => self.boolean(event).map(StoreValue::Boolean),
            ColumnStore::Date { .. } => self.date(event).map(StoreValue::Date),
            ColumnStore::DateRange { .. } => self.date_range(event).map(StoreValue::DateRange),
        }
    }

    /// Restricted copy containing exactly the named half-open slices.
    pub fn select(&self, starts: &[usize], lengths: &[usize]) -> ColumnStore {
        debug_assert_eq!(starts.len(), lengths.len());
        match self {
            ColumnStore::String(s) => ColumnStore::String(StringStore {
                codes: s.codes.select(starts, lengths),
                presence: s.presence.select(starts, lengths),
                dictionary_name: s.dictionary_name.clone(),
                dictionary: s.dictionary.clone(),
            }),
            ColumnStore::Integer { data, presence } => ColumnStore::Integer {
                data: data.select(starts, lengths),
                presence: presence.select(starts, lengths),
            },
            ColumnStore::Real { data, presence } => ColumnStore::Real {
                data: data.select(starts, lengths),
                presence: presence.select(starts, lengths),
            },
            ColumnStore::Decimal {
                scale,
                data,
                presence,
            } => ColumnStore::Decimal {
                scale: *scale,
                data: data.select(starts, lengths),
                presence: presence.select(starts, lengths),
            },
            ColumnStore::Money { data, presence } => ColumnStore::Money {
                data: data.select(starts, lengths),
                presence: presence.select(starts, lengths),
            },
            ColumnStore::Boolean { values, presence } => ColumnStore::Boolean {
                values: values.select(starts, lengths),
                presence: presence.select(starts, lengths),
            },
            ColumnStore::Date { days, presence } => {
                let mut out = Vec::with_capacity(lengths.iter().sum());
                for (&start, &length) in starts.iter().zip(lengths) {
                    out.extend_from_slice(&days[start..start + length]);
                }
                ColumnStore::Date {
                    days: out,
                    presence: presence.select(starts, lengths),
                }
            }
            ColumnStore::DateRange { payload, presence } => {
                let payload = match payload {
                    DateRangePayload::Ranges { mins, maxs } => {
                        let total = lengths.iter().sum();
                        let mut new_mins = Vec::with_capacity(total);
                        let mut new_maxs = Vec::with_capacity(total);
                        for (&start, &length) in starts.iter().zip(lengths) {
                            new_mins.extend_from_slice(&mins[start..start + length]);
                            new_maxs.extend_from_slice(&maxs[start..start + length]);
                        }
                        DateRangePayload::Ranges {
                            mins: new_mins,
                            maxs: new_maxs,
                        }
                    }
                    compound => compound.clone(),
                };
                ColumnStore::DateRange {
                    payload,
                    presence: presence.select(starts, lengths),
                }
            }
        }
    }

    /// Re-inject shared dictionaries after deserialization.
    pub fn attach_dictionary(&mut self, dictionary: Arc<Dictionary>) {
        if let ColumnStore::String(s) = self {
            s.attach_dictionary(dictionary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integer_store(values: &[Option<i64>]) -> ColumnStore {
        let mut presence = Presence::with_len(values.len());
        let mut dense = Vec::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            match v {
                Some(v) => {
                    presence.set(i);
                    dense.push(*v);
                }
                None => dense.push(0),
            }
        }
        ColumnStore::Integer {
            data: IntegerData::from_values(&dense),
            presence,
        }
    }

    #[test]
    fn test_presence_null_sentinel() {
        let store = integer_store(&[Some(1), None, Some(3)]);
        assert!(store.has(0));
        assert!(!store.has(1));
        assert_eq!(store.integer(0), Some(1));
        assert_eq!(store.integer(1), None);
        assert_eq!(store.value(1), None);
    }

    #[test]
    fn test_typed_getter_on_wrong_kind() {
        let store = integer_store(&[Some(1)]);
        assert_eq!(store.real(0), None);
        assert_eq!(store.boolean(0), None);
    }

    #[test]
    fn test_integer_width_selection() {
        assert!(matches!(
            IntegerData::from_values(&[1, -4, 100]),
            IntegerData::I8(_)
        ));
        assert!(matches!(
            IntegerData::from_values(&[1, 40_000]),
            IntegerData::I32(_)
        ));
        assert!(matches!(
            IntegerData::from_values(&[1, i64::MAX]),
            IntegerData::I64(_)
        ));
        assert_eq!(IntegerData::from_values(&[1, 40_000]).get(1), 40_000);
    }

    #[test]
    fn test_select_restricts_in_order() {
        let store = integer_store(&[Some(0), Some(1), None, Some(3), Some(4), Some(5)]);
        let restricted = store.select(&[4, 0], &[2, 2]);
        assert_eq!(restricted.len(), 4);
        assert_eq!(restricted.integer(0), Some(4));
        assert_eq!(restricted.integer(1), Some(5));
        assert_eq!(restricted.integer(2), Some(0));
        assert_eq!(restricted.integer(3), Some(1));
    }

    #[test]
    fn test_select_keeps_presence_gaps() {
        let store = integer_store(&[Some(0), None, Some(2)]);
        let restricted = store.select(&[0], &[3]);
        assert!(restricted.has(0));
        assert!(!restricted.has(1));
        assert!(restricted.has(2));
    }

    #[test]
    fn test_boolean_bitset() {
        let mut values = Presence::with_len(3);
        values.set(0);
        let mut presence = Presence::with_len(3);
        presence.set(0);
        presence.set(2);
        let store = ColumnStore::Boolean { values, presence };

        assert_eq!(store.boolean(0), Some(true));
        assert_eq!(store.boolean(1), None);
        assert_eq!(store.boolean(2), Some(false));
    }

    #[test]
    fn test_string_store_decode() {
        let mut dict = Dictionary::new("codes");
        let a = dict.put(b"A01");
        let b = dict.put(b"B20");
        let dict = Arc::new(dict);

        let store = StringStore::from_codes(&[Some(a), None, Some(b)], dict);
        assert_eq!(store.code(0), Some(a));
        assert_eq!(store.code(1), None);
        assert_eq!(store.decode(2), Some(b"B20".as_slice()));
    }

    #[test]
    fn test_date_range_store() {
        let mut presence = Presence::with_len(2);
        presence.set(0);
        let store = ColumnStore::DateRange {
            payload: DateRangePayload::Ranges {
                mins: vec![10, 0],
                maxs: vec![20, 0],
            },
            presence,
        };
        assert_eq!(store.date_range(0), Some(DateRange::of(10, 20)));
        assert_eq!(store.date_range(1), None);
    }
}
