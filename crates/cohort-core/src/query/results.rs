//! Per-entity result rows.

use crate::common::DateSet;
use serde::{Deserialize, Serialize};

/// One aggregator output. Absent aggregations are `Null`, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultValue {
    /// No value
    Null,
    /// Boolean
    Boolean(bool),
    /// Integer
    Integer(i64),
    /// Real
    Real(f64),
    /// Decimal as (unscaled, scale)
    Decimal(i128, i32),
    /// Money in minor units
    Money(i64),
    /// Epoch day
    Date(i32),
    /// Set of day ranges
    DateSet(DateSet),
    /// String
    String(String),
    /// Ordered list of values
    List(Vec<ResultValue>),
}

impl ResultValue {
    /// Whether this is the null-sentinel.
    pub fn is_null(&self) -> bool {
        matches!(self, ResultValue::Null)
    }
}

/// One merged result row: an entity and its ordered aggregator outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    /// Global entity id
    pub entity: u32,
    /// Aggregator outputs in plan declaration order
    pub values: Vec<ResultValue>,
}
