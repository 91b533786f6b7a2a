//! Connectors: bindings between a concept tree and a table/column pair.

use crate::concepts::conditions::Condition;
use crate::schema::{ColumnIndex, ConnectorId, TableIndex};
use serde::{Deserialize, Serialize};

/// Binds a concept tree to the table/column its values are resolved from.
///
/// The optional row condition filters which events the connector sees at
/// all, letting several connectors share one physical table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    /// Connector id within the dataset
    pub id: ConnectorId,
    /// Connector name, unique within the dataset
    pub name: String,
    /// Index of the bound concept tree
    pub concept: u16,
    /// Table the connector reads
    pub table: TableIndex,
    /// String column resolved against the concept tree
    pub column: ColumnIndex,
    /// Optional per-row filter applied before resolution
    pub condition: Option<Condition>,
    /// Date columns feeding validity-date aggregation, in priority order
    pub validity_date_columns: Vec<ColumnIndex>,
}

impl Connector {
    /// Primary validity-date column, if the connector has any.
    pub fn validity_date_column(&self) -> Option<ColumnIndex> {
        self.validity_date_columns.first().copied()
    }
}
