//! Static schema metadata: datasets, tables, columns and their ids.
//!
//! Schema objects are immutable after dataset registration. Queries arrive
//! with symbolic names and are resolved against this metadata before any
//! distributed work starts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a table within its dataset.
pub type TableIndex = u16;
/// Position of a column within its table.
pub type ColumnIndex = u16;

/// Declared value kind of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Dictionary-coded strings
    String,
    /// Signed integers
    Integer,
    /// Floating point numbers
    Real,
    /// Fixed-scale decimals
    Decimal,
    /// Currency amounts in minor units
    Money,
    /// Booleans
    Boolean,
    /// Single days
    Date,
    /// Day ranges with optionally open ends
    DateRange,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnKind::String => "STRING",
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Decimal => "DECIMAL",
            ColumnKind::Money => "MONEY",
            ColumnKind::Boolean => "BOOLEAN",
            ColumnKind::Date => "DATE",
            ColumnKind::DateRange => "DATE_RANGE",
        };
        f.write_str(name)
    }
}

impl ColumnKind {
    /// Whether values of this kind carry date information usable for
    /// validity-date aggregation.
    pub fn is_date_compatible(&self) -> bool {
        matches!(self, ColumnKind::Date | ColumnKind::DateRange)
    }
}

/// Static column metadata. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    /// Column name, unique within the table
    pub name: String,
    /// Position within the owning table
    pub position: ColumnIndex,
    /// Declared value kind
    pub kind: ColumnKind,
}

/// A logical table of one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Table name, unique within the dataset
    pub name: String,
    /// Index within the owning dataset
    pub index: TableIndex,
    /// Columns in position order
    pub columns: Vec<Column>,
}

impl Table {
    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Identifies one import of one table. Re-imports allocate a new sequence
/// number; buckets of the replaced import are dropped wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImportId {
    /// Table the import belongs to
    pub table: TableIndex,
    /// Sequence number of the import
    pub seq: u32,
}

impl fmt::Display for ImportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "import[{}.{}]", self.table, self.seq)
    }
}

/// Identifies one bucket: the import it came from and its bucket number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketId {
    /// Owning import
    pub import: ImportId,
    /// Bucket number, assigning the covered entity range
    pub bucket: u32,
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bucket[{}.{}.{}]", self.import.table, self.import.seq, self.bucket)
    }
}

/// Identifies a connector within its dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectorId(pub u16);

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connector[{}]", self.0)
    }
}

/// Identifies one CBlock: the bucket/connector pair it indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CBlockId {
    /// Indexed bucket
    pub bucket: BucketId,
    /// Indexed connector
    pub connector: ConnectorId,
}

impl fmt::Display for CBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cblock[{}/{}]", self.bucket, self.connector)
    }
}

/// Table schema plus dataset-wide sharding parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSchema {
    /// Dataset name
    pub name: String,
    /// Tables in index order
    pub tables: Vec<Table>,
    /// Number of consecutive entity ids covered by one bucket
    pub entity_bucket_size: u32,
}

impl DatasetSchema {
    /// Look up a table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Bucket number responsible for a global entity id.
    pub fn bucket_of_entity(&self, entity: u32) -> u32 {
        entity / self.entity_bucket_size
    }
}
