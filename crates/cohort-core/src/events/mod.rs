//! Event storage: columnar stores, buckets and precomputed concept indexes.

pub mod bucket;
pub mod cblock;
pub mod stores;

pub use bucket::{Bucket, BucketEntry, ALL_IDS_TABLE};
pub use cblock::{CBlock, CBlockBuilder, NO_MATCH};
pub use stores::{ColumnStore, StoreValue};
