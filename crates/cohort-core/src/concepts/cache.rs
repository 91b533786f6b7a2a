//! Per-import memoizing cache for concept-tree resolution.
//!
//! CBlock builds of different buckets of the same import run concurrently on
//! the job pool and resolve the same dictionary-coded values over and over.
//! The cache keys resolved results by dictionary id, including negative
//! results, and keeps hit/miss counters for diagnostics.

use crate::concepts::conditions::LazyRow;
use crate::concepts::tree::{ConceptTree, NodeIndex};
use crate::dictionary::DictId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Memoizing resolution cache for one (concept tree, import) pair.
#[derive(Debug, Default)]
pub struct ConceptTreeCache {
    resolved: RwLock<HashMap<DictId, Option<NodeIndex>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConceptTreeCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `value` (the decoded string behind `dict_id`) to its most
    /// specific node, consulting the cache first.
    ///
    /// A first-time resolution counts as a miss, every later lookup of the
    /// same id as a hit; cached negative results count as hits too.
    pub fn find_most_specific_child(
        &self,
        tree: &ConceptTree,
        dict_id: DictId,
        value: &str,
        row: &LazyRow<'_>,
    ) -> Option<NodeIndex> {
        if let Some(&cached) = self.resolved.read().get(&dict_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = tree.find_most_specific_child(value, row);
        self.resolved.write().insert(dict_id, result);
        result
    }

    /// Cache hits so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses so far.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Number of distinct cached values.
    pub fn len(&self) -> usize {
        self.resolved.read().len()
    }

    /// Whether nothing has been cached yet.
    pub fn is_empty(&self) -> bool {
        self.resolved.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concepts::conditions::Condition;
    use crate::events::Bucket;

    #[test]
    fn test_hit_miss_accounting() {
        let mut tree = ConceptTree::new("codes");
        tree.add_child(
            0,
            "a",
            Condition::Prefix {
                prefixes: vec!["A".into()],
            },
        )
        .unwrap();
        tree.build_prefix_index();

        let cache = ConceptTreeCache::new();
        let bucket = Bucket::empty();
        let columns = Vec::new();
        let row = LazyRow::new(&bucket, &columns, 0);

        let first = cache.find_most_specific_child(&tree, 0, "A01", &row);
        assert!(first.is_some());
        assert_eq!((cache.hits(), cache.misses()), (0, 1));

        let second = cache.find_most_specific_child(&tree, 0, "A01", &row);
        assert_eq!(first, second);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        // Negative results are cached and count as hits on re-lookup.
        assert_eq!(cache.find_most_specific_child(&tree, 1, "Z", &row), None);
        assert_eq!(cache.find_most_specific_child(&tree, 1, "Z", &row), None);
        assert_eq!((cache.hits(), cache.misses()), (2, 2));
        assert_eq!(cache.len(), 2);
    }
}
