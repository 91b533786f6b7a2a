//! Precomputed per-(bucket, connector) concept index.
//!
//! A CBlock is built once after bucket creation or a concept-tree change and
//! is strictly read-only afterwards. The builder is a separate type that is
//! frozen into the read value at handoff, so no mutable state is reachable
//! once readers exist.

use crate::common::DateRange;
use crate::schema::CBlockId;
use serde::{Deserialize, Serialize};

/// Sentinel in `most_specific_children` for events that matched no node.
pub const NO_MATCH: u32 = u32::MAX;

/// Read-only concept index for one bucket/connector pair.
///
/// - `most_specific_children[event]` is the arena index of the deepest
///   concept-tree node the event's value matched, or [`NO_MATCH`].
/// - `included_concepts[local_entity]` ORs the bit positions of every node
///   on the ancestor chain of any matched event of that entity. It is the
///   cheap pre-filter consulted before any per-event data is touched.
/// - `min_date`/`max_date` accumulate the validity-date span per entity;
///   unmatched and dateless events contribute nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CBlock {
    id: CBlockId,
    most_specific_children: Vec<u32>,
    included_concepts: Vec<u64>,
    min_date: Vec<i32>,
    max_date: Vec<i32>,
}

impl CBlock {
    /// CBlock identity.
    pub fn id(&self) -> CBlockId {
        self.id
    }

    /// Most specific matched node for `event`, `None` if unmatched.
    pub fn most_specific_child(&self, event: usize) -> Option<u32> {
        match self.most_specific_children.get(event) {
            Some(&node) if node != NO_MATCH => Some(node),
            _ => None,
        }
    }

    /// Raw per-event match table.
    pub fn most_specific_children(&self) -> &[u32] {
        &self.most_specific_children
    }

    /// Ancestor bitmask for a bucket-local entity slot.
    pub fn included_concepts(&self, local_entity: u32) -> u64 {
        self.included_concepts
            .get(local_entity as usize)
            .copied()
            .unwrap_or(0)
    }

    /// All per-entity bitmasks.
    pub fn included_concepts_raw(&self) -> &[u64] {
        &self.included_concepts
    }

    /// Validity-date span of a bucket-local entity slot, `None` when no
    /// dated event matched.
    pub fn entity_date_range(&self, local_entity: u32) -> Option<DateRange> {
        let min = *self.min_date.get(local_entity as usize)?;
        let max = *self.max_date.get(local_entity as usize)?;
        if min > max {
            return None;
        }
        Some(DateRange::of(min, max))
    }
}

/// Mutable build state for a [`CBlock`]; frozen via [`CBlockBuilder::freeze`].
#[derive(Debug)]
pub struct CBlockBuilder {
    id: CBlockId,
    most_specific_children: Vec<u32>,
    included_concepts: Vec<u64>,
    min_date: Vec<i32>,
    max_date: Vec<i32>,
}

impl CBlockBuilder {
    /// Builder for `number_of_events` events and `bucket_size` entity slots.
    pub fn new(id: CBlockId, number_of_events: usize, bucket_size: u32) -> Self {
        Self {
            id,
            most_specific_children: Vec::with_capacity(number_of_events),
            included_concepts: vec![0; bucket_size as usize],
            min_date: vec![i32::MAX; bucket_size as usize],
            max_date: vec![i32::MIN; bucket_size as usize],
        }
    }

    /// Record the resolution result for the next event, in event order.
    pub fn push_event(&mut self, most_specific_child: Option<u32>) {
        self.most_specific_children
            .push(most_specific_child.unwrap_or(NO_MATCH));
    }

    /// OR a node's bit position into an entity's bitmask.
    pub fn include_concept(&mut self, local_entity: u32, bit: u16) {
        self.included_concepts[local_entity as usize] |= 1u64 << (bit % 64);
    }

    /// Min/max-accumulate a validity-date range for an entity.
    pub fn span_dates(&mut self, local_entity: u32, range: &DateRange) {
        let slot = local_entity as usize;
        self.min_date[slot] = self.min_date[slot].min(range.min());
        self.max_date[slot] = self.max_date[slot].max(range.max());
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> usize {
        self.most_specific_children.len()
    }

    /// Freeze into the read-only value. Consumes the builder, so no mutable
    /// handle survives the handoff.
    pub fn freeze(self) -> CBlock {
        CBlock {
            id: self.id,
            most_specific_children: self.most_specific_children,
            included_concepts: self.included_concepts,
            min_date: self.min_date,
            max_date: self.max_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BucketId, ConnectorId, ImportId};

    fn cblock_id() -> CBlockId {
        CBlockId {
            bucket: BucketId {
                import: ImportId { table: 0, seq: 1 },
                bucket: 0,
            },
            connector: ConnectorId(0),
        }
    }

    #[test]
    fn test_builder_freeze() {
        let mut builder = CBlockBuilder::new(cblock_id(), 3, 4);
        builder.push_event(Some(2));
        builder.push_event(None);
        builder.push_event(Some(5));
        builder.include_concept(0, 0);
        builder.include_concept(0, 2);
        builder.span_dates(0, &DateRange::of(100, 200));
        builder.span_dates(0, &DateRange::of(50, 120));

        let cblock = builder.freeze();
        assert_eq!(cblock.most_specific_child(0), Some(2));
        assert_eq!(cblock.most_specific_child(1), None);
        assert_eq!(cblock.most_specific_child(2), Some(5));
        assert_eq!(cblock.included_concepts(0), 0b101);
        assert_eq!(cblock.included_concepts(1), 0);
        assert_eq!(cblock.entity_date_range(0), Some(DateRange::of(50, 200)));
        assert_eq!(cblock.entity_date_range(1), None);
    }

    #[test]
    fn test_bit_positions_wrap_mod_64() {
        let mut builder = CBlockBuilder::new(cblock_id(), 0, 1);
        builder.include_concept(0, 64 + 3);
        let cblock = builder.freeze();
        assert_eq!(cblock.included_concepts(0), 1 << 3);
    }
}
