//! Runtime query-plan node trees and their per-entity execution loop.
//!
//! Plan instances are not thread-safe and never shared: the executor builds
//! a fresh tree from the immutable [`PlanDescription`] for every entity it
//! evaluates. Every node follows the same iteration contract:
//!
//! ```text
//! init(entity, ctx)
//! next_table(table)           // once per table still of interest
//! next_block(bucket)          // once per owned bucket of that table
//! accept_event(bucket, event) // once per event in [start, end)
//! is_contained() -> bool      // final verdict
//! ```

use crate::common::DateSet;
use crate::concepts::{Connector, Dataset};
use crate::events::{bucket::ALL_IDS_TABLE, Bucket, CBlock};
use crate::query::aggregators::Aggregator;
use crate::query::filters::FilterNode;
use crate::query::results::{EntityRow, ResultValue};
use crate::schema::{CBlockId, ColumnIndex, TableIndex};
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;

/// Read access to the bucket/CBlock holdings of one worker.
///
/// Implemented by the worker's bucket manager; test fixtures provide small
/// in-memory stand-ins.
pub trait BucketRegistry: Sync {
    /// Buckets of `table` holding events of `entity`, ascending by bucket
    /// number.
    fn entity_buckets(&self, table: TableIndex, entity: u32) -> Vec<Arc<Bucket>>;

    /// The CBlock for a bucket/connector pair, if built.
    fn cblock(&self, id: CBlockId) -> Option<Arc<CBlock>>;

    /// Whether `entity` owns any event in `table`.
    fn entity_has_data(&self, table: TableIndex, entity: u32) -> bool;
}

/// Shared read-only context for one plan evaluation.
pub struct ExecutionContext<'a> {
    /// Dataset metadata
    pub dataset: &'a Dataset,
    /// Bucket/CBlock access
    pub registry: &'a dyn BucketRegistry,
    /// Date restriction in force; `DateSet::all()` when unrestricted
    pub date_restriction: DateSet,
}

impl<'a> ExecutionContext<'a> {
    /// Unrestricted context.
    pub fn new(dataset: &'a Dataset, registry: &'a dyn BucketRegistry) -> Self {
        Self {
            dataset,
            registry,
            date_restriction: DateSet::all(),
        }
    }

    /// Context with a narrowed date restriction, borrowing the same data.
    pub fn with_restriction(&self, date_restriction: DateSet) -> ExecutionContext<'a> {
        ExecutionContext {
            dataset: self.dataset,
            registry: self.registry,
            date_restriction,
        }
    }
}

/// A node of the runtime plan tree.
#[derive(Debug)]
pub enum PlanNode {
    /// Existence: contained once any event (including the synthetic all-ids
    /// event) was accepted
    Leaf(LeafNode),
    /// Concept-tree membership with attached filters and aggregators
    Concept(Box<ConceptPlanNode>),
    /// All children contained
    And(Vec<PlanNode>),
    /// Any child contained
    Or(Vec<PlanNode>),
    /// Child not contained
    Negation(Box<PlanNode>),
    /// Child evaluated under a narrowed date restriction
    DateRestriction(Box<DateRestrictionNode>),
}

/// Existence leaf.
#[derive(Debug, Default)]
pub struct LeafNode {
    triggered: bool,
}

/// Date-restriction wrapper.
#[derive(Debug)]
pub struct DateRestrictionNode {
    /// Narrowed restriction applied to the subtree
    pub restriction: DateSet,
    /// Wrapped child
    pub child: PlanNode,
}

/// Concept node: accepts events whose most specific matched concept lies in
/// the queried subtree, feeding its filters and aggregators.
#[derive(Debug)]
pub struct ConceptPlanNode {
    /// The connector binding concept and table
    pub connector: Connector,
    /// Arena indices of the queried node and all its descendants
    pub subtree: HashSet<u32>,
    /// Bitmask of the queried subtree for entity-level pruning
    pub subtree_mask: u64,
    /// Attached filters
    pub filters: Vec<FilterNode>,
    /// Attached aggregators, in declaration order
    pub aggregators: Vec<Aggregator>,
    /// Validity-date union, maintained when the plan aggregates dates
    pub special_dates: Option<Aggregator>,

    table_active: bool,
    cblock: Option<Arc<CBlock>>,
    validity: Option<ColumnIndex>,
    restriction: DateSet,
    restricted: bool,
    hit: bool,
}

impl ConceptPlanNode {
    /// Node over `connector` matching `subtree`, with `subtree_mask` as its
    /// CBlock pre-filter.
    pub fn new(
        connector: Connector,
        subtree: HashSet<u32>,
        subtree_mask: u64,
        filters: Vec<FilterNode>,
        aggregators: Vec<Aggregator>,
        aggregate_dates: bool,
    ) -> Self {
        Self {
            connector,
            subtree,
            subtree_mask,
            filters,
            aggregators,
            special_dates: aggregate_dates.then(Aggregator::date_union),
            table_active: false,
            cblock: None,
            validity: None,
            restriction: DateSet::all(),
            restricted: false,
            hit: false,
        }
    }

    fn local_entity(&self, bucket: &Bucket, entity: u32) -> u32 {
        bucket.to_local(entity)
    }
}

impl PlanNode {
    /// Reset per-entity state.
    pub fn init(&mut self, ctx: &ExecutionContext<'_>, entity: u32) {
        match self {
            PlanNode::Leaf(leaf) => leaf.triggered = false,
            PlanNode::Concept(node) => {
                node.hit = false;
                node.table_active = false;
                node.cblock = None;
                for filter in &mut node.filters {
                    filter.init();
                }
                for aggregator in &mut node.aggregators {
                    aggregator.init();
                }
                if let Some(dates) = &mut node.special_dates {
                    dates.init();
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.init(ctx, entity);
                }
            }
            PlanNode::Negation(child) => child.init(ctx, entity),
            PlanNode::DateRestriction(node) => {
                let scoped = ctx.with_restriction(node.restriction.clone());
                node.child.init(&scoped, entity);
            }
        }
    }

    /// Announce the next visited table.
    pub fn next_table(&mut self, ctx: &ExecutionContext<'_>, table: TableIndex) {
        match self {
            PlanNode::Leaf(_) => {}
            PlanNode::Concept(node) => {
                node.table_active = table == node.connector.table;
                node.cblock = None;
                if node.table_active {
                    node.validity = node.connector.validity_date_column();
                    node.restriction = ctx.date_restriction.clone();
                    node.restricted = !node.restriction.covers_all();
                    for aggregator in &mut node.aggregators {
                        aggregator.next_table(node.validity, &node.restriction);
                    }
                    if let Some(dates) = &mut node.special_dates {
                        dates.next_table(node.validity, &node.restriction);
                    }
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.next_table(ctx, table);
                }
            }
            PlanNode::Negation(child) => child.next_table(ctx, table),
            PlanNode::DateRestriction(node) => {
                let scoped = ctx.with_restriction(node.restriction.clone());
                node.child.next_table(&scoped, table);
            }
        }
    }

    /// Announce the next visited bucket of the current table.
    pub fn next_block(&mut self, ctx: &ExecutionContext<'_>, bucket: &Bucket) {
        match self {
            PlanNode::Leaf(_) => {}
            PlanNode::Concept(node) => {
                if !node.table_active || bucket.is_empty_bucket() {
                    node.cblock = None;
                    return;
                }
                node.cblock = ctx.registry.cblock(CBlockId {
                    bucket: bucket.id(),
                    connector: node.connector.id,
                });
                for filter in &mut node.filters {
                    filter.next_block(bucket);
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.next_block(ctx, bucket);
                }
            }
            PlanNode::Negation(child) => child.next_block(ctx, bucket),
            PlanNode::DateRestriction(node) => {
                let scoped = ctx.with_restriction(node.restriction.clone());
                node.child.next_block(&scoped, bucket);
            }
        }
    }

    /// Consume one event of the current bucket.
    pub fn accept_event(&mut self, bucket: &Bucket, event: usize) {
        match self {
            PlanNode::Leaf(leaf) => leaf.triggered = true,
            PlanNode::Concept(node) => {
                if !node.table_active {
                    return;
                }
                let Some(cblock) = &node.cblock else {
                    return;
                };
                let Some(matched) = cblock.most_specific_child(event) else {
                    return;
                };
                if !node.subtree.contains(&matched) {
                    return;
                }
                if node.restricted {
                    if let Some(column) = node.validity {
                        if !bucket.event_is_contained_in(event, column, &node.restriction) {
                            return;
                        }
                    }
                }
                node.hit = true;
                for filter in &mut node.filters {
                    filter.accept_event(bucket, event);
                }
                for aggregator in &mut node.aggregators {
                    aggregator.accept_event(bucket, event);
                }
                if let Some(dates) = &mut node.special_dates {
                    dates.accept_event(bucket, event);
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.accept_event(bucket, event);
                }
            }
            PlanNode::Negation(child) => child.accept_event(bucket, event),
            PlanNode::DateRestriction(node) => node.child.accept_event(bucket, event),
        }
    }

    /// Final verdict after all events of the entity.
    pub fn is_contained(&self) -> bool {
        match self {
            PlanNode::Leaf(leaf) => leaf.triggered,
            PlanNode::Concept(node) => {
                node.hit && node.filters.iter().all(FilterNode::is_contained)
            }
            PlanNode::And(children) => children.iter().all(PlanNode::is_contained),
            PlanNode::Or(children) => children.iter().any(PlanNode::is_contained),
            PlanNode::Negation(child) => !child.is_contained(),
            PlanNode::DateRestriction(node) => node.child.is_contained(),
        }
    }

    /// Whether the entity could possibly satisfy this subtree.
    pub fn is_of_interest_entity(&self, ctx: &ExecutionContext<'_>, entity: u32) -> bool {
        match self {
            PlanNode::Leaf(_) => true,
            PlanNode::Concept(node) => {
                ctx.registry.entity_has_data(node.connector.table, entity)
            }
            PlanNode::And(children) | PlanNode::Or(children) => children
                .iter()
                .any(|child| child.is_of_interest_entity(ctx, entity)),
            // Absence is satisfied precisely by entities without data.
            PlanNode::Negation(_) => true,
            PlanNode::DateRestriction(node) => node.child.is_of_interest_entity(ctx, entity),
        }
    }

    /// Whether the bucket can contribute, checked via the CBlock bitmask
    /// before any per-event data is touched.
    pub fn is_of_interest_bucket(&self, ctx: &ExecutionContext<'_>, bucket: &Bucket, entity: u32) -> bool {
        match self {
            PlanNode::Leaf(_) => true,
            PlanNode::Concept(node) => {
                if bucket.import().table != node.connector.table {
                    return false;
                }
                let Some(cblock) = ctx.registry.cblock(CBlockId {
                    bucket: bucket.id(),
                    connector: node.connector.id,
                }) else {
                    return false;
                };
                let local = node.local_entity(bucket, entity);
                cblock.included_concepts(local) & node.subtree_mask != 0
            }
            PlanNode::And(children) | PlanNode::Or(children) => children
                .iter()
                .any(|child| child.is_of_interest_bucket(ctx, bucket, entity)),
            PlanNode::Negation(child) => child.is_of_interest_bucket(ctx, bucket, entity),
            PlanNode::DateRestriction(node) => {
                node.child.is_of_interest_bucket(ctx, bucket, entity)
            }
        }
    }

    /// Tables this subtree needs to visit.
    pub fn collect_required_tables(&self, out: &mut BTreeSet<TableIndex>) {
        match self {
            PlanNode::Leaf(_) => {
                out.insert(ALL_IDS_TABLE);
            }
            PlanNode::Concept(node) => {
                out.insert(node.connector.table);
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.collect_required_tables(out);
                }
            }
            PlanNode::Negation(child) => child.collect_required_tables(out),
            PlanNode::DateRestriction(node) => node.child.collect_required_tables(out),
        }
    }

    /// Merge every concept node's validity-date union into `out`.
    pub fn collect_date_union(&self, out: &mut DateSet) {
        match self {
            PlanNode::Leaf(_) => {}
            PlanNode::Concept(node) => {
                if let Some(Aggregator::DateUnion { set, .. }) = &node.special_dates {
                    out.add_all(set);
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.collect_date_union(out);
                }
            }
            PlanNode::Negation(child) => child.collect_date_union(out),
            PlanNode::DateRestriction(node) => node.child.collect_date_union(out),
        }
    }

    /// Collect aggregator outputs in pre-order declaration order.
    pub fn collect_results(&self, out: &mut Vec<ResultValue>) {
        match self {
            PlanNode::Leaf(_) => {}
            PlanNode::Concept(node) => {
                for aggregator in &node.aggregators {
                    out.push(aggregator.result());
                }
            }
            PlanNode::And(children) | PlanNode::Or(children) => {
                for child in children {
                    child.collect_results(out);
                }
            }
            PlanNode::Negation(child) => child.collect_results(out),
            PlanNode::DateRestriction(node) => node.child.collect_results(out),
        }
    }
}

/// A per-entity evaluation of one query.
///
/// Built fresh from the plan description for every entity; discarded after
/// producing a row or being pruned.
#[derive(Debug)]
pub struct ConceptQueryPlan {
    root: PlanNode,
    generate_date_aggregator: bool,
    required_tables: BTreeSet<TableIndex>,
}

impl ConceptQueryPlan {
    /// Assemble a plan from an already-built root node.
    pub fn new(root: PlanNode, generate_date_aggregator: bool) -> Self {
        let mut required_tables = BTreeSet::new();
        root.collect_required_tables(&mut required_tables);
        Self {
            root,
            generate_date_aggregator,
            required_tables,
        }
    }

    /// Tables the plan visits, in ascending index order.
    pub fn required_tables(&self) -> &BTreeSet<TableIndex> {
        &self.required_tables
    }

    /// Evaluate one entity. Returns its result row if contained.
    pub fn execute(&mut self, ctx: &ExecutionContext<'_>, entity: u32) -> Option<EntityRow> {
        if self.required_tables.is_empty() {
            return None;
        }

        self.root.init(ctx, entity);

        if !self.root.is_of_interest_entity(ctx, entity) {
            return None;
        }

        // Always one go-round with the synthetic all-ids table first, so
        // existence is established before real tables are visited.
        let all_ids = Bucket::empty();
        self.root.next_table(ctx, ALL_IDS_TABLE);
        self.root.next_block(ctx, &all_ids);
        self.root.accept_event(&all_ids, 0);

        for &table in &self.required_tables {
            if table == ALL_IDS_TABLE {
                continue;
            }
            self.root.next_table(ctx, table);

            for bucket in ctx.registry.entity_buckets(table, entity) {
                if !bucket.contains_entity(entity) {
                    continue;
                }
                if !self.root.is_of_interest_bucket(ctx, &bucket, entity) {
                    continue;
                }
                self.root.next_block(ctx, &bucket);
                let (Some(start), Some(end)) =
                    (bucket.entity_start(entity), bucket.entity_end(entity))
                else {
                    continue;
                };
                for event in start..end {
                    self.root.accept_event(&bucket, event);
                }
            }
        }

        if !self.root.is_contained() {
            return None;
        }
        Some(self.create_result(entity))
    }

    fn create_result(&self, entity: u32) -> EntityRow {
        let mut values = Vec::new();
        if self.generate_date_aggregator {
            let mut dates = DateSet::new();
            self.root.collect_date_union(&mut dates);
            values.push(ResultValue::DateSet(dates));
        }
        self.root.collect_results(&mut values);
        EntityRow { entity, values }
    }
}
