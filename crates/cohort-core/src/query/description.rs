//! Immutable query descriptions.
//!
//! A [`QueryDescription`] is what clients submit: symbolic concept paths,
//! connector and column names. The manager resolves it into a
//! [`PlanDescription`], in which all references are dataset-local ids,
//! before any distributed work starts; resolution failures are rejected
//! synchronously with stable error codes. The resolved description is
//! serialized verbatim to every involved worker, where a fresh
//! [`ConceptQueryPlan`] is built from it per entity.

use crate::common::{DateRange, DateSet, EpochDay};
use crate::concepts::Dataset;
use crate::error::{Error, Result};
use crate::query::aggregators::{Aggregator, SumState};
use crate::query::filters::{FilterNode, NumberRange};
use crate::query::plan::{
    ConceptPlanNode, ConceptQueryPlan, DateRestrictionNode, LeafNode, PlanNode,
};
use crate::schema::{ColumnIndex, ColumnKind, ConnectorId, Table};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Filter reference inside a submitted query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryFilter {
    /// Event count must fall in a range
    CountRange {
        /// Counted column name; `None` counts all matching events
        column: Option<String>,
        /// Lower bound
        min: Option<i64>,
        /// Upper bound
        max: Option<i64>,
    },
    /// Column sum must fall in a range
    SumRange {
        /// Summed column name
        column: String,
        /// Lower bound
        min: Option<i64>,
        /// Upper bound
        max: Option<i64>,
    },
    /// Some event's value is one of the given strings
    MultiSelect {
        /// Tested column name
        column: String,
        /// Accepted values
        values: Vec<String>,
    },
}

/// Aggregator (select) reference inside a submitted query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuerySelect {
    /// Count events with a value in `column`, or all events
    Count {
        /// Counted column name
        column: Option<String>,
    },
    /// Sum a numeric column
    Sum {
        /// Summed column name
        column: String,
    },
    /// Value of the earliest event
    First {
        /// Sampled column name
        column: String,
    },
    /// Value of the latest event
    Last {
        /// Sampled column name
        column: String,
    },
    /// Uniformly sampled value
    Random {
        /// Sampled column name
        column: String,
    },
    /// Distinct values
    Distinct {
        /// Collected column name
        column: String,
    },
    /// Whether any event matched
    Exists,
    /// Distinct calendar quarters of a date column
    CountQuarters {
        /// Date column name
        column: String,
    },
    /// Distinct values starting with a prefix
    PrefixText {
        /// Collected column name
        column: String,
        /// Required prefix
        prefix: String,
    },
}

/// Node of a submitted query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryNode {
    /// Match a concept-tree node through a connector
    Concept {
        /// Dotted concept path, e.g. `icd.infectious.typhoid`
        concept: String,
        /// Connector name
        connector: String,
        /// Filters, all of which must hold
        filters: Vec<QueryFilter>,
        /// Selects, evaluated in order
        selects: Vec<QuerySelect>,
    },
    /// All children must be contained
    And(Vec<QueryNode>),
    /// Any child must be contained
    Or(Vec<QueryNode>),
    /// Child must not be contained
    Not(Box<QueryNode>),
    /// Child evaluated only inside the date range
    DateRestriction {
        /// Lower bound as epoch day
        min: Option<EpochDay>,
        /// Upper bound as epoch day
        max: Option<EpochDay>,
        /// Wrapped child
        child: Box<QueryNode>,
    },
}

/// A query as submitted by a client, with symbolic references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryDescription {
    /// Target dataset name
    pub dataset: String,
    /// Root node
    pub root: QueryNode,
    /// Whether the result rows lead with the validity-date union
    pub generate_date_aggregator: bool,
}

/// Resolved filter with dataset-local column indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FilterDescription {
    /// See [`QueryFilter::CountRange`]
    CountRange {
        /// Counted column
        column: Option<ColumnIndex>,
        /// Lower bound
        min: Option<i64>,
        /// Upper bound
        max: Option<i64>,
    },
    /// See [`QueryFilter::SumRange`]
    SumRange {
        /// Summed column
        column: ColumnIndex,
        /// Lower bound
        min: Option<i64>,
        /// Upper bound
        max: Option<i64>,
    },
    /// See [`QueryFilter::MultiSelect`]
    MultiSelect {
        /// Tested column
        column: ColumnIndex,
        /// Accepted values
        values: Vec<String>,
    },
}

/// Resolved aggregator with dataset-local column indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AggregatorDescription {
    /// Count
    Count {
        /// Counted column
        column: Option<ColumnIndex>,
    },
    /// Sum
    Sum {
        /// Summed column
        column: ColumnIndex,
    },
    /// First value
    First {
        /// Sampled column
        column: ColumnIndex,
    },
    /// Last value
    Last {
        /// Sampled column
        column: ColumnIndex,
    },
    /// Random value
    Random {
        /// Sampled column
        column: ColumnIndex,
    },
    /// Distinct values
    Distinct {
        /// Collected column
        column: ColumnIndex,
    },
    /// Existence flag
    Exists,
    /// Distinct quarters
    CountQuarters {
        /// Date column
        column: ColumnIndex,
    },
    /// Distinct prefixed values
    PrefixText {
        /// Collected column
        column: ColumnIndex,
        /// Required prefix
        prefix: String,
    },
}

/// Resolved plan node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeDescription {
    /// Existence leaf
    Leaf,
    /// Concept membership
    Concept {
        /// Resolved connector
        connector: ConnectorId,
        /// Concept tree index
        concept: u16,
        /// Queried node within the tree
        node: u32,
        /// Resolved filters
        filters: Vec<FilterDescription>,
        /// Resolved aggregators
        aggregators: Vec<AggregatorDescription>,
    },
    /// Conjunction
    And(Vec<NodeDescription>),
    /// Disjunction
    Or(Vec<NodeDescription>),
    /// Negation
    Negation(Box<NodeDescription>),
    /// Date restriction
    DateRestriction {
        /// Lower bound
        min: Option<EpochDay>,
        /// Upper bound
        max: Option<EpochDay>,
        /// Wrapped child
        child: Box<NodeDescription>,
    },
}

/// A fully resolved, immutable plan template.
///
/// This is what travels to the workers; every evaluation builds a fresh
/// node tree from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDescription {
    /// Target dataset name
    pub dataset: String,
    /// Resolved root
    pub root: NodeDescription,
    /// Whether result rows lead with the validity-date union
    pub generate_date_aggregator: bool,
}

impl QueryDescription {
    /// Resolve all symbolic references against `dataset`.
    ///
    /// Fails with a stable validation code on the first unknown reference;
    /// nothing is sent to any worker in that case.
    pub fn resolve(&self, dataset: &Dataset) -> Result<PlanDescription> {
        if dataset.schema.name != self.dataset {
            return Err(Error::validation(
                "UNKNOWN_DATASET",
                format!("query targets dataset {:?}", self.dataset),
            ));
        }
        Ok(PlanDescription {
            dataset: self.dataset.clone(),
            root: resolve_node(&self.root, dataset)?,
            generate_date_aggregator: self.generate_date_aggregator,
        })
    }
}

fn resolve_node(node: &QueryNode, dataset: &Dataset) -> Result<NodeDescription> {
    match node {
        QueryNode::Concept {
            concept,
            connector,
            filters,
            selects,
        } => {
            let tree_name = concept.split('.').next().unwrap_or(concept);
            let (tree_index, tree) = dataset.concept_by_name(tree_name).ok_or_else(|| {
                Error::validation("UNKNOWN_CONCEPT", format!("no such concept: {concept}"))
            })?;
            let node_index = tree.resolve_path(concept).ok_or_else(|| {
                Error::validation("UNKNOWN_CONCEPT", format!("no such concept: {concept}"))
            })?;
            let conn = dataset
                .connectors
                .iter()
                .find(|c| c.name == *connector && c.concept == tree_index)
                .ok_or_else(|| {
                    Error::validation(
                        "UNKNOWN_CONNECTOR",
                        format!("no connector {connector:?} for concept {tree_name:?}"),
                    )
                })?;
            let table = dataset
                .schema
                .tables
                .get(conn.table as usize)
                .ok_or_else(|| Error::internal(format!("connector {} without table", conn.name)))?;

            let filters = filters
                .iter()
                .map(|f| resolve_filter(f, table))
                .collect::<Result<Vec<_>>>()?;
            let aggregators = selects
                .iter()
                .map(|s| resolve_select(s, table))
                .collect::<Result<Vec<_>>>()?;

            Ok(NodeDescription::Concept {
                connector: conn.id,
                concept: tree_index,
                node: node_index,
                filters,
                aggregators,
            })
        }
        QueryNode::And(children) => Ok(NodeDescription::And(
            children
                .iter()
                .map(|c| resolve_node(c, dataset))
                .collect::<Result<Vec<_>>>()?,
        )),
        QueryNode::Or(children) => Ok(NodeDescription::Or(
            children
                .iter()
                .map(|c| resolve_node(c, dataset))
                .collect::<Result<Vec<_>>>()?,
        )),
        QueryNode::Not(child) => Ok(NodeDescription::Negation(Box::new(resolve_node(
            child, dataset,
        )?))),
        QueryNode::DateRestriction { min, max, child } => {
            if let (Some(min), Some(max)) = (min, max) {
                if min > max {
                    return Err(Error::validation(
                        "INVALID_DATE_RANGE",
                        format!("inverted date restriction {min}..{max}"),
                    ));
                }
            }
            Ok(NodeDescription::DateRestriction {
                min: *min,
                max: *max,
                child: Box::new(resolve_node(child, dataset)?),
            })
        }
    }
}

fn resolve_column(table: &Table, name: &str) -> Result<ColumnIndex> {
    table
        .column(name)
        .map(|c| c.position)
        .ok_or_else(|| {
            Error::validation(
                "UNKNOWN_COLUMN",
                format!("no column {name:?} in table {:?}", table.name),
            )
        })
}

fn resolve_filter(filter: &QueryFilter, table: &Table) -> Result<FilterDescription> {
    match filter {
        QueryFilter::CountRange { column, min, max } => Ok(FilterDescription::CountRange {
            column: column
                .as_deref()
                .map(|c| resolve_column(table, c))
                .transpose()?,
            min: *min,
            max: *max,
        }),
        QueryFilter::SumRange { column, min, max } => Ok(FilterDescription::SumRange {
            column: resolve_column(table, column)?,
            min: *min,
            max: *max,
        }),
        QueryFilter::MultiSelect { column, values } => {
            let position = resolve_column(table, column)?;
            if table.columns[position as usize].kind != ColumnKind::String {
                return Err(Error::validation(
                    "INVALID_FILTER",
                    format!("multi-select filter needs a string column, got {column:?}"),
                ));
            }
            Ok(FilterDescription::MultiSelect {
                column: position,
                values: values.clone(),
            })
        }
    }
}

fn resolve_select(select: &QuerySelect, table: &Table) -> Result<AggregatorDescription> {
    Ok(match select {
        QuerySelect::Count { column } => AggregatorDescription::Count {
            column: column
                .as_deref()
                .map(|c| resolve_column(table, c))
                .transpose()?,
        },
        QuerySelect::Sum { column } => {
            let position = resolve_column(table, column)?;
            let kind = table.columns[position as usize].kind;
            if !matches!(
                kind,
                ColumnKind::Integer | ColumnKind::Real | ColumnKind::Decimal | ColumnKind::Money
            ) {
                return Err(Error::validation(
                    "INVALID_SELECT",
                    format!("sum select needs a numeric column, got {column:?} ({kind})"),
                ));
            }
            AggregatorDescription::Sum { column: position }
        }
        QuerySelect::First { column } => AggregatorDescription::First {
            column: resolve_column(table, column)?,
        },
        QuerySelect::Last { column } => AggregatorDescription::Last {
            column: resolve_column(table, column)?,
        },
        QuerySelect::Random { column } => AggregatorDescription::Random {
            column: resolve_column(table, column)?,
        },
        QuerySelect::Distinct { column } => AggregatorDescription::Distinct {
            column: resolve_column(table, column)?,
        },
        QuerySelect::Exists => AggregatorDescription::Exists,
        QuerySelect::CountQuarters { column } => {
            let position = resolve_column(table, column)?;
            if !table.columns[position as usize].kind.is_date_compatible() {
                return Err(Error::validation(
                    "INVALID_SELECT",
                    format!("count-quarters select needs a date column, got {column:?}"),
                ));
            }
            AggregatorDescription::CountQuarters { column: position }
        }
        QuerySelect::PrefixText { column, prefix } => AggregatorDescription::PrefixText {
            column: resolve_column(table, column)?,
            prefix: prefix.clone(),
        },
    })
}

impl PlanDescription {
    /// Build a fresh runtime plan for one entity evaluation.
    pub fn build_plan(&self, dataset: &Dataset) -> Result<ConceptQueryPlan> {
        let root = build_node(&self.root, dataset, self.generate_date_aggregator)?;
        Ok(ConceptQueryPlan::new(root, self.generate_date_aggregator))
    }
}

fn build_node(
    description: &NodeDescription,
    dataset: &Dataset,
    aggregate_dates: bool,
) -> Result<PlanNode> {
    match description {
        NodeDescription::Leaf => Ok(PlanNode::Leaf(LeafNode::default())),
        NodeDescription::Concept {
            connector,
            concept,
            node,
            filters,
            aggregators,
        } => {
            let conn = dataset
                .connector(*connector)
                .ok_or_else(|| Error::execution(format!("unknown connector {connector}")))?;
            let tree = dataset
                .concept(*concept)
                .ok_or_else(|| Error::execution(format!("unknown concept tree {concept}")))?;
            if tree.node(*node).is_none() {
                return Err(Error::execution(format!(
                    "concept {} has no node {node}",
                    tree.name()
                )));
            }

            let mut subtree = HashSet::new();
            let mut stack = vec![*node];
            while let Some(current) = stack.pop() {
                subtree.insert(current);
                if let Some(n) = tree.node(current) {
                    stack.extend(&n.children);
                }
            }
            let subtree_mask = tree.subtree_bitmask(*node);

            let table = dataset
                .schema
                .tables
                .get(conn.table as usize)
                .ok_or_else(|| Error::execution(format!("connector {} without table", conn.name)))?;

            let filters = filters
                .iter()
                .map(|f| build_filter(f, table))
                .collect::<Result<Vec<_>>>()?;
            let aggregators = aggregators
                .iter()
                .map(|a| build_aggregator(a, table))
                .collect::<Result<Vec<_>>>()?;

            Ok(PlanNode::Concept(Box::new(ConceptPlanNode::new(
                conn.clone(),
                subtree,
                subtree_mask,
                filters,
                aggregators,
                aggregate_dates,
            ))))
        }
        NodeDescription::And(children) => Ok(PlanNode::And(
            children
                .iter()
                .map(|c| build_node(c, dataset, aggregate_dates))
                .collect::<Result<Vec<_>>>()?,
        )),
        NodeDescription::Or(children) => Ok(PlanNode::Or(
            children
                .iter()
                .map(|c| build_node(c, dataset, aggregate_dates))
                .collect::<Result<Vec<_>>>()?,
        )),
        NodeDescription::Negation(child) => Ok(PlanNode::Negation(Box::new(build_node(
            child,
            dataset,
            aggregate_dates,
        )?))),
        NodeDescription::DateRestriction { min, max, child } => {
            let range = match (min, max) {
                (Some(min), Some(max)) => DateRange::of(*min, *max),
                (Some(min), None) => DateRange::at_least(*min),
                (None, Some(max)) => DateRange::at_most(*max),
                (None, None) => DateRange::all(),
            };
            Ok(PlanNode::DateRestriction(Box::new(DateRestrictionNode {
                restriction: DateSet::from_range(range),
                child: build_node(child, dataset, aggregate_dates)?,
            })))
        }
    }
}

fn sum_state_for(kind: ColumnKind) -> SumState {
    match kind {
        ColumnKind::Real => SumState::Real(0.0),
        ColumnKind::Decimal => SumState::Decimal(0, 0),
        ColumnKind::Money => SumState::Money(0),
        _ => SumState::Integer(0),
    }
}

fn build_filter(description: &FilterDescription, table: &Table) -> Result<FilterNode> {
    Ok(match description {
        FilterDescription::CountRange { column, min, max } => FilterNode::count_range(
            *column,
            NumberRange {
                min: *min,
                max: *max,
            },
        ),
        FilterDescription::SumRange { column, min, max } => {
            let kind = table.columns[*column as usize].kind;
            FilterNode::sum_range(
                *column,
                sum_state_for(kind),
                NumberRange {
                    min: *min,
                    max: *max,
                },
            )
        }
        FilterDescription::MultiSelect { column, values } => {
            FilterNode::multi_select(*column, values.clone())
        }
    })
}

fn build_aggregator(description: &AggregatorDescription, table: &Table) -> Result<Aggregator> {
    Ok(match description {
        AggregatorDescription::Count { column } => Aggregator::count(*column),
        AggregatorDescription::Sum { column } => {
            let kind = table.columns[*column as usize].kind;
            Aggregator::sum(*column, sum_state_for(kind))
        }
        AggregatorDescription::First { column } => Aggregator::First {
            column: *column,
            best: None,
            validity: None,
        },
        AggregatorDescription::Last { column } => Aggregator::Last {
            column: *column,
            best: None,
            validity: None,
        },
        AggregatorDescription::Random { column } => Aggregator::random(*column),
        AggregatorDescription::Distinct { column } => Aggregator::Distinct {
            column: *column,
            seen: Default::default(),
        },
        AggregatorDescription::Exists => Aggregator::Exists { triggered: false },
        AggregatorDescription::CountQuarters { column } => Aggregator::CountQuarters {
            column: *column,
            quarters: Default::default(),
        },
        AggregatorDescription::PrefixText { column, prefix } => Aggregator::PrefixText {
            column: *column,
            prefix: prefix.clone(),
            seen: Default::default(),
        },
    })
}
