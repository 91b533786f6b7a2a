//! Hierarchical domain vocabulary: concept trees, match conditions,
//! connectors and the per-import resolution cache.

pub mod cache;
pub mod conditions;
pub mod connector;
pub mod tree;

pub use cache::ConceptTreeCache;
pub use conditions::{Condition, LazyRow};
pub use connector::Connector;
pub use tree::{ConceptTree, ConceptTreeNode};

use crate::schema::{ConnectorId, DatasetSchema};
use serde::{Deserialize, Serialize};

/// A dataset: schema plus the concept vocabulary bound to it.
///
/// Registered once, immutable afterwards; both the manager (for query
/// resolution) and every worker (for CBlock builds and plan evaluation)
/// hold a copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    /// Tables and sharding parameters
    pub schema: DatasetSchema,
    /// Concept trees in index order
    pub concepts: Vec<ConceptTree>,
    /// Connectors in id order
    pub connectors: Vec<Connector>,
}

impl Dataset {
    /// Connector by id.
    pub fn connector(&self, id: ConnectorId) -> Option<&Connector> {
        self.connectors.get(id.0 as usize)
    }

    /// Concept tree by index.
    pub fn concept(&self, index: u16) -> Option<&ConceptTree> {
        self.concepts.get(index as usize)
    }

    /// Concept tree by name.
    pub fn concept_by_name(&self, name: &str) -> Option<(u16, &ConceptTree)> {
        self.concepts
            .iter()
            .enumerate()
            .find(|(_, tree)| tree.name() == name)
            .map(|(i, tree)| (i as u16, tree))
    }

    /// Connectors bound to a concept tree.
    pub fn connectors_of_concept(&self, concept: u16) -> impl Iterator<Item = &Connector> {
        self.connectors.iter().filter(move |c| c.concept == concept)
    }

    /// Rebuild transient indexes after deserialization.
    pub fn rebuild_indexes(&mut self) {
        for tree in &mut self.concepts {
            tree.build_prefix_index();
        }
    }
}
