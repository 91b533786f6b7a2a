//! Arena-backed concept trees.
//!
//! Nodes live in a flat vector and reference each other by index: a node
//! stores an optional parent index and its owned child indices, so the
//! hierarchy has no ownership cycles and ancestor walks are cheap array
//! hops. Bit positions are assigned in insertion order; they key the
//! per-entity `included_concepts` bitmask of every CBlock.

use crate::concepts::conditions::{Condition, LazyRow};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Index of a node within its tree's arena. The root is always `0`.
pub type NodeIndex = u32;

/// One node of a concept tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptTreeNode {
    /// Node label, unique among siblings
    pub label: String,
    /// Match condition; the root carries none
    pub condition: Option<Condition>,
    /// Parent arena index, `None` for the root
    pub parent: Option<NodeIndex>,
    /// Child arena indices in declaration order
    pub children: Vec<NodeIndex>,
    /// Depth below the root (root = 0)
    pub depth: u32,
    /// Bit position for bitmask pre-filtering, assigned in insertion order
    pub bit: u16,
}

/// Per-node prefix lookup accelerating child resolution.
///
/// Built only for nodes whose children all carry prefix conditions: the
/// common prefix length keys a map from value prefix to the candidate
/// children sharing it, replacing a linear scan over all children.
#[derive(Debug, Clone, Default)]
struct ChildPrefixIndex {
    prefix_len: usize,
    candidates: HashMap<Vec<u8>, Vec<NodeIndex>>,
}

/// A concept tree: one root concept and its arena of descendant nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptTree {
    name: String,
    nodes: Vec<ConceptTreeNode>,
    #[serde(skip)]
    prefix_indexes: HashMap<NodeIndex, ChildPrefixIndex>,
}

impl ConceptTree {
    /// New tree containing only the root node.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            nodes: vec![ConceptTreeNode {
                label: name.clone(),
                condition: None,
                parent: None,
                children: Vec::new(),
                depth: 0,
                bit: 0,
            }],
            name,
            prefix_indexes: HashMap::new(),
        }
    }

    /// Tree name (the root concept's name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Arena index of the root.
    pub fn root(&self) -> NodeIndex {
        0
    }

    /// Number of nodes including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the tree holds only the root.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Node by arena index.
    pub fn node(&self, index: NodeIndex) -> Option<&ConceptTreeNode> {
        self.nodes.get(index as usize)
    }

    /// Append a child under `parent`, assigning the next bit position.
    pub fn add_child(
        &mut self,
        parent: NodeIndex,
        label: impl Into<String>,
        condition: Condition,
    ) -> Result<NodeIndex> {
        let depth = self
            .node(parent)
            .ok_or_else(|| Error::concept(format!("no node at index {parent}")))?
            .depth
            + 1;
        let index = self.nodes.len() as NodeIndex;
        let bit = (self.nodes.len() % 64) as u16;
        self.nodes.push(ConceptTreeNode {
            label: label.into(),
            condition: Some(condition),
            parent: Some(parent),
            children: Vec::new(),
            depth,
            bit,
        });
        self.nodes[parent as usize].children.push(index);
        Ok(index)
    }

    /// Resolve a dotted label path (`root.child.grandchild`) to a node.
    pub fn resolve_path(&self, path: &str) -> Option<NodeIndex> {
        let mut segments = path.split('.');
        if segments.next()? != self.name {
            return None;
        }
        let mut current = self.root();
        for segment in segments {
            current = *self.nodes[current as usize]
                .children
                .iter()
                .find(|&&c| self.nodes[c as usize].label == segment)?;
        }
        Some(current)
    }

    /// Ancestor chain from `node` up to and including the root.
    pub fn ancestor_chain(&self, node: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::successors(Some(node), move |&n| self.nodes[n as usize].parent)
    }

    /// Whether `node` equals `ancestor` or lies below it.
    pub fn is_self_or_descendant(&self, node: NodeIndex, ancestor: NodeIndex) -> bool {
        self.ancestor_chain(node).any(|n| n == ancestor)
    }

    /// Bitmask covering `node` and everything below it, for cheap
    /// entity-level pruning against `included_concepts`.
    pub fn subtree_bitmask(&self, node: NodeIndex) -> u64 {
        let mut mask = 0u64;
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let n = &self.nodes[current as usize];
            mask |= 1u64 << (n.bit % 64);
            stack.extend(&n.children);
        }
        mask
    }

    /// Build the child-prefix indexes. Called once before CBlock
    /// calculation; idempotent.
    pub fn build_prefix_index(&mut self) {
        self.prefix_indexes.clear();
        for index in 0..self.nodes.len() as NodeIndex {
            let node = &self.nodes[index as usize];
            if node.children.len() < 2 {
                continue;
            }
            let mut prefix_len = usize::MAX;
            let mut prefixed: Vec<(NodeIndex, Vec<String>)> = Vec::new();
            let mut indexable = true;
            for &child in &node.children {
                let condition = self.nodes[child as usize].condition.as_ref();
                match condition.and_then(Condition::index_prefixes) {
                    Some(prefixes) => {
                        for p in prefixes {
                            prefix_len = prefix_len.min(p.len());
                        }
                        prefixed.push((child, prefixes.to_vec()));
                    }
                    None => {
                        indexable = false;
                        break;
                    }
                }
            }
            if !indexable || prefix_len == 0 || prefix_len == usize::MAX {
                continue;
            }
            let mut candidates: HashMap<Vec<u8>, Vec<NodeIndex>> = HashMap::new();
            for (child, prefixes) in prefixed {
                for prefix in prefixes {
                    let key = prefix.as_bytes()[..prefix_len].to_vec();
                    let bucket = candidates.entry(key).or_default();
                    if !bucket.contains(&child) {
                        bucket.push(child);
                    }
                }
            }
            self.prefix_indexes.insert(
                index,
                ChildPrefixIndex {
                    prefix_len,
                    candidates,
                },
            );
        }
    }

    /// Children of `node` worth testing against `value`, narrowed by the
    /// prefix index where one exists.
    fn candidate_children(&self, node: NodeIndex, value: &str) -> &[NodeIndex] {
        if let Some(index) = self.prefix_indexes.get(&node) {
            if value.len() < index.prefix_len {
                return &[];
            }
            return index
                .candidates
                .get(&value.as_bytes()[..index.prefix_len])
                .map(Vec::as_slice)
                .unwrap_or(&[]);
        }
        &self.nodes[node as usize].children
    }

    /// Deepest descendant whose condition chain accepts `value`.
    ///
    /// Children are tested in declaration order and the first accepting
    /// child wins at each level, which also settles equal-specificity ties.
    /// Returns `None` when no child of the root accepts the value; the root
    /// itself never counts as a match.
    pub fn find_most_specific_child(&self, value: &str, row: &LazyRow<'_>) -> Option<NodeIndex> {
        let mut current = self.root();
        let mut best = None;
        loop {
            let mut matched = None;
            for &child in self.candidate_children(current, value) {
                let node = &self.nodes[child as usize];
                let accepts = node
                    .condition
                    .as_ref()
                    .map(|c| c.matches(value, row))
                    .unwrap_or(false);
                if accepts {
                    matched = Some(child);
                    break;
                }
            }
            match matched {
                Some(child) => {
                    best = Some(child);
                    current = child;
                }
                None => break,
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Bucket;
    use crate::schema::Column;

    fn empty_row_fixture() -> (Bucket, Vec<Column>) {
        (Bucket::empty(), Vec::new())
    }

    fn icd_tree() -> ConceptTree {
        let mut tree = ConceptTree::new("icd");
        let a = tree
            .add_child(
                0,
                "infectious",
                Condition::Prefix {
                    prefixes: vec!["A".into()],
                },
            )
            .unwrap();
        tree.add_child(
            a,
            "cholera",
            Condition::Prefix {
                prefixes: vec!["A00".into()],
            },
        )
        .unwrap();
        tree.add_child(
            a,
            "typhoid",
            Condition::Prefix {
                prefixes: vec!["A01".into()],
            },
        )
        .unwrap();
        tree.add_child(
            0,
            "neoplasms",
            Condition::Prefix {
                prefixes: vec!["C".into()],
            },
        )
        .unwrap();
        tree.build_prefix_index();
        tree
    }

    #[test]
    fn test_most_specific_resolution() {
        let tree = icd_tree();
        let (bucket, columns) = empty_row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);

        let typhoid = tree.resolve_path("icd.infectious.typhoid").unwrap();
        assert_eq!(tree.find_most_specific_child("A01.3", &row), Some(typhoid));

        let infectious = tree.resolve_path("icd.infectious").unwrap();
        assert_eq!(tree.find_most_specific_child("A99", &row), Some(infectious));

        assert_eq!(tree.find_most_specific_child("Z00", &row), None);
    }

    #[test]
    fn test_ancestor_chain_reaches_root() {
        let tree = icd_tree();
        let typhoid = tree.resolve_path("icd.infectious.typhoid").unwrap();
        let chain: Vec<NodeIndex> = tree.ancestor_chain(typhoid).collect();
        assert_eq!(chain.last(), Some(&tree.root()));
        assert_eq!(chain.len(), 3);
    }

    #[test]
    fn test_is_self_or_descendant() {
        let tree = icd_tree();
        let infectious = tree.resolve_path("icd.infectious").unwrap();
        let typhoid = tree.resolve_path("icd.infectious.typhoid").unwrap();
        let neoplasms = tree.resolve_path("icd.neoplasms").unwrap();

        assert!(tree.is_self_or_descendant(typhoid, infectious));
        assert!(tree.is_self_or_descendant(typhoid, typhoid));
        assert!(!tree.is_self_or_descendant(typhoid, neoplasms));
    }

    #[test]
    fn test_first_declared_child_wins_ties() {
        let mut tree = ConceptTree::new("t");
        let first = tree
            .add_child(
                0,
                "first",
                Condition::Prefix {
                    prefixes: vec!["X".into()],
                },
            )
            .unwrap();
        tree.add_child(
            0,
            "second",
            Condition::Prefix {
                prefixes: vec!["X".into()],
            },
        )
        .unwrap();
        tree.build_prefix_index();

        let (bucket, columns) = empty_row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        assert_eq!(tree.find_most_specific_child("X1", &row), Some(first));
    }

    #[test]
    fn test_prefix_index_narrow_candidates() {
        let tree = icd_tree();
        let (bucket, columns) = empty_row_fixture();
        let row = LazyRow::new(&bucket, &columns, 0);
        // Empty value is shorter than the indexed prefix and must not panic.
        assert_eq!(tree.find_most_specific_child("", &row), None);
    }

    #[test]
    fn test_subtree_bitmask_covers_descendants() {
        let tree = icd_tree();
        let infectious = tree.resolve_path("icd.infectious").unwrap();
        let mask = tree.subtree_bitmask(infectious);
        for path in ["icd.infectious", "icd.infectious.cholera", "icd.infectious.typhoid"] {
            let node = tree.resolve_path(path).unwrap();
            let bit = tree.node(node).unwrap().bit;
            assert_ne!(mask & (1 << (bit % 64)), 0, "missing bit for {path}");
        }
    }
}
