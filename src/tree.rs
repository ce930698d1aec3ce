//! Coding tree arena.
//!
//! Nodes live in a flat vector and refer to each other by [`NodeId`]. The
//! root is always [`ROOT`] and carries no edge symbol. Edge symbols are stored
//! as positions in the source's probability order, so the `k`-th child added
//! to a node by the builders is always the `k`-th most probable symbol.

use std::collections::BTreeSet;

use crate::error::{Error, Result};
use crate::source::{Source, Symbol};

/// Index of a node inside its tree.
pub type NodeId = usize;

/// The root node of every tree.
pub const ROOT: NodeId = 0;

/// One node of a coding tree.
#[derive(Clone, Debug)]
pub struct Node {
    symbol: Option<usize>,
    parent: Option<NodeId>,
    children: Vec<(usize, NodeId)>,
    raw_probability: f64,
    depth: usize,
    first_symbol: usize,
}

impl Node {
    fn root() -> Self {
        Self {
            symbol: None,
            parent: None,
            children: Vec::new(),
            raw_probability: 1.0,
            depth: 0,
            first_symbol: 0,
        }
    }

    /// Position of the edge symbol, `None` for the root.
    pub fn symbol(&self) -> Option<usize> {
        self.symbol
    }

    /// Parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// `(symbol position, child)` pairs in insertion order.
    pub fn children(&self) -> &[(usize, NodeId)] {
        &self.children
    }
}

/// A V2F coding tree: the words of its included nodes form one dictionary.
#[derive(Clone, Debug)]
pub struct Tree {
    size: usize,
    source: Source,
    nodes: Vec<Node>,
}

impl Tree {
    /// Create a tree holding only the root.
    ///
    /// # Errors
    /// Returns `Error::TreeTooSmall` if `size` cannot hold every symbol once.
    pub fn new(size: usize, source: &Source) -> Result<Self> {
        if size < source.len() {
            return Err(Error::TreeTooSmall {
                size,
                alphabet: source.len(),
            });
        }
        Ok(Self::empty(size, source))
    }

    pub(crate) fn empty(size: usize, source: &Source) -> Self {
        Self {
            size,
            source: source.clone(),
            nodes: vec![Node::root()],
        }
    }

    /// Drop every node but the root.
    pub(crate) fn reset(&mut self) {
        self.nodes.truncate(1);
        self.nodes[ROOT].children.clear();
    }

    /// Requested number of included nodes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Source this tree was built for.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Number of symbols in the alphabet.
    pub fn alphabet_size(&self) -> usize {
        self.source.len()
    }

    /// Access a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Number of slots in the arena, root included.
    pub(crate) fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// Number of nodes, root excluded.
    pub fn node_count(&self) -> usize {
        self.nodes.len() - 1
    }

    /// Add a child for the symbol at `position` and return it.
    pub fn add_child(&mut self, parent: NodeId, position: usize) -> NodeId {
        debug_assert!(
            self.child(parent, position).is_none(),
            "node {parent} already has a child for symbol position {position}"
        );
        let id = self.nodes.len();
        let parent_node = &self.nodes[parent];
        let node = Node {
            symbol: Some(position),
            parent: Some(parent),
            children: Vec::new(),
            raw_probability: parent_node.raw_probability
                * self.source.symbol(position).probability,
            depth: parent_node.depth + 1,
            first_symbol: if parent == ROOT {
                position
            } else {
                parent_node.first_symbol
            },
        };
        self.nodes.push(node);
        self.nodes[parent].children.push((position, id));
        id
    }

    /// Follow or create the path for a word given as symbol positions.
    pub(crate) fn insert_word(&mut self, word: &[usize]) -> NodeId {
        let mut current = ROOT;
        for &position in word {
            current = match self.child(current, position) {
                Some(next) => next,
                None => self.add_child(current, position),
            };
        }
        current
    }

    /// Child of `node` for the symbol at `position`.
    pub fn child(&self, node: NodeId, position: usize) -> Option<NodeId> {
        self.nodes[node]
            .children
            .iter()
            .find(|&&(p, _)| p == position)
            .map(|&(_, id)| id)
    }

    /// Number of children of `node`.
    pub fn children_count(&self, node: NodeId) -> usize {
        self.nodes[node].children.len()
    }

    /// True if `node` is a codeword: not the root and not fully expanded.
    pub fn is_included(&self, node: NodeId) -> bool {
        node != ROOT && self.nodes[node].children.len() < self.alphabet_size()
    }

    /// Number of symbols in the word of `node`.
    pub fn depth(&self, node: NodeId) -> usize {
        self.nodes[node].depth
    }

    /// Position of the first symbol of the word, `None` for the root.
    pub fn first_symbol(&self, node: NodeId) -> Option<usize> {
        (node != ROOT).then(|| self.nodes[node].first_symbol)
    }

    /// Symbol positions from the root down to `node`.
    pub fn word_positions(&self, node: NodeId) -> Vec<usize> {
        let mut word = Vec::with_capacity(self.nodes[node].depth);
        let mut current = node;
        while let Some(position) = self.nodes[current].symbol {
            word.push(position);
            current = match self.nodes[current].parent {
                Some(parent) => parent,
                None => break,
            };
        }
        word.reverse();
        word
    }

    /// Symbols from the root down to `node`.
    pub fn word(&self, node: NodeId) -> Vec<Symbol> {
        self.word_positions(node)
            .into_iter()
            .map(|p| self.source.symbol(p))
            .collect()
    }

    /// Labels from the root down to `node`.
    pub fn word_labels(&self, node: NodeId) -> Vec<u32> {
        self.word_positions(node)
            .into_iter()
            .map(|p| self.source.symbol(p).label)
            .collect()
    }

    /// Product of the symbol probabilities along the word.
    pub fn raw_word_probability(&self, node: NodeId) -> f64 {
        self.nodes[node].raw_probability
    }

    /// Raw word probability minus the mass claimed by existing children.
    pub fn word_probability(&self, node: NodeId) -> f64 {
        let node = &self.nodes[node];
        let claimed: f64 = node
            .children
            .iter()
            .map(|&(position, _)| self.source.symbol(position).probability)
            .sum();
        node.raw_probability * (1.0 - claimed)
    }

    /// All nodes except the root, depth first with the last added child visited first.
    pub fn nodes_depth_first(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.node_count());
        let mut pending: Vec<NodeId> =
            self.nodes[ROOT].children.iter().map(|&(_, id)| id).collect();
        while let Some(node) = pending.pop() {
            order.push(node);
            pending.extend(self.nodes[node].children.iter().map(|&(_, id)| id));
        }
        order
    }

    /// Included nodes in depth-first order.
    pub fn included_nodes(&self) -> Vec<NodeId> {
        self.nodes_depth_first()
            .into_iter()
            .filter(|&node| self.is_included(node))
            .collect()
    }

    /// Number of included nodes.
    pub fn included_count(&self) -> usize {
        (1..self.nodes.len()).filter(|&n| self.is_included(n)).count()
    }

    /// Set of words (as labels) of the included nodes.
    pub fn word_set(&self) -> BTreeSet<Vec<u32>> {
        self.included_nodes()
            .into_iter()
            .map(|node| self.word_labels(node))
            .collect()
    }

    /// Sum of the word probabilities of the included nodes.
    pub fn probability_sum(&self) -> f64 {
        self.included_nodes()
            .into_iter()
            .map(|node| self.word_probability(node))
            .sum()
    }

    /// Expected number of input symbols per emitted word.
    pub fn average_length(&self) -> f64 {
        self.included_nodes()
            .into_iter()
            .map(|node| self.word_probability(node) * self.depth(node) as f64)
            .sum()
    }

    /// Bits needed to index the included nodes, at least 1.
    pub fn word_length_bits(&self) -> u32 {
        bits_for(self.included_count()).max(1)
    }

    /// Match the longest word prefixing `input` (symbol positions).
    ///
    /// Returns the matched node and the number of consumed symbols. The match
    /// only ends on a non-included node when the input runs out inside it.
    pub fn code_one_word(&self, input: &[usize]) -> Result<(NodeId, usize)> {
        let mut current = ROOT;
        let mut consumed = 0;
        for &position in input {
            match self.child(current, position) {
                Some(next) => {
                    current = next;
                    consumed += 1;
                }
                None => break,
            }
        }
        if consumed == 0 {
            return Err(Error::IncompleteDictionary);
        }
        Ok((current, consumed))
    }

    pub(crate) fn warn_if_under_capacity(&self, builder: &str) {
        let included = self.included_count();
        if included < self.size {
            log::warn!(
                "{builder} produced {included} < size {} included nodes for {}",
                self.size,
                self.source
            );
        }
    }
}

/// `ceil(log2(n))`, 0 for `n <= 1`.
pub(crate) fn bits_for(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dyadic() -> Source {
        Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap()
    }

    #[test]
    fn test_words_and_probabilities() {
        let source = dyadic();
        let mut tree = Tree::new(4, &source).unwrap();
        let a = tree.add_child(ROOT, 0);
        let b = tree.add_child(a, 1);
        assert_eq!(tree.word_labels(b), vec![0, 1]);
        assert_eq!(tree.depth(b), 2);
        assert_eq!(tree.first_symbol(b), Some(0));
        assert_eq!(tree.first_symbol(ROOT), None);
        assert!((tree.raw_word_probability(b) - 0.125).abs() < 1e-15);
        // `a` keeps the mass of every symbol but the one `b` claims.
        assert!((tree.word_probability(a) - 0.375).abs() < 1e-15);
        assert!((tree.word_probability(b) - 0.125).abs() < 1e-15);
        assert!(tree.is_included(a));
        assert!(!tree.is_included(ROOT));
    }

    #[test]
    fn test_full_node_is_not_included() {
        let source = dyadic();
        let mut tree = Tree::new(4, &source).unwrap();
        let a = tree.add_child(ROOT, 0);
        for p in 0..4 {
            tree.add_child(a, p);
        }
        assert!(!tree.is_included(a));
        assert!(tree.word_probability(a).abs() < 1e-15);
        assert_eq!(tree.included_count(), 4);
        assert_eq!(tree.node_count(), 5);
    }

    #[test]
    fn test_code_one_word_longest_match() {
        let source = dyadic();
        let mut tree = Tree::new(4, &source).unwrap();
        for p in 0..4 {
            tree.add_child(ROOT, p);
        }
        let zero = tree.child(ROOT, 0).unwrap();
        let zero_one = tree.add_child(zero, 1);

        assert_eq!(tree.code_one_word(&[0, 1, 2]).unwrap(), (zero_one, 2));
        assert_eq!(tree.code_one_word(&[0, 2]).unwrap(), (zero, 1));
        assert!(matches!(
            tree.code_one_word(&[]),
            Err(Error::IncompleteDictionary)
        ));
    }

    #[test]
    fn test_insert_word_and_reset() {
        let source = dyadic();
        let mut tree = Tree::new(4, &source).unwrap();
        let node = tree.insert_word(&[2, 0, 1]);
        assert_eq!(tree.word_positions(node), vec![2, 0, 1]);
        assert_eq!(tree.insert_word(&[2, 0, 1]), node);
        assert_eq!(tree.node_count(), 3);
        tree.reset();
        assert_eq!(tree.node_count(), 0);
        assert_eq!(tree.children_count(ROOT), 0);
    }

    #[test]
    fn test_too_small() {
        let source = dyadic();
        assert!(matches!(
            Tree::new(3, &source),
            Err(Error::TreeTooSmall { size: 3, alphabet: 4 })
        ));
    }

    #[test]
    fn test_bits_for() {
        assert_eq!(bits_for(0), 0);
        assert_eq!(bits_for(1), 0);
        assert_eq!(bits_for(2), 1);
        assert_eq!(bits_for(7), 3);
        assert_eq!(bits_for(8), 3);
        assert_eq!(bits_for(9), 4);
    }
}
