//! Forests: several trees sharing one source plus a routing table.
//!
//! After a word is emitted, the routing table names the tree that codes the
//! next word. Plain forests other than trivial ones, which cycle through
//! their trees, route positionally: a word whose node has `c`
//! children tells the decoder that the next symbol is not one of the `c` most
//! probable ones, so it goes to tree `min(T - 1, c)`, which was built for that
//! context.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::builder::TreeBuilder;
use crate::error::{Error, Result};
use crate::markov_forest::MarlinMarkovForest;
use crate::source::Source;
use crate::tree::{NodeId, Tree, ROOT};

/// Algorithm a forest was built with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ForestKind {
    /// Trivial trees.
    Trivial,
    /// Tunstall trees.
    Tunstall,
    /// Yamamoto-Yokoo trees, one per context.
    Yamamoto,
    /// Fast Yamamoto trees, one per context.
    FastYamamoto,
    /// A single tree of any kind.
    SingleTree,
    /// Marlin-Markov trees with meta-symbols.
    MarlinMarkov,
    /// Trees reconstructed from a v2f header.
    Header,
}

impl ForestKind {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ForestKind::Trivial => "trivial",
            ForestKind::Tunstall => "tunstall",
            ForestKind::Yamamoto => "yamamoto",
            ForestKind::FastYamamoto => "fast_yamamoto",
            ForestKind::SingleTree => "single_tree",
            ForestKind::MarlinMarkov => "marlin_markov",
            ForestKind::Header => "header",
        }
    }
}

impl fmt::Display for ForestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of one tree of a forest.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    /// Tree index.
    pub tree: usize,
    /// Node inside the tree.
    pub node: NodeId,
}

/// Output of [`Forest::code`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedMessage {
    /// Emitted nodes, in order.
    pub nodes: Vec<NodeRef>,
    /// Coded size: one fixed-length word per node.
    pub bit_length: u64,
}

/// An ordered set of trees with inter-tree routing.
#[derive(Clone, Debug)]
pub struct Forest {
    kind: ForestKind,
    source: Source,
    trees: Vec<Tree>,
    // routes[tree][node], `None` for the root and full nodes.
    routes: Vec<Vec<Option<usize>>>,
}

impl Forest {
    pub(crate) fn from_parts(
        kind: ForestKind,
        source: Source,
        trees: Vec<Tree>,
        routes: Vec<Vec<Option<usize>>>,
    ) -> Result<Self> {
        if trees.is_empty() {
            return Err(Error::InvalidParameter("a forest needs at least one tree".into()));
        }
        if routes.len() != trees.len() {
            return Err(Error::InvalidParameter(format!(
                "{} routing tables for {} trees",
                routes.len(),
                trees.len()
            )));
        }
        for (index, (tree, table)) in trees.iter().zip(&routes).enumerate() {
            for node in tree.included_nodes() {
                match table.get(node).copied().flatten() {
                    Some(next) if next < trees.len() => {}
                    _ => {
                        return Err(Error::InvalidParameter(format!(
                            "node {node} of tree {index} has no valid next tree"
                        )))
                    }
                }
            }
        }
        Ok(Self {
            kind,
            source,
            trees,
            routes,
        })
    }

    /// Forest routed by `min(T - 1, children)`.
    pub(crate) fn positional(kind: ForestKind, source: Source, trees: Vec<Tree>) -> Result<Self> {
        let routes = positional_routes(&trees);
        Self::from_parts(kind, source, trees, routes)
    }

    fn with_builders(
        kind: ForestKind,
        source: &Source,
        plan: impl IntoIterator<Item = (TreeBuilder, usize)>,
    ) -> Result<Self> {
        let trees = plan
            .into_iter()
            .map(|(builder, size)| builder.build(size, source))
            .collect::<Result<Vec<_>>>()?;
        Self::positional(kind, source.clone(), trees)
    }

    /// One trivial tree per entry of `tree_sizes`.
    ///
    /// The `i`-th word of every tree routes to tree `i % T`, so with more
    /// than one tree the forest is not positionally routed.
    pub fn trivial(tree_sizes: &[usize], source: &Source) -> Result<Self> {
        let trees = tree_sizes
            .iter()
            .map(|&size| TreeBuilder::Trivial.build(size, source))
            .collect::<Result<Vec<_>>>()?;
        let count = trees.len().max(1);
        let routes = trees
            .iter()
            .map(|tree| {
                let mut table = vec![None; tree.arena_len()];
                for (i, &(_, node)) in tree.node(ROOT).children().iter().enumerate() {
                    table[node] = Some(i % count);
                }
                table
            })
            .collect();
        Self::from_parts(ForestKind::Trivial, source.clone(), trees, routes)
    }

    /// `tree_count` identical Tunstall trees.
    pub fn tunstall(max_tree_size: usize, tree_count: usize, source: &Source) -> Result<Self> {
        if source.len() < 2 {
            return Err(Error::InvalidParameter(
                "tunstall forests need at least two symbols".into(),
            ));
        }
        if tree_count == 0 {
            return Err(Error::InvalidParameter("tree_count must be positive".into()));
        }
        Self::with_builders(
            ForestKind::Tunstall,
            source,
            (0..tree_count).map(|_| (TreeBuilder::Tunstall, max_tree_size)),
        )
    }

    /// Yamamoto-Yokoo forest; tree `i` is built for context `i`.
    ///
    /// `tree_count` defaults to `A - 1` and must lie in `1..=A - 1`.
    pub fn yamamoto(
        max_included_size: usize,
        tree_count: Option<usize>,
        source: &Source,
    ) -> Result<Self> {
        let count = yamamoto_tree_count(tree_count, source)?;
        Self::with_builders(
            ForestKind::Yamamoto,
            source,
            (0..count).map(|i| {
                log::info!(
                    "Building yamamoto tree #{i} with {} symbols and size {max_included_size}",
                    source.len()
                );
                (
                    TreeBuilder::Yamamoto {
                        first_allowed_symbol_index: i,
                    },
                    max_included_size,
                )
            }),
        )
    }

    /// Fast Yamamoto forest; see [`Forest::yamamoto`].
    pub fn fast_yamamoto(
        max_included_size: usize,
        tree_count: Option<usize>,
        source: &Source,
    ) -> Result<Self> {
        let count = yamamoto_tree_count(tree_count, source)?;
        Self::with_builders(
            ForestKind::FastYamamoto,
            source,
            (0..count).map(|i| {
                log::info!(
                    "Building fast yamamoto tree #{i} with {} symbols and size {max_included_size}",
                    source.len()
                );
                (
                    TreeBuilder::FastYamamoto {
                        first_allowed_symbol_index: i,
                    },
                    max_included_size,
                )
            }),
        )
    }

    /// Wrap a single tree; every word routes back to it.
    pub fn from_tree(tree: Tree) -> Result<Self> {
        let source = tree.source().clone();
        Self::positional(ForestKind::SingleTree, source, vec![tree])
    }

    /// Algorithm the forest was built with.
    pub fn kind(&self) -> ForestKind {
        self.kind
    }

    /// Shared source.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Trees in routing order.
    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    /// Tree at `index`.
    pub fn tree(&self, index: usize) -> Option<&Tree> {
        self.trees.get(index)
    }

    /// Tree that codes the word after `node`, `None` for non-codewords.
    pub fn next_tree(&self, node: NodeRef) -> Option<usize> {
        self.routes.get(node.tree)?.get(node.node).copied().flatten()
    }

    /// Included nodes of every tree, tree by tree.
    pub fn included_nodes(&self) -> Vec<NodeRef> {
        self.trees
            .iter()
            .enumerate()
            .flat_map(|(index, tree)| {
                tree.included_nodes()
                    .into_iter()
                    .map(move |node| NodeRef { tree: index, node })
            })
            .collect()
    }

    /// Bits per emitted word: the widest tree decides.
    pub fn word_length_bits(&self) -> u32 {
        self.trees
            .iter()
            .map(Tree::word_length_bits)
            .max()
            .unwrap_or(1)
    }

    /// Expected input symbols per word, tree by tree.
    pub fn average_lengths(&self) -> Vec<f64> {
        self.trees.iter().map(Tree::average_length).collect()
    }

    /// Labels of the word of `node`.
    pub fn word(&self, node: NodeRef) -> Result<Vec<u32>> {
        let tree = self.checked_tree(node)?;
        Ok(tree.word_labels(node.node))
    }

    fn checked_tree(&self, node: NodeRef) -> Result<&Tree> {
        let tree = self.trees.get(node.tree).ok_or(Error::InvalidNodeRef)?;
        if node.node == ROOT || node.node >= tree.arena_len() {
            return Err(Error::InvalidNodeRef);
        }
        Ok(tree)
    }

    /// True if every included node routes to `min(T - 1, children)`.
    pub fn is_positionally_routed(&self) -> bool {
        let last = self.trees.len() - 1;
        self.trees.iter().zip(&self.routes).all(|(tree, table)| {
            tree.included_nodes().into_iter().all(|node| {
                table.get(node).copied().flatten() == Some(tree.children_count(node).min(last))
            })
        })
    }

    /// Start coding at tree 0.
    pub fn session(&self) -> CodingSession<'_> {
        CodingSession {
            forest: self,
            current_tree: 0,
        }
    }

    /// Code a label sequence.
    ///
    /// # Errors
    /// `Error::UnknownSymbol` for labels outside the alphabet and
    /// `Error::IncompleteDictionary` when a word cannot start in the current tree.
    pub fn code(&self, labels: &[u32]) -> Result<CodedMessage> {
        let positions = labels
            .iter()
            .map(|&label| self.source.position(label).ok_or(Error::UnknownSymbol(label)))
            .collect::<Result<Vec<_>>>()?;
        let nodes = self.code_positions(&positions)?;
        Ok(CodedMessage {
            bit_length: nodes.len() as u64 * u64::from(self.word_length_bits()),
            nodes,
        })
    }

    pub(crate) fn code_positions(&self, positions: &[usize]) -> Result<Vec<NodeRef>> {
        let mut session = self.session();
        let mut nodes = Vec::new();
        let mut rest = positions;
        while !rest.is_empty() {
            let (node, consumed) = session.code_one_word(rest)?;
            nodes.push(node);
            rest = &rest[consumed..];
        }
        Ok(nodes)
    }

    /// Concatenate the words of `nodes`.
    pub fn decode(&self, nodes: &[NodeRef]) -> Result<Vec<u32>> {
        let mut labels = Vec::new();
        for &node in nodes {
            let tree = self.checked_tree(node)?;
            labels.extend(tree.word_labels(node.node));
        }
        Ok(labels)
    }

    /// Descriptive name: algorithm, shape and source.
    pub fn name(&self) -> String {
        let max_size = self.trees.iter().map(Tree::size).max().unwrap_or(0);
        format!(
            "{}Forest_trees{}_size{}_{}",
            self.kind,
            self.trees.len(),
            max_size,
            self.source.name()
        )
    }
}

impl fmt::Display for Forest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let max_size = self.trees.iter().map(Tree::size).max().unwrap_or(0);
        write!(
            f,
            "[{} |F|={} |T|={} source={}]",
            self.kind,
            self.trees.len(),
            max_size,
            self.source
        )
    }
}

pub(crate) fn positional_routes(trees: &[Tree]) -> Vec<Vec<Option<usize>>> {
    let last = trees.len().saturating_sub(1);
    trees
        .iter()
        .map(|tree| {
            (0..tree.arena_len())
                .map(|node| {
                    tree.is_included(node)
                        .then(|| tree.children_count(node).min(last))
                })
                .collect()
        })
        .collect()
}

fn yamamoto_tree_count(tree_count: Option<usize>, source: &Source) -> Result<usize> {
    let max = source.len().saturating_sub(1);
    let count = tree_count.unwrap_or(max);
    if count == 0 || count > max {
        return Err(Error::InvalidParameter(format!(
            "requested {count} trees for a source with {} symbols; between 1 and {max} allowed",
            source.len()
        )));
    }
    Ok(count)
}

/// Coding cursor over a forest, one per message.
#[derive(Debug)]
pub struct CodingSession<'a> {
    forest: &'a Forest,
    current_tree: usize,
}

impl CodingSession<'_> {
    /// Tree that will code the next word.
    pub fn current_tree(&self) -> usize {
        self.current_tree
    }

    /// Code the longest word of the current tree prefixing `input` (symbol
    /// positions) and move to the next tree.
    ///
    /// Returns the emitted node and the number of consumed symbols.
    pub fn code_one_word(&mut self, input: &[usize]) -> Result<(NodeRef, usize)> {
        let tree = &self.forest.trees[self.current_tree];
        let (node, consumed) = tree.code_one_word(input)?;
        let emitted = NodeRef {
            tree: self.current_tree,
            node,
        };
        match self.forest.next_tree(emitted) {
            Some(next) => self.current_tree = next,
            // Only the last word may end inside a full node.
            None if consumed == input.len() => {}
            None => return Err(Error::IncompleteDictionary),
        }
        Ok((emitted, consumed))
    }
}

/// A forest of either family.
#[derive(Clone, Debug)]
pub enum AnyForest {
    /// Trivial, Tunstall, Yamamoto, single-tree or header forests.
    Plain(Forest),
    /// Marlin-Markov forest with meta-symbols.
    MarlinMarkov(MarlinMarkovForest),
}

impl AnyForest {
    /// The underlying trees and routing.
    pub fn forest(&self) -> &Forest {
        match self {
            AnyForest::Plain(forest) => forest,
            AnyForest::MarlinMarkov(markov) => markov.forest(),
        }
    }

    /// Descriptive name.
    pub fn name(&self) -> String {
        match self {
            AnyForest::Plain(forest) => forest.name(),
            AnyForest::MarlinMarkov(markov) => markov.name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dyadic() -> Source {
        Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap()
    }

    #[test]
    fn test_tunstall_forest_roundtrip() {
        let source = dyadic();
        let forest = Forest::tunstall(8, 2, &source).unwrap();
        let input = vec![0, 0, 1, 3, 2, 0, 1, 0, 0, 0, 3];
        let coded = forest.code(&input).unwrap();
        assert_eq!(forest.decode(&coded.nodes).unwrap(), input);
        assert_eq!(
            coded.bit_length,
            coded.nodes.len() as u64 * u64::from(forest.word_length_bits())
        );
    }

    #[test]
    fn test_routes_follow_children_count() {
        let source = dyadic();
        let forest = Forest::yamamoto(12, None, &source).unwrap();
        assert_eq!(forest.trees().len(), 3);
        assert!(forest.is_positionally_routed());
        for node in forest.included_nodes() {
            let tree = forest.tree(node.tree).unwrap();
            assert_eq!(
                forest.next_tree(node),
                Some(tree.children_count(node.node).min(2))
            );
        }
    }

    #[test]
    fn test_yamamoto_forest_roundtrip() {
        let source = dyadic();
        for forest in [
            Forest::yamamoto(10, None, &source).unwrap(),
            Forest::fast_yamamoto(10, Some(2), &source).unwrap(),
        ] {
            let input = vec![0, 1, 0, 0, 2, 3, 3, 0, 1, 1, 0, 0, 0, 0, 2];
            let coded = forest.code(&input).unwrap();
            assert_eq!(forest.decode(&coded.nodes).unwrap(), input);
        }
    }

    #[test]
    fn test_tree_count_bounds() {
        let source = dyadic();
        assert!(matches!(
            Forest::yamamoto(8, Some(4), &source),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Forest::fast_yamamoto(8, Some(0), &source),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            Forest::tunstall(8, 0, &source),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_unknown_symbol() {
        let forest = Forest::trivial(&[4], &dyadic()).unwrap();
        assert!(matches!(forest.code(&[0, 9]), Err(Error::UnknownSymbol(9))));
    }

    #[test]
    fn test_trivial_forest_cycles_through_trees() {
        let forest = Forest::trivial(&[4, 4, 4], &dyadic()).unwrap();
        for (tree_index, tree) in forest.trees().iter().enumerate() {
            for (i, &(_, node)) in tree.node(ROOT).children().iter().enumerate() {
                let node = NodeRef { tree: tree_index, node };
                assert_eq!(forest.next_tree(node), Some(i % 3));
            }
        }
        assert!(!forest.is_positionally_routed());
        assert!(Forest::trivial(&[4], &dyadic()).unwrap().is_positionally_routed());

        let mut session = forest.session();
        let positions: Vec<usize> = [1u32, 2, 3, 0]
            .iter()
            .map(|&label| forest.source().position(label).unwrap())
            .collect();
        let mut visited = Vec::new();
        let mut rest = positions.as_slice();
        while !rest.is_empty() {
            visited.push(session.current_tree());
            let (_, consumed) = session.code_one_word(rest).unwrap();
            rest = &rest[consumed..];
        }
        assert_eq!(visited, vec![0, 1, 2, 0]);
    }

    #[test]
    fn test_empty_message() {
        let forest = Forest::trivial(&[4, 4], &dyadic()).unwrap();
        let coded = forest.code(&[]).unwrap();
        assert!(coded.nodes.is_empty());
        assert_eq!(coded.bit_length, 0);
        assert!(forest.decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_last_word_may_end_inside() {
        let source = dyadic();
        let forest = Forest::tunstall(8, 1, &source).unwrap();
        // "0" alone is a full node of the tunstall tree; it can only end a message.
        let coded = forest.code(&[1, 0]).unwrap();
        let last = *coded.nodes.last().unwrap();
        assert_eq!(forest.next_tree(last), None);
        assert_eq!(forest.decode(&coded.nodes).unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_invalid_node_refs() {
        let forest = Forest::trivial(&[4], &dyadic()).unwrap();
        assert!(matches!(
            forest.decode(&[NodeRef { tree: 0, node: ROOT }]),
            Err(Error::InvalidNodeRef)
        ));
        assert!(matches!(
            forest.decode(&[NodeRef { tree: 3, node: 1 }]),
            Err(Error::InvalidNodeRef)
        ));
        assert!(matches!(
            forest.word(NodeRef { tree: 0, node: 99 }),
            Err(Error::InvalidNodeRef)
        ));
    }

    #[test]
    fn test_single_tree_forest() {
        let tree = TreeBuilder::MarlinBase.build(16, &dyadic()).unwrap();
        let forest = Forest::from_tree(tree).unwrap();
        assert_eq!(forest.kind(), ForestKind::SingleTree);
        assert!(forest
            .included_nodes()
            .iter()
            .all(|&node| forest.next_tree(node) == Some(0)));
        assert_eq!(forest.word_length_bits(), 4);
    }

    #[test]
    fn test_missing_route_is_rejected() {
        let source = dyadic();
        let tree = TreeBuilder::Trivial.build(4, &source).unwrap();
        let routes = vec![vec![None; tree.arena_len()]];
        assert!(Forest::from_parts(ForestKind::Trivial, source, vec![tree], routes).is_err());
    }
}
