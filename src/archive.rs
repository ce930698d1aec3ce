//! Self-describing JSON archives of built forests.
//!
//! An archive stores the source, the word of every node in arena order and
//! the tree each codeword routes to, tagged by forest family. Loading replays
//! the nodes in that order, so no builder runs again and every [`NodeRef`]
//! of the archived forest points to the same word after a reload.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::config::MarkovForestParams;
use crate::error::{Error, Result};
use crate::forest::{AnyForest, Forest, ForestKind, NodeRef};
use crate::markov_forest::{coded_source, MarlinMarkovForest};
use crate::marlin::StateModel;
use crate::source::Source;
use crate::tree::{Tree, ROOT};

/// Nodes of one tree and their routes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TreeRecord {
    /// Requested size of the tree.
    pub size: usize,
    /// Word of every node but the root, as labels, in arena order.
    pub words: Vec<Vec<u32>>,
    /// Tree coding the word after `words[i]`; `None` for full nodes.
    pub next_tree: Vec<Option<usize>>,
}

/// A serialized forest of either family.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForestArchive {
    /// Any [`Forest`] built directly over its source.
    Plain {
        /// Algorithm the forest was built with.
        algorithm: ForestKind,
        /// Shared source.
        source: Source,
        /// Trees in routing order.
        trees: Vec<TreeRecord>,
    },
    /// A [`MarlinMarkovForest`].
    MarlinMarkov {
        /// Build parameters.
        params: MarkovForestParams,
        /// Source of the coded symbols, before meta-symbol grouping.
        original_source: Source,
        /// Per-tree state probabilities at the end of refinement.
        state_probabilities: Vec<Vec<f64>>,
        /// Trees in routing order.
        trees: Vec<TreeRecord>,
    },
}

fn records(forest: &Forest) -> Vec<TreeRecord> {
    forest
        .trees()
        .iter()
        .enumerate()
        .map(|(index, tree)| TreeRecord {
            size: tree.size(),
            words: (ROOT + 1..tree.arena_len())
                .map(|node| tree.word_labels(node))
                .collect(),
            next_tree: (ROOT + 1..tree.arena_len())
                .map(|node| forest.next_tree(NodeRef { tree: index, node }))
                .collect(),
        })
        .collect()
}

impl ForestArchive {
    /// Archive a plain forest.
    pub fn from_forest(forest: &Forest) -> Self {
        ForestArchive::Plain {
            algorithm: forest.kind(),
            source: forest.source().clone(),
            trees: records(forest),
        }
    }

    /// Archive a Marlin-Markov forest.
    pub fn from_markov_forest(forest: &MarlinMarkovForest) -> Self {
        ForestArchive::MarlinMarkov {
            params: *forest.params(),
            original_source: forest.original_source().clone(),
            state_probabilities: forest
                .models()
                .iter()
                .map(|model| model.probabilities().to_vec())
                .collect(),
            trees: records(forest.forest()),
        }
    }

    /// Archive either family.
    pub fn from_any(forest: &AnyForest) -> Self {
        match forest {
            AnyForest::Plain(forest) => Self::from_forest(forest),
            AnyForest::MarlinMarkov(forest) => Self::from_markov_forest(forest),
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse JSON produced by [`ForestArchive::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild the archived forest.
    ///
    /// # Errors
    /// `Error::CorruptedArchive` when a word does not extend an earlier one by
    /// exactly one symbol, or when routes are missing, misplaced or out of
    /// range.
    pub fn into_forest(self) -> Result<AnyForest> {
        match self {
            ForestArchive::Plain {
                algorithm,
                source,
                trees,
            } => {
                let (trees, routes) = rebuild_trees(&trees, &source)?;
                Ok(AnyForest::Plain(Forest::from_parts(
                    algorithm, source, trees, routes,
                )?))
            }
            ForestArchive::MarlinMarkov {
                params,
                original_source,
                state_probabilities,
                trees,
            } => {
                let (meta, source) = coded_source(&params, &original_source)?;
                if state_probabilities.len() != trees.len() {
                    return Err(Error::CorruptedArchive(format!(
                        "{} state vectors for {} trees",
                        state_probabilities.len(),
                        trees.len()
                    )));
                }
                let models = state_probabilities
                    .into_iter()
                    .map(|probabilities| {
                        let mut model = StateModel::new(&source);
                        if probabilities.len() != model.state_count() {
                            return Err(Error::CorruptedArchive(format!(
                                "{} state probabilities, {} states",
                                probabilities.len(),
                                model.state_count()
                            )));
                        }
                        model.set_probabilities(probabilities);
                        Ok(model)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let (trees, routes) = rebuild_trees(&trees, &source)?;
                let forest = Forest::from_parts(ForestKind::MarlinMarkov, source, trees, routes)?;
                Ok(AnyForest::MarlinMarkov(MarlinMarkovForest::from_parts(
                    params,
                    original_source,
                    meta,
                    forest,
                    models,
                )))
            }
        }
    }
}

type Routes = Vec<Vec<Option<usize>>>;

fn rebuild_trees(records: &[TreeRecord], source: &Source) -> Result<(Vec<Tree>, Routes)> {
    if records.is_empty() {
        return Err(Error::CorruptedArchive("no trees".into()));
    }
    let tree_count = records.len();
    let mut trees = Vec::with_capacity(tree_count);
    let mut routes = Vec::with_capacity(tree_count);
    for (index, record) in records.iter().enumerate() {
        let corrupted =
            |message: String| Error::CorruptedArchive(format!("tree {index}: {message}"));
        if record.words.len() != record.next_tree.len() {
            return Err(corrupted(format!(
                "{} words but {} routes",
                record.words.len(),
                record.next_tree.len()
            )));
        }

        let mut tree = Tree::empty(record.size, source);
        for word in &record.words {
            let positions = word
                .iter()
                .map(|&label| {
                    source
                        .position(label)
                        .ok_or_else(|| corrupted(format!("unknown label {label}")))
                })
                .collect::<Result<Vec<_>>>()?;
            let Some((&last, prefix)) = positions.split_last() else {
                return Err(corrupted("empty word".into()));
            };
            let mut parent = ROOT;
            for &position in prefix {
                parent = tree
                    .child(parent, position)
                    .ok_or_else(|| corrupted(format!("word {word:?} listed before its prefix")))?;
            }
            if tree.child(parent, last).is_some() {
                return Err(corrupted(format!("word {word:?} listed twice")));
            }
            tree.add_child(parent, last);
        }

        let mut table = vec![None];
        for (offset, &next) in record.next_tree.iter().enumerate() {
            let node = ROOT + 1 + offset;
            match next {
                Some(next) if next >= tree_count => {
                    return Err(corrupted(format!("route to tree {next} of {tree_count}")));
                }
                Some(_) if !tree.is_included(node) => {
                    return Err(corrupted(format!("full node {node} has a route")));
                }
                None if tree.is_included(node) => {
                    return Err(corrupted(format!("codeword {node} has no route")));
                }
                _ => table.push(next),
            }
        }
        trees.push(tree);
        routes.push(table);
    }
    Ok((trees, routes))
}

/// Write `forest` as a JSON archive.
pub fn dump<W: Write>(forest: &AnyForest, writer: W) -> Result<()> {
    serde_json::to_writer_pretty(writer, &ForestArchive::from_any(forest))?;
    Ok(())
}

/// Read a JSON archive written by [`dump`].
pub fn load<R: Read>(reader: R) -> Result<AnyForest> {
    let archive: ForestArchive = serde_json::from_reader(reader)?;
    archive.into_forest()
}
