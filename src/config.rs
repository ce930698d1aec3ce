//! Build parameters for trees and forests.
//!
//! Every forest algorithm is described by one [`ForestParams`] variant,
//! tagged by algorithm name so a JSON configuration selects the builder.
//! [`ForestParams::build`] is the single dispatch point.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::forest::{AnyForest, Forest};
use crate::markov_forest::MarlinMarkovForest;
use crate::source::Source;

/// Limits for the Markov state-probability refinement loops.
///
/// One tolerance drives both stopping rules: a tree stops when the L1 change
/// of its state probabilities drops below `tolerance`, a forest when the mean
/// squared change does.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RefinementConfig {
    /// Maximum number of rebuild rounds. Running out is a soft stop.
    pub max_iterations: usize,
    /// Stopping threshold on the state-probability change between rounds.
    pub tolerance: f64,
    /// L1 threshold of the power iteration used to find stationary state probabilities.
    pub power_tolerance: f64,
    /// Maximum number of power-iteration steps per round.
    pub max_power_iterations: usize,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            power_tolerance: 1e-12,
            max_power_iterations: 10_000,
        }
    }
}

/// Parameters of a Marlin forest with Markov refinement.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct MarkovForestParams {
    /// Each tree has `2^k` included nodes.
    pub k: u32,
    /// The forest has `2^o` trees.
    pub o: u32,
    /// Meta-symbols group `2^s` consecutive symbols.
    pub s: u32,
    /// Meta-symbols are kept until their cumulative probability reaches
    /// `1 - symbol_p_threshold`; the rest are escaped and sent raw.
    #[serde(default)]
    pub symbol_p_threshold: f64,
    /// Refinement limits.
    #[serde(default)]
    pub refinement: RefinementConfig,
}

impl MarkovForestParams {
    /// Parameters with no escaping and default refinement limits.
    pub fn new(k: u32, o: u32, s: u32) -> Self {
        Self {
            k,
            o,
            s,
            symbol_p_threshold: 0.0,
            refinement: RefinementConfig::default(),
        }
    }
}

/// Parameters of any forest algorithm, tagged by algorithm name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum ForestParams {
    /// One trivial tree per entry.
    Trivial {
        /// Size of each tree.
        tree_sizes: Vec<usize>,
    },
    /// `tree_count` Tunstall trees.
    Tunstall {
        /// Size of every tree.
        max_tree_size: usize,
        /// Number of trees.
        tree_count: usize,
    },
    /// Yamamoto-Yokoo forest.
    Yamamoto {
        /// Included nodes per tree.
        max_included_size: usize,
        /// Number of trees, one per symbol but the last when absent.
        #[serde(default)]
        tree_count: Option<usize>,
    },
    /// Yamamoto forest without the S1/S2 comparison.
    FastYamamoto {
        /// Included nodes per tree.
        max_included_size: usize,
        /// Number of trees, one per symbol but the last when absent.
        #[serde(default)]
        tree_count: Option<usize>,
    },
    /// Marlin forest with meta-symbols and Markov refinement.
    MarlinMarkov(MarkovForestParams),
}

impl ForestParams {
    /// Build the forest these parameters describe.
    pub fn build(&self, source: &Source) -> Result<AnyForest> {
        let forest = match self {
            ForestParams::Trivial { tree_sizes } => {
                AnyForest::Plain(Forest::trivial(tree_sizes, source)?)
            }
            ForestParams::Tunstall {
                max_tree_size,
                tree_count,
            } => AnyForest::Plain(Forest::tunstall(*max_tree_size, *tree_count, source)?),
            ForestParams::Yamamoto {
                max_included_size,
                tree_count,
            } => AnyForest::Plain(Forest::yamamoto(*max_included_size, *tree_count, source)?),
            ForestParams::FastYamamoto {
                max_included_size,
                tree_count,
            } => AnyForest::Plain(Forest::fast_yamamoto(
                *max_included_size,
                *tree_count,
                source,
            )?),
            ForestParams::MarlinMarkov(params) => {
                AnyForest::MarlinMarkov(MarlinMarkovForest::new(*params, source)?)
            }
        };
        Ok(forest)
    }
}
