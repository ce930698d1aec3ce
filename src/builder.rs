//! Closed set of tree construction strategies.

use serde::{Deserialize, Serialize};

use crate::config::RefinementConfig;
use crate::error::Result;
use crate::marlin::{build_marlin_base, MarkovTree, RefinementReport};
use crate::source::Source;
use crate::tree::Tree;
use crate::tunstall::{build_trivial, build_tunstall};
use crate::yamamoto::{build_fast_yamamoto, build_yamamoto};

/// A tree construction strategy.
///
/// Every builder returns a tree with at most `size` included nodes. Builders
/// that end below `size` log a warning.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(tag = "builder", rename_all = "snake_case")]
pub enum TreeBuilder {
    /// One word per symbol.
    Trivial,
    /// Tunstall's algorithm.
    Tunstall,
    /// Marlin's greedy heap construction.
    MarlinBase,
    /// Marlin construction refined against the Markov state distribution.
    MarlinMarkov {
        /// Refinement limits.
        #[serde(default)]
        refinement: RefinementConfig,
    },
    /// Yamamoto-Yokoo competitive construction.
    Yamamoto {
        /// Number of most probable symbols that cannot open a word.
        #[serde(default)]
        first_allowed_symbol_index: usize,
    },
    /// Yamamoto construction without the S1/S2 comparison.
    FastYamamoto {
        /// Number of most probable symbols whose branches are not expanded.
        #[serde(default)]
        first_allowed_symbol_index: usize,
    },
}

impl TreeBuilder {
    /// Grow a tree for `source` with up to `size` included nodes.
    pub fn build(&self, size: usize, source: &Source) -> Result<Tree> {
        self.build_with_report(size, source).map(|(tree, _)| tree)
    }

    /// Like [`TreeBuilder::build`], also returning how the Markov refinement
    /// ended. Builders without refinement report
    /// [`StopReason::NotRefined`](crate::marlin::StopReason::NotRefined).
    pub fn build_with_report(
        &self,
        size: usize,
        source: &Source,
    ) -> Result<(Tree, RefinementReport)> {
        let (tree, report) = match *self {
            TreeBuilder::Trivial => {
                (build_trivial(size, source)?, RefinementReport::not_refined())
            }
            TreeBuilder::Tunstall => {
                (build_tunstall(size, source)?, RefinementReport::not_refined())
            }
            TreeBuilder::MarlinBase => {
                (build_marlin_base(size, source)?, RefinementReport::not_refined())
            }
            TreeBuilder::MarlinMarkov { refinement } => {
                let markov = MarkovTree::build(size, source, refinement)?;
                let report = markov.report();
                log::debug!(
                    "marlin markov tree: {} rounds, stop {:?}, stationary converged {}",
                    report.iterations,
                    report.stop,
                    report.stationary_converged
                );
                (markov.into_parts().0, report)
            }
            TreeBuilder::Yamamoto {
                first_allowed_symbol_index,
            } => (
                build_yamamoto(size, source, first_allowed_symbol_index)?,
                RefinementReport::not_refined(),
            ),
            TreeBuilder::FastYamamoto {
                first_allowed_symbol_index,
            } => (
                build_fast_yamamoto(size, source, first_allowed_symbol_index)?,
                RefinementReport::not_refined(),
            ),
        };
        tree.warn_if_under_capacity(self.name());
        Ok((tree, report))
    }

    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TreeBuilder::Trivial => "trivial",
            TreeBuilder::Tunstall => "tunstall",
            TreeBuilder::MarlinBase => "marlin_base",
            TreeBuilder::MarlinMarkov { .. } => "marlin_markov",
            TreeBuilder::Yamamoto { .. } => "yamamoto",
            TreeBuilder::FastYamamoto { .. } => "fast_yamamoto",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marlin::StopReason;

    #[test]
    fn test_every_builder_respects_size() {
        let source = Source::from_probabilities(&[0.4, 0.3, 0.2, 0.1]).unwrap();
        let builders = [
            TreeBuilder::Trivial,
            TreeBuilder::Tunstall,
            TreeBuilder::MarlinBase,
            TreeBuilder::MarlinMarkov {
                refinement: RefinementConfig::default(),
            },
            TreeBuilder::Yamamoto {
                first_allowed_symbol_index: 1,
            },
            TreeBuilder::FastYamamoto {
                first_allowed_symbol_index: 0,
            },
        ];
        for builder in builders {
            let tree = builder.build(32, &source).unwrap();
            assert!(tree.included_count() <= 32, "{}", builder.name());
            assert!(tree.included_count() >= source.len() - 1, "{}", builder.name());
        }
    }

    #[test]
    fn test_markov_builder_reports_refinement() {
        let source = Source::from_probabilities(&[0.4, 0.3, 0.2, 0.1]).unwrap();
        let builder = TreeBuilder::MarlinMarkov {
            refinement: RefinementConfig::default(),
        };
        let (tree, report) = builder.build_with_report(16, &source).unwrap();
        assert!(report.iterations >= 1);
        assert_ne!(report.stop, StopReason::NotRefined);
        assert_eq!(tree.word_set(), builder.build(16, &source).unwrap().word_set());

        let (_, report) = TreeBuilder::Tunstall.build_with_report(16, &source).unwrap();
        assert_eq!(report.stop, StopReason::NotRefined);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn test_builder_from_json() {
        let builder: TreeBuilder =
            serde_json::from_str(r#"{"builder": "yamamoto", "first_allowed_symbol_index": 2}"#)
                .unwrap();
        assert_eq!(
            builder,
            TreeBuilder::Yamamoto {
                first_allowed_symbol_index: 2
            }
        );
        let builder: TreeBuilder = serde_json::from_str(r#"{"builder": "tunstall"}"#).unwrap();
        assert_eq!(builder, TreeBuilder::Tunstall);
    }
}
