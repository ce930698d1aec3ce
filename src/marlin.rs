//! Marlin dictionaries.
//!
//! Marlin trees grow one child at a time from a max-heap of candidate nodes,
//! ranked by the probability that the node's word is emitted. The Markov
//! variant additionally models the decoder state (how many of the most
//! probable symbols are known not to come next) and rebuilds the tree until
//! the stationary state distribution and the dictionary agree.
//!
//! # References
//!
//! - Martínez, Hernández-Cabronero, Blanes, Serra-Sagristà (2020). "High-throughput
//!   variable-to-fixed entropy codec using selective, stochastic code forests."

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::RefinementConfig;
use crate::error::Result;
use crate::source::Source;
use crate::tree::{NodeId, Tree, ROOT};

#[derive(Clone, Copy, Debug)]
struct Candidate {
    probability: f64,
    node: NodeId,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.probability
            .total_cmp(&other.probability)
            .then_with(|| other.node.cmp(&self.node)) // Older nodes first
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

/// Grow an empty tree up to its size using `probability` to rank nodes.
///
/// The heap always holds exactly the included nodes.
pub(crate) fn grow<F>(tree: &mut Tree, probability: F)
where
    F: Fn(&Tree, NodeId) -> f64,
{
    let alphabet = tree.alphabet_size();
    let size = tree.size();

    let mut heap = BinaryHeap::with_capacity(size + 1);
    for position in 0..alphabet {
        let node = tree.add_child(ROOT, position);
        heap.push(Candidate {
            probability: probability(tree, node),
            node,
        });
    }
    if alphabet < 2 {
        return;
    }

    while heap.len() < size {
        let Some(Candidate { node: expanded, .. }) = heap.pop() else {
            break;
        };
        let next = tree.children_count(expanded);
        let new_node = tree.add_child(expanded, next);

        if tree.children_count(expanded) < alphabet - 1 {
            heap.push(Candidate {
                probability: probability(tree, expanded),
                node: expanded,
            });
        } else {
            // The last symbol is free: adding it keeps the included count.
            let last = tree.add_child(expanded, alphabet - 1);
            heap.push(Candidate {
                probability: probability(tree, last),
                node: last,
            });
        }
        heap.push(Candidate {
            probability: probability(tree, new_node),
            node: new_node,
        });
    }
}

/// Marlin's GetTree: greedy heap construction without state modelling.
pub fn build_marlin_base(size: usize, source: &Source) -> Result<Tree> {
    let mut tree = Tree::new(size, source)?;
    grow(&mut tree, |t, node| t.word_probability(node));
    Ok(tree)
}

/// Result of a power iteration.
#[derive(Clone, Debug, PartialEq)]
pub struct FixedPoint {
    /// Last computed distribution.
    pub probabilities: Vec<f64>,
    /// Whether the L1 change dropped below the tolerance.
    pub converged: bool,
    /// Steps performed.
    pub iterations: usize,
}

/// Power-iterate a row-stochastic matrix from `initial`.
pub fn stationary_distribution(
    matrix: &[Vec<f64>],
    initial: &[f64],
    tolerance: f64,
    max_iterations: usize,
) -> FixedPoint {
    let mut current = initial.to_vec();
    for iteration in 1..=max_iterations {
        let mut next = vec![0.0; current.len()];
        for (row, &p) in matrix.iter().zip(&current) {
            if p == 0.0 {
                continue;
            }
            for (slot, &transition) in next.iter_mut().zip(row) {
                *slot += p * transition;
            }
        }
        let delta = l1_distance(&current, &next);
        current = next;
        if delta < tolerance {
            return FixedPoint {
                probabilities: current,
                converged: true,
                iterations: iteration,
            };
        }
    }
    FixedPoint {
        probabilities: current,
        converged: false,
        iterations: max_iterations,
    }
}

/// Normalize every row to sum 1; all-zero rows become uniform.
pub(crate) fn normalize_rows(matrix: &mut [Vec<f64>]) {
    for row in matrix.iter_mut() {
        let sum: f64 = row.iter().sum();
        if sum > 0.0 {
            row.iter_mut().for_each(|t| *t /= sum);
        } else {
            let uniform = 1.0 / row.len() as f64;
            row.iter_mut().for_each(|t| *t = uniform);
        }
    }
}

pub(crate) fn l1_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum()
}

/// Why a refinement loop stopped.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No refinement was requested.
    NotRefined,
    /// The produced dictionary had already been produced before.
    WordSetRepeated,
    /// No tree changed in the last round.
    WordSetsUnchanged,
    /// The state probabilities moved less than the tolerance.
    StateDeltaBelowTolerance,
    /// The iteration budget ran out; the last structure was kept.
    IterationBudget,
}

/// Observable outcome of a refinement loop.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefinementReport {
    /// Rebuild rounds performed.
    pub iterations: usize,
    /// Why the loop ended.
    pub stop: StopReason,
    /// Whether every power iteration reached its tolerance.
    pub stationary_converged: bool,
}

impl RefinementReport {
    pub(crate) fn not_refined() -> Self {
        Self {
            iterations: 0,
            stop: StopReason::NotRefined,
            stationary_converged: true,
        }
    }

    /// False when the loop was cut by its iteration budget.
    pub fn converged(&self) -> bool {
        self.stop != StopReason::IterationBudget
    }
}

/// Per-tree Markov state model.
///
/// State `s` means the `s` most probable symbols cannot start the next word.
/// States run over `0..max(1, A - 1)`.
#[derive(Clone, Debug)]
pub struct StateModel {
    probabilities: Vec<f64>,
    divisors: Vec<f64>,
    // weights[f] = Σ_{s <= f} probabilities[s] / divisors[s]
    weights: Vec<f64>,
}

impl StateModel {
    /// Model starting in state 0 with probability 1.
    pub fn new(source: &Source) -> Self {
        let state_count = source.len().saturating_sub(1).max(1);
        let p = source.probabilities();
        let mut divisors = vec![1.0; state_count];
        for (state, divisor) in divisors.iter_mut().enumerate().skip(1) {
            *divisor = p[state..].iter().sum();
        }
        let mut probabilities = vec![0.0; state_count];
        probabilities[0] = 1.0;

        let mut model = Self {
            probabilities,
            divisors,
            weights: vec![0.0; source.len()],
        };
        model.refresh_weights();
        model
    }

    fn refresh_weights(&mut self) {
        let mut accumulated = 0.0;
        for (first, weight) in self.weights.iter_mut().enumerate() {
            if first < self.probabilities.len() && self.divisors[first] > 0.0 {
                accumulated += self.probabilities[first] / self.divisors[first];
            }
            *weight = accumulated;
        }
    }

    /// Number of states.
    pub fn state_count(&self) -> usize {
        self.probabilities.len()
    }

    /// Current state probabilities.
    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    /// Replace the state probabilities.
    pub fn set_probabilities(&mut self, probabilities: Vec<f64>) {
        debug_assert_eq!(probabilities.len(), self.probabilities.len());
        self.probabilities = probabilities;
        self.refresh_weights();
    }

    /// Probability of emitting `node` given that the coder is in `state`.
    pub fn conditional_given_state(&self, tree: &Tree, node: NodeId, state: usize) -> f64 {
        let divisor = self.divisors[state];
        match tree.first_symbol(node) {
            Some(first) if first >= state && divisor > 0.0 => {
                tree.word_probability(node) / divisor
            }
            _ => 0.0,
        }
    }

    /// Joint probability of being in `state` and emitting `node`.
    pub fn node_conditional_probability(&self, tree: &Tree, node: NodeId, state: usize) -> f64 {
        self.probabilities[state] * self.conditional_given_state(tree, node, state)
    }

    /// Probability of emitting `node`, summed over states.
    pub fn node_probability(&self, tree: &Tree, node: NodeId) -> f64 {
        match tree.first_symbol(node) {
            Some(first) => tree.word_probability(node) * self.weights[first],
            None => 0.0,
        }
    }

    /// Transition matrix between this tree's states.
    ///
    /// Emitting a node with `c` children leads to state `min(c, states - 1)`.
    pub fn transition_matrix(&self, tree: &Tree) -> Vec<Vec<f64>> {
        let states = self.state_count();
        let mut matrix = vec![vec![0.0; states]; states];
        for node in tree.included_nodes() {
            let to = tree.children_count(node).min(states - 1);
            for (state, row) in matrix.iter_mut().enumerate() {
                row[to] += self.conditional_given_state(tree, node, state);
            }
        }
        normalize_rows(&mut matrix);
        matrix
    }
}

/// Marlin tree with Markov state refinement.
#[derive(Clone, Debug)]
pub struct MarkovTree {
    tree: Tree,
    model: StateModel,
    config: RefinementConfig,
    report: RefinementReport,
}

impl MarkovTree {
    /// Build and refine a tree until its state probabilities settle.
    pub fn build(size: usize, source: &Source, config: RefinementConfig) -> Result<Self> {
        let mut markov = Self::unrefined(size, source, config)?;
        markov.refine();
        Ok(markov)
    }

    /// Build once with the initial state model (state 0 with probability 1).
    pub fn unrefined(size: usize, source: &Source, config: RefinementConfig) -> Result<Self> {
        let mut markov = Self {
            tree: Tree::new(size, source)?,
            model: StateModel::new(source),
            config,
            report: RefinementReport::not_refined(),
        };
        markov.rebuild();
        Ok(markov)
    }

    /// Discard the tree and grow it again with the current state model.
    pub fn rebuild(&mut self) {
        self.tree.reset();
        let model = &self.model;
        grow(&mut self.tree, |tree, node| model.node_probability(tree, node));
    }

    fn refine(&mut self) {
        let mut seen: HashSet<BTreeSet<Vec<u32>>> = HashSet::new();
        seen.insert(self.tree.word_set());
        let mut previous = self.model.probabilities().to_vec();
        let mut stationary_converged = true;

        for iteration in 1..=self.config.max_iterations {
            let fixed = stationary_distribution(
                &self.model.transition_matrix(&self.tree),
                &previous,
                self.config.power_tolerance,
                self.config.max_power_iterations,
            );
            stationary_converged &= fixed.converged;
            self.model.set_probabilities(fixed.probabilities);
            self.rebuild();

            let delta = l1_distance(&previous, self.model.probabilities());
            log::debug!("markov tree refinement round {iteration}: state delta {delta:e}");

            let stop = if !seen.insert(self.tree.word_set()) {
                Some(StopReason::WordSetRepeated)
            } else if delta <= self.config.tolerance {
                Some(StopReason::StateDeltaBelowTolerance)
            } else {
                None
            };
            if let Some(stop) = stop {
                self.report = RefinementReport {
                    iterations: iteration,
                    stop,
                    stationary_converged,
                };
                return;
            }
            previous = self.model.probabilities().to_vec();
        }

        log::warn!(
            "markov tree refinement for {} stopped after {} rounds without converging",
            self.tree.source(),
            self.config.max_iterations
        );
        self.report = RefinementReport {
            iterations: self.config.max_iterations,
            stop: StopReason::IterationBudget,
            stationary_converged,
        };
    }

    /// The current tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The state model.
    pub fn model(&self) -> &StateModel {
        &self.model
    }

    /// Outcome of the standalone refinement.
    pub fn report(&self) -> RefinementReport {
        self.report
    }

    pub(crate) fn set_state_probabilities(&mut self, probabilities: Vec<f64>) {
        self.model.set_probabilities(probabilities);
    }

    /// Split into the tree and its state model.
    pub fn into_parts(self) -> (Tree, StateModel) {
        (self.tree, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn geometric() -> Source {
        Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap()
    }

    #[test]
    fn test_marlin_base_reaches_size() {
        let source = geometric();
        for size in [4, 5, 8, 17, 64] {
            let tree = build_marlin_base(size, &source).unwrap();
            assert_eq!(tree.included_count(), size);
            assert!((tree.probability_sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_marlin_base_prefers_probable_words() {
        let source = geometric();
        let tree = build_marlin_base(5, &source).unwrap();
        // The first expansion adds "00" under the most probable root child.
        assert!(tree.word_set().contains(&vec![0, 0]));
    }

    #[test]
    fn test_single_symbol_cannot_grow() {
        let source = Source::from_probabilities(&[1.0]).unwrap();
        let tree = build_marlin_base(4, &source).unwrap();
        assert_eq!(tree.included_count(), 1);
    }

    #[test]
    fn test_stationary_distribution_two_states() {
        let matrix = vec![vec![0.9, 0.1], vec![0.5, 0.5]];
        let fixed = stationary_distribution(&matrix, &[1.0, 0.0], 1e-14, 10_000);
        assert!(fixed.converged);
        assert!((fixed.probabilities[0] - 5.0 / 6.0).abs() < 1e-9);
        assert!((fixed.probabilities[1] - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_stationary_distribution_reports_budget() {
        let matrix = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let fixed = stationary_distribution(&matrix, &[1.0, 0.0], 1e-12, 7);
        assert!(!fixed.converged);
        assert_eq!(fixed.iterations, 7);
    }

    #[test]
    fn test_state_model_node_probability_matches_sum() {
        let source = geometric();
        let mut markov = MarkovTree::unrefined(16, &source, RefinementConfig::default()).unwrap();
        markov.set_state_probabilities(vec![0.6, 0.3, 0.1]);
        let tree = markov.tree();
        let model = markov.model();
        for node in tree.included_nodes() {
            let summed: f64 = (0..model.state_count())
                .map(|s| model.node_conditional_probability(tree, node, s))
                .sum();
            assert!((summed - model.node_probability(tree, node)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_transition_rows_are_stochastic() {
        let source = geometric();
        let markov = MarkovTree::unrefined(16, &source, RefinementConfig::default()).unwrap();
        let matrix = markov.model().transition_matrix(markov.tree());
        for row in matrix {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_markov_tree_refines_and_reports() {
        let source = geometric();
        let markov = MarkovTree::build(32, &source, RefinementConfig::default()).unwrap();
        assert_eq!(markov.tree().included_count(), 32);
        let report = markov.report();
        assert!(report.iterations >= 1);
        let state_sum: f64 = markov.model().probabilities().iter().sum();
        assert!((state_sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_markov_tree_zero_budget_is_soft() {
        let source = geometric();
        let config = RefinementConfig {
            max_iterations: 0,
            ..RefinementConfig::default()
        };
        let markov = MarkovTree::build(16, &source, config).unwrap();
        assert_eq!(markov.report().stop, StopReason::IterationBudget);
        assert!(!markov.report().converged());
        assert_eq!(markov.tree().included_count(), 16);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_marlin_base_is_deterministic(
            weights in prop::collection::vec(1u32..100, 2..8),
            extra in 0usize..40,
        ) {
            let mut weights = weights;
            weights.sort_unstable_by(|a, b| b.cmp(a));
            let total: u32 = weights.iter().sum();
            let probabilities: Vec<f64> =
                weights.iter().map(|&w| w as f64 / total as f64).collect();
            let source = Source::from_probabilities(&probabilities).unwrap();
            let size = source.len() + extra;

            let a = build_marlin_base(size, &source).unwrap();
            let b = build_marlin_base(size, &source).unwrap();
            prop_assert_eq!(a.word_set(), b.word_set());
            prop_assert_eq!(a.included_count(), size);
        }
    }
}
