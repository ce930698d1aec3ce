//! Marlin forests with meta-symbols and Markov state refinement.
//!
//! Symbols are first grouped into meta-symbols of `2^S` consecutive symbols;
//! the forest codes meta-symbols while the offsets inside each group are sent
//! raw with `S` bits each. Meta-symbols too improbable to be worth a word are
//! escaped and sent beside the word stream.
//!
//! The `2^O` trees share a joint Markov chain over `(tree, state)` pairs.
//! Each round computes its stationary distribution, pushes the per-tree
//! slices into the trees, rebuilds them and reassigns which words lead to
//! which tree (DefineTransitions), until the dictionaries settle.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::config::{MarkovForestParams, RefinementConfig};
use crate::error::{Error, Result};
use crate::forest::{Forest, ForestKind, NodeRef};
use crate::marlin::{
    normalize_rows, stationary_distribution, MarkovTree, RefinementReport, StateModel, StopReason,
};
use crate::source::{MetaSource, Source, Symbol};
use crate::tree::{bits_for, NodeId, Tree};

/// Output of [`MarlinMarkovForest::code`].
///
/// In raw mode `nodes` and `escaped` are empty and `remainders` holds each
/// symbol's position in the original source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkovCodedMessage {
    /// Emitted words for the non-escaped meta-symbols.
    pub nodes: Vec<NodeRef>,
    /// `(input index, meta label)` of every escaped meta-symbol.
    pub escaped: Vec<(usize, u32)>,
    /// Offset of every input symbol inside its meta-symbol.
    pub remainders: Vec<usize>,
    /// Total coded size.
    pub bit_length: u64,
}

/// Marlin forest over meta-symbols.
#[derive(Clone, Debug)]
pub struct MarlinMarkovForest {
    params: MarkovForestParams,
    original_source: Source,
    meta: MetaSource,
    forest: Forest,
    models: Vec<StateModel>,
    is_raw: bool,
    report: RefinementReport,
}

impl MarlinMarkovForest {
    /// Build and refine a forest of `2^O` trees of `2^K` words.
    ///
    /// # Errors
    /// `Error::InvalidParameter` unless `2^K >= A`, `K > O` and the escape
    /// threshold lies in `[0, 1]`.
    pub fn new(params: MarkovForestParams, source: &Source) -> Result<Self> {
        let (meta, coded_source) = coded_source(&params, source)?;
        let escaped = meta.source().len() - coded_source.len();
        if escaped > 0 {
            log::info!(
                "{escaped} of {} meta-symbols of {source} are escaped",
                meta.source().len()
            );
        }

        if coded_source.len() == 1 {
            let (tree, model) =
                MarkovTree::unrefined(1, &coded_source, params.refinement)?.into_parts();
            let routes = vec![vec![Some(0); tree.arena_len()]];
            let forest =
                Forest::from_parts(ForestKind::MarlinMarkov, coded_source, vec![tree], routes)?;
            return Ok(Self {
                params,
                original_source: source.clone(),
                meta,
                forest,
                models: vec![model],
                is_raw: true,
                report: RefinementReport::not_refined(),
            });
        }

        let first = MarkovTree::build(1usize << params.k, &coded_source, params.refinement)?;
        let mut trees = vec![first; 1usize << params.o];
        let mut routes = define_transitions(&trees);
        let report = refine_forest(&mut trees, &mut routes, &params.refinement);

        let (trees, models): (Vec<Tree>, Vec<StateModel>) =
            trees.into_iter().map(MarkovTree::into_parts).unzip();
        let forest = Forest::from_parts(ForestKind::MarlinMarkov, coded_source, trees, routes)?;
        Ok(Self {
            params,
            original_source: source.clone(),
            meta,
            forest,
            models,
            is_raw: false,
            report,
        })
    }

    pub(crate) fn from_parts(
        params: MarkovForestParams,
        original_source: Source,
        meta: MetaSource,
        forest: Forest,
        models: Vec<StateModel>,
    ) -> Self {
        let is_raw = forest.source().len() == 1;
        Self {
            params,
            original_source,
            meta,
            forest,
            models,
            is_raw,
            report: RefinementReport::not_refined(),
        }
    }

    /// Build parameters.
    pub fn params(&self) -> &MarkovForestParams {
        &self.params
    }

    /// Source of the symbols being coded.
    pub fn original_source(&self) -> &Source {
        &self.original_source
    }

    /// Meta-symbol grouping of the original source.
    pub fn meta_source(&self) -> &MetaSource {
        &self.meta
    }

    /// Trees and routing over the selected meta-symbols.
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// State model of each tree.
    pub fn models(&self) -> &[StateModel] {
        &self.models
    }

    /// True when a single meta-symbol remains and symbols are sent raw.
    pub fn is_raw(&self) -> bool {
        self.is_raw
    }

    /// Outcome of the forest refinement loop.
    pub fn report(&self) -> RefinementReport {
        self.report
    }

    /// Meta labels sent beside the word stream.
    pub fn escaped_meta_symbols(&self) -> Vec<u32> {
        self.meta
            .source()
            .labels()
            .into_iter()
            .filter(|&label| self.forest.source().position(label).is_none())
            .collect()
    }

    /// Code a label sequence of the original source.
    pub fn code(&self, labels: &[u32]) -> Result<MarkovCodedMessage> {
        let n = labels.len() as u64;
        if self.is_raw {
            let remainders = labels
                .iter()
                .map(|&label| {
                    self.original_source
                        .position(label)
                        .ok_or(Error::UnknownSymbol(label))
                })
                .collect::<Result<Vec<_>>>()?;
            return Ok(MarkovCodedMessage {
                nodes: Vec::new(),
                escaped: Vec::new(),
                remainders,
                bit_length: n * u64::from(bits_for(self.original_source.len())),
            });
        }

        let mut positions = Vec::with_capacity(labels.len());
        let mut escaped = Vec::new();
        let mut remainders = Vec::with_capacity(labels.len());
        for (index, &label) in labels.iter().enumerate() {
            let (meta, offset) = self.meta.locate(label).ok_or(Error::UnknownSymbol(label))?;
            remainders.push(offset);
            match self.forest.source().position(meta) {
                Some(position) => positions.push(position),
                None => escaped.push((index, meta)),
            }
        }
        let nodes = self.forest.code_positions(&positions)?;

        let word_bits = u64::from(self.forest.word_length_bits());
        let index_bits = u64::from(bits_for(labels.len()));
        let bit_length = nodes.len() as u64 * word_bits
            + escaped.len() as u64 * (word_bits + index_bits)
            + n * u64::from(self.params.s);
        Ok(MarkovCodedMessage {
            nodes,
            escaped,
            remainders,
            bit_length,
        })
    }

    /// Invert [`MarlinMarkovForest::code`].
    pub fn decode(&self, message: &MarkovCodedMessage) -> Result<Vec<u32>> {
        if self.is_raw {
            return message
                .remainders
                .iter()
                .map(|&position| {
                    self.original_source
                        .symbols()
                        .get(position)
                        .map(|symbol| symbol.label)
                        .ok_or_else(|| {
                            Error::InvalidMessage(format!("raw position {position} out of range"))
                        })
                })
                .collect();
        }

        let coded = self.forest.decode(&message.nodes)?;
        let total = coded.len() + message.escaped.len();
        let mut metas = Vec::with_capacity(total);
        let mut coded = coded.into_iter();
        let mut escaped = message.escaped.iter().peekable();
        for index in 0..total {
            match escaped.peek() {
                Some(&&(at, meta)) if at == index => {
                    metas.push(meta);
                    escaped.next();
                }
                _ => metas.push(coded.next().ok_or_else(|| {
                    Error::InvalidMessage("escaped indices are not increasing".into())
                })?),
            }
        }
        if escaped.peek().is_some() {
            return Err(Error::InvalidMessage(
                "escaped index beyond the message end".into(),
            ));
        }
        if metas.len() != message.remainders.len() {
            return Err(Error::InvalidMessage(format!(
                "{} meta-symbols but {} remainders",
                metas.len(),
                message.remainders.len()
            )));
        }

        metas
            .iter()
            .zip(&message.remainders)
            .map(|(&meta, &offset)| {
                self.meta
                    .member(meta, offset)
                    .map(|symbol| symbol.label)
                    .ok_or_else(|| {
                        Error::InvalidMessage(format!(
                            "no symbol at offset {offset} of meta {meta}"
                        ))
                    })
            })
            .collect()
    }

    /// Descriptive name.
    pub fn name(&self) -> String {
        format!(
            "MarlinMarkovForest_K{}_O{}_S{}_threshold{}_{}",
            self.params.k,
            self.params.o,
            self.params.s,
            self.params.symbol_p_threshold,
            self.original_source.name()
        )
    }
}

impl fmt::Display for MarlinMarkovForest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Meta-symbol grouping and the renormalized source of coded meta-symbols.
pub(crate) fn coded_source(
    params: &MarkovForestParams,
    source: &Source,
) -> Result<(MetaSource, Source)> {
    validate(params, source.len())?;
    let meta = source.meta(1usize << params.s)?;
    let selected = select_meta(meta.source(), params.symbol_p_threshold)?;
    Ok((meta, selected))
}

fn validate(params: &MarkovForestParams, alphabet: usize) -> Result<()> {
    if params.k >= usize::BITS || params.s >= usize::BITS {
        return Err(Error::InvalidParameter(format!(
            "K={} and S={} must be below {}",
            params.k,
            params.s,
            usize::BITS
        )));
    }
    if (1usize << params.k) < alphabet {
        return Err(Error::InvalidParameter(format!(
            "2^K = {} cannot hold {alphabet} symbols",
            1usize << params.k
        )));
    }
    if params.k <= params.o {
        return Err(Error::InvalidParameter(format!(
            "K={} must exceed O={}",
            params.k, params.o
        )));
    }
    if !(0.0..=1.0).contains(&params.symbol_p_threshold) {
        return Err(Error::InvalidParameter(format!(
            "symbol_p_threshold {} outside [0, 1]",
            params.symbol_p_threshold
        )));
    }
    Ok(())
}

/// Shortest prefix reaching `1 - threshold`, never empty, renormalized.
fn select_meta(meta_source: &Source, threshold: f64) -> Result<Source> {
    let target = 1.0 - threshold;
    let mut sum = 0.0;
    let mut count = 0;
    for symbol in meta_source.symbols() {
        if count > 0 && sum >= target {
            break;
        }
        sum += symbol.probability;
        count += 1;
    }
    let selected = meta_source.symbols()[..count]
        .iter()
        .map(|symbol| Symbol::new(symbol.label, symbol.probability / sum))
        .collect();
    Source::new(selected, meta_source.seed(), meta_source.affix())
}

/// DefineTransitions: split each tree's words evenly over the trees.
///
/// Words are grouped by children count (capped at `A - 2`), each group
/// sorted by decreasing node probability; consecutive chunks of the
/// concatenation go to trees in order.
fn define_transitions(trees: &[MarkovTree]) -> Vec<Vec<Option<usize>>> {
    let count = trees.len();
    trees
        .iter()
        .map(|markov| {
            let tree = markov.tree();
            let model = markov.model();
            let alphabet = tree.alphabet_size();
            let mut buckets: Vec<Vec<(f64, NodeId)>> =
                vec![Vec::new(); alphabet.saturating_sub(1).max(1)];
            for node in tree.included_nodes() {
                let bucket = tree.children_count(node).min(alphabet.saturating_sub(2));
                buckets[bucket].push((model.node_probability(tree, node), node));
            }

            let mut ordered = Vec::with_capacity(tree.size());
            for mut bucket in buckets {
                bucket.sort_by(|a, b| b.0.total_cmp(&a.0));
                ordered.extend(bucket.into_iter().map(|(_, node)| node));
            }
            let chunk = ordered.len().div_ceil(count).max(1);
            let mut table = vec![None; tree.arena_len()];
            for (rank, node) in ordered.into_iter().enumerate() {
                table[node] = Some((rank / chunk).min(count - 1));
            }
            table
        })
        .collect()
}

fn word_sets(trees: &[MarkovTree]) -> Vec<BTreeSet<Vec<u32>>> {
    trees.iter().map(|markov| markov.tree().word_set()).collect()
}

fn refine_forest(
    trees: &mut [MarkovTree],
    routes: &mut Vec<Vec<Option<usize>>>,
    config: &RefinementConfig,
) -> RefinementReport {
    let tree_count = trees.len();
    let states_per_tree = trees[0].model().state_count();
    let state_count = states_per_tree * tree_count;
    let mut joint = vec![1.0 / state_count as f64; state_count];
    let mut history: HashSet<Vec<BTreeSet<Vec<u32>>>> = HashSet::new();
    history.insert(word_sets(trees));
    let mut stationary_converged = true;

    for iteration in 1..=config.max_iterations {
        let mut matrix = vec![vec![0.0; state_count]; state_count];
        for (from_tree, markov) in trees.iter().enumerate() {
            let tree = markov.tree();
            let model = markov.model();
            for node in tree.included_nodes() {
                let Some(to_tree) = routes[from_tree][node] else {
                    continue;
                };
                let column =
                    to_tree * states_per_tree + tree.children_count(node).min(states_per_tree - 1);
                for state in 0..states_per_tree {
                    matrix[from_tree * states_per_tree + state][column] +=
                        model.conditional_given_state(tree, node, state);
                }
            }
        }
        normalize_rows(&mut matrix);
        let fixed = stationary_distribution(
            &matrix,
            &joint,
            config.power_tolerance,
            config.max_power_iterations,
        );
        stationary_converged &= fixed.converged;
        joint = fixed.probabilities;

        let mut mse = 0.0;
        for (index, markov) in trees.iter_mut().enumerate() {
            let slice = joint[index * states_per_tree..(index + 1) * states_per_tree].to_vec();
            mse += slice
                .iter()
                .zip(markov.model().probabilities())
                .map(|(new, old)| (new - old).powi(2))
                .sum::<f64>();
            markov.set_state_probabilities(slice);
        }
        mse /= state_count as f64;

        let mut all_equal = true;
        for markov in trees.iter_mut() {
            let before = markov.tree().word_set();
            markov.rebuild();
            all_equal &= markov.tree().word_set() == before;
        }
        *routes = define_transitions(trees);
        log::debug!("markov forest refinement round {iteration}: state mse {mse:e}");

        let stop = if all_equal {
            Some(StopReason::WordSetsUnchanged)
        } else if !history.insert(word_sets(trees)) {
            Some(StopReason::WordSetRepeated)
        } else if mse < config.tolerance {
            Some(StopReason::StateDeltaBelowTolerance)
        } else {
            None
        };
        if let Some(stop) = stop {
            return RefinementReport {
                iterations: iteration,
                stop,
                stationary_converged,
            };
        }
    }

    log::warn!(
        "markov forest refinement stopped after {} rounds without converging",
        config.max_iterations
    );
    RefinementReport {
        iterations: config.max_iterations,
        stop: StopReason::IterationBudget,
        stationary_converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eight_symbols() -> Source {
        Source::from_probabilities(&[0.4, 0.2, 0.15, 0.1, 0.06, 0.04, 0.03, 0.02]).unwrap()
    }

    #[test]
    fn test_roundtrip_without_meta() {
        let source = Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap();
        let forest = MarlinMarkovForest::new(MarkovForestParams::new(4, 1, 0), &source).unwrap();
        assert!(!forest.is_raw());
        assert_eq!(forest.forest().trees().len(), 2);
        for tree in forest.forest().trees() {
            assert_eq!(tree.included_count(), 16);
        }

        let input = vec![0, 0, 1, 2, 3, 0, 0, 0, 1, 1, 3, 2, 0];
        let coded = forest.code(&input).unwrap();
        assert!(coded.escaped.is_empty());
        assert_eq!(
            coded.bit_length,
            coded.nodes.len() as u64 * u64::from(forest.forest().word_length_bits())
        );
        assert_eq!(forest.decode(&coded).unwrap(), input);
    }

    #[test]
    fn test_every_word_is_routed() {
        let forest =
            MarlinMarkovForest::new(MarkovForestParams::new(5, 2, 0), &eight_symbols()).unwrap();
        let trees = forest.forest().trees().len();
        assert_eq!(trees, 4);
        let mut per_tree = vec![0usize; trees];
        for node in forest.forest().included_nodes() {
            let next = forest.forest().next_tree(node).unwrap();
            per_tree[next] += 1;
        }
        // Each tree hands out 32 words in chunks of 8.
        assert!(per_tree.iter().all(|&count| count == 32));
    }

    #[test]
    fn test_escaped_meta_symbols() {
        let mut params = MarkovForestParams::new(4, 1, 1);
        params.symbol_p_threshold = 0.1;
        let forest = MarlinMarkovForest::new(params, &eight_symbols()).unwrap();
        // Meta probabilities 0.6, 0.25, 0.1, 0.05: the first three reach 0.9.
        assert_eq!(forest.forest().source().len(), 3);
        assert_eq!(forest.escaped_meta_symbols(), vec![3]);

        let input = vec![0, 7, 1, 2, 6, 3, 0, 0, 4, 5];
        let coded = forest.code(&input).unwrap();
        assert_eq!(coded.escaped, vec![(1, 3), (4, 3)]);
        assert_eq!(coded.remainders.len(), input.len());
        let w = u64::from(forest.forest().word_length_bits());
        assert_eq!(
            coded.bit_length,
            coded.nodes.len() as u64 * w + 2 * (w + 4) + input.len() as u64
        );
        assert_eq!(forest.decode(&coded).unwrap(), input);
    }

    #[test]
    fn test_raw_mode() {
        let source = Source::from_probabilities(&[0.7, 0.2, 0.1]).unwrap();
        let forest = MarlinMarkovForest::new(MarkovForestParams::new(2, 0, 2), &source).unwrap();
        assert!(forest.is_raw());
        let input = vec![2, 0, 1, 1, 0];
        let coded = forest.code(&input).unwrap();
        assert_eq!(coded.bit_length, 5 * 2);
        assert_eq!(forest.decode(&coded).unwrap(), input);
    }

    #[test]
    fn test_parameter_validation() {
        let source = eight_symbols();
        for params in [
            MarkovForestParams::new(2, 0, 0),
            MarkovForestParams::new(4, 4, 0),
            MarkovForestParams {
                symbol_p_threshold: 1.5,
                ..MarkovForestParams::new(4, 1, 0)
            },
        ] {
            assert!(matches!(
                MarlinMarkovForest::new(params, &source),
                Err(Error::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_threshold_one_keeps_a_symbol() {
        let source = eight_symbols();
        let params = MarkovForestParams {
            symbol_p_threshold: 1.0,
            ..MarkovForestParams::new(3, 0, 0)
        };
        let forest = MarlinMarkovForest::new(params, &source).unwrap();
        assert!(forest.is_raw());
        let input = vec![7, 6, 0];
        assert_eq!(forest.decode(&forest.code(&input).unwrap()).unwrap(), input);
    }

    #[test]
    fn test_malformed_message() {
        let source = Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap();
        let forest = MarlinMarkovForest::new(MarkovForestParams::new(3, 0, 0), &source).unwrap();
        let mut coded = forest.code(&[0, 1, 2]).unwrap();
        coded.remainders.push(0);
        assert!(matches!(forest.decode(&coded), Err(Error::InvalidMessage(_))));
    }
}
