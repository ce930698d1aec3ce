//! Symbol probability models.
//!
//! A [`Source`] is the only input the tree builders consume: a finite integer
//! alphabet with a probability per symbol, kept in non-increasing probability
//! order. Sources are immutable; every transformation (meta-grouping,
//! smoothing) produces a new one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum allowed deviation of the probability sum from 1.
pub const PROBABILITY_TOLERANCE: f64 = 1e-10;

/// Probabilities at or below this value are treated as zero by the Laplacian generator.
pub const MIN_SYMBOL_PROBABILITY: f64 = 1e-10;

const LAPLACIAN_MAX_ITERATIONS: usize = 256;
const LAPLACIAN_PERIODS: usize = 100;

/// An alphabet symbol and its probability.
///
/// Equality, hashing and ordering only look at the label.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Symbol {
    /// Integer value of the symbol.
    pub label: u32,
    /// Probability of the symbol in its source.
    pub probability: f64,
}

impl Symbol {
    /// Create a new symbol.
    pub fn new(label: u32, probability: f64) -> Self {
        Self { label, probability }
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.label == other.label
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.label.hash(state);
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.label.cmp(&other.label)
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Serialize, Deserialize)]
struct SourceRecord {
    symbols: Vec<Symbol>,
    seed: Option<u64>,
    affix: String,
}

/// A probability distribution over a finite integer alphabet.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "SourceRecord", into = "SourceRecord")]
pub struct Source {
    symbols: Vec<Symbol>,
    seed: Option<u64>,
    affix: String,
    positions: HashMap<u32, usize>,
}

impl TryFrom<SourceRecord> for Source {
    type Error = Error;

    fn try_from(record: SourceRecord) -> Result<Self> {
        Source::new(record.symbols, record.seed, record.affix)
    }
}

impl From<Source> for SourceRecord {
    fn from(source: Source) -> Self {
        SourceRecord {
            symbols: source.symbols,
            seed: source.seed,
            affix: source.affix,
        }
    }
}

impl Source {
    /// Create a source from symbols already sorted by decreasing probability.
    ///
    /// # Errors
    /// Returns `Error::InvalidSource` if the list is empty, contains repeated
    /// labels, negative or non-finite probabilities, does not sum to 1 within
    /// [`PROBABILITY_TOLERANCE`], or is not sorted by decreasing probability.
    pub fn new(symbols: Vec<Symbol>, seed: Option<u64>, affix: impl Into<String>) -> Result<Self> {
        if symbols.is_empty() {
            return Err(Error::InvalidSource(
                "a source needs at least one symbol".into(),
            ));
        }
        let mut positions = HashMap::with_capacity(symbols.len());
        for (position, symbol) in symbols.iter().enumerate() {
            if !symbol.probability.is_finite() || symbol.probability < 0.0 {
                return Err(Error::InvalidSource(format!(
                    "symbol {} has probability {}",
                    symbol.label, symbol.probability
                )));
            }
            if positions.insert(symbol.label, position).is_some() {
                return Err(Error::InvalidSource(format!(
                    "label {} appears more than once",
                    symbol.label
                )));
            }
        }
        let sum: f64 = symbols.iter().map(|s| s.probability).sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(Error::InvalidSource(format!(
                "probabilities sum to {sum}"
            )));
        }
        if let Some(pair) = symbols
            .windows(2)
            .find(|pair| pair[0].probability < pair[1].probability)
        {
            return Err(Error::InvalidSource(format!(
                "symbols are not sorted by decreasing probability ({} before {})",
                pair[0].label, pair[1].label
            )));
        }

        Ok(Self {
            symbols,
            seed,
            affix: affix.into(),
            positions,
        })
    }

    /// Create a source labelled `0..n` from probabilities in decreasing order.
    pub fn from_probabilities(probabilities: &[f64]) -> Result<Self> {
        let symbols = probabilities
            .iter()
            .enumerate()
            .map(|(label, &p)| Symbol::new(label as u32, p))
            .collect();
        Self::new(symbols, None, "")
    }

    /// Estimate a source from the relative frequency of each sample value.
    pub fn from_frequency_data(samples: &[u32]) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::InvalidSource("no samples were provided".into()));
        }
        let mut counts: BTreeMap<u32, u64> = BTreeMap::new();
        for &sample in samples {
            *counts.entry(sample).or_default() += 1;
        }
        let total = samples.len() as f64;
        let mut symbols: Vec<Symbol> = counts
            .into_iter()
            .map(|(label, count)| Symbol::new(label, count as f64 / total))
            .collect();
        sort_descending(&mut symbols);
        Self::new(symbols, None, "")
    }

    /// Average several label -> probability maps into a single source.
    ///
    /// With `symbol_count`, every label must be below it and labels missing
    /// from all distributions are added with zero probability.
    pub fn from_average_distributions(
        distributions: &[BTreeMap<u32, f64>],
        symbol_count: Option<usize>,
    ) -> Result<Self> {
        if distributions.is_empty() {
            return Err(Error::InvalidParameter(
                "at least one distribution must be provided".into(),
            ));
        }
        let mut sums: BTreeMap<u32, f64> = BTreeMap::new();
        for distribution in distributions {
            for (&label, &p) in distribution {
                *sums.entry(label).or_default() += p;
            }
        }
        let count = distributions.len() as f64;

        if let Some(symbol_count) = symbol_count {
            if let Some((&max_label, _)) = sums.iter().next_back() {
                if max_label as usize >= symbol_count {
                    return Err(Error::InvalidParameter(format!(
                        "symbol_count={symbol_count}, but found symbol {max_label}"
                    )));
                }
            }
            for label in 0..symbol_count as u32 {
                sums.entry(label).or_default();
            }
        }

        let mut symbols: Vec<Symbol> = sums
            .into_iter()
            .map(|(label, sum)| Symbol::new(label, sum / count))
            .collect();
        sort_descending(&mut symbols);
        Self::new(symbols, None, "")
    }

    /// Build a discrete Laplacian source whose entropy is `entropy_fraction`
    /// times the maximum entropy `log2(symbol_count)`.
    ///
    /// The Laplace scale is found by bisection; failing to hit the requested
    /// fraction within the iteration budget is fatal.
    pub fn laplacian(symbol_count: usize, entropy_fraction: f64, seed: u64) -> Result<Self> {
        if symbol_count == 0 {
            return Err(Error::InvalidParameter("symbol_count must be positive".into()));
        }
        if !(0.0..=1.0).contains(&entropy_fraction) {
            return Err(Error::InvalidParameter(format!(
                "entropy fraction {entropy_fraction} is outside [0, 1]"
            )));
        }
        if symbol_count == 1 {
            return Self::new(vec![Symbol::new(0, 1.0)], Some(seed), "Laplacian");
        }

        let max_entropy = (symbol_count as f64).log2();
        let (mut min_b, mut max_b) = (1e-20_f64, 1e10_f64);
        for iteration in 0..LAPLACIAN_MAX_ITERATIONS {
            let mid_b = 0.5 * (min_b + max_b);
            let mut pdf = laplace_pdf(symbol_count, mid_b);
            let mut fraction = entropy_of(&pdf) / max_entropy;
            if fraction > 1.0 - 1e-6 {
                pdf = vec![1.0 / symbol_count as f64; symbol_count];
                fraction = 1.0;
            }
            if (fraction - entropy_fraction).abs() <= PROBABILITY_TOLERANCE {
                let symbols = pdf
                    .into_iter()
                    .enumerate()
                    .map(|(label, p)| Symbol::new(label as u32, p))
                    .collect();
                return Self::new(symbols, Some(seed), "Laplacian");
            }
            if fraction > entropy_fraction {
                max_b = mid_b;
            } else {
                min_b = mid_b;
            }
            if max_b - min_b <= f64::EPSILON * max_b {
                return Err(Error::NotConverged {
                    what: "laplacian scale search",
                    iterations: iteration + 1,
                });
            }
        }
        Err(Error::NotConverged {
            what: "laplacian scale search",
            iterations: LAPLACIAN_MAX_ITERATIONS,
        })
    }

    /// Group contiguous blocks of `symbols_per_meta` symbols into meta-symbols.
    pub fn meta(&self, symbols_per_meta: usize) -> Result<MetaSource> {
        if symbols_per_meta == 0 {
            return Err(Error::InvalidParameter(
                "symbols_per_meta must be positive".into(),
            ));
        }
        let mut meta_symbols = Vec::new();
        let mut members = Vec::new();
        let mut member_to_meta = HashMap::with_capacity(self.symbols.len());
        for (index, block) in self.symbols.chunks(symbols_per_meta).enumerate() {
            let meta_label = index as u32;
            meta_symbols.push(Symbol::new(
                meta_label,
                block.iter().map(|s| s.probability).sum(),
            ));
            for (offset, symbol) in block.iter().enumerate() {
                member_to_meta.insert(symbol.label, (meta_label, offset));
            }
            members.push(block.to_vec());
        }
        let source = Self::new(meta_symbols, self.seed, format!("meta-{}", self.name()))?;
        Ok(MetaSource {
            source,
            members,
            member_to_meta,
        })
    }

    /// Smooth the distribution assuming symmetric residuals mapped as
    /// 0, -1, 1, -2, 2, ...
    ///
    /// Each pair of labels `(2k - 1, 2k)` receives its average probability,
    /// clamped so the result never increases with the label. Probabilities are
    /// floored at twice [`MIN_SYMBOL_PROBABILITY`] and renormalized. `self` is
    /// left untouched.
    pub fn smoothed_symmetric(&self) -> Result<Self> {
        let mut by_label = self.symbols.clone();
        by_label.sort();
        let n = by_label.len();

        let mut probabilities = Vec::with_capacity(n);
        let mut previous = by_label[0].probability;
        probabilities.push(previous);
        let mut i = 1;
        while i < n {
            if i + 1 < n {
                let average = 0.5 * (by_label[i].probability + by_label[i + 1].probability);
                if average > previous {
                    log::debug!(
                        "symbols {} and {}: average {average} above previous {previous}, clamped",
                        by_label[i].label,
                        by_label[i + 1].label,
                    );
                }
                let average = average.min(previous);
                probabilities.extend([average, average]);
                previous = average;
            } else {
                probabilities.push(by_label[i].probability.min(previous));
            }
            i += 2;
        }

        let floored: Vec<f64> = probabilities
            .iter()
            .map(|&p| p.max(2.0 * MIN_SYMBOL_PROBABILITY))
            .collect();
        let sum: f64 = floored.iter().sum();

        let mut kl_forward = 0.0;
        let mut kl_backward = 0.0;
        let mut symbols = Vec::with_capacity(n);
        for (original, &p) in by_label.iter().zip(&floored) {
            let q = p / sum;
            if original.probability > 0.0 {
                kl_forward += q * (q / original.probability).log2();
                kl_backward += original.probability * (original.probability / q).log2();
            }
            symbols.push(Symbol::new(original.label, q));
        }
        log::debug!(
            "KL divergence due to smoothing: KL(P||Q) = {kl_forward:.10} bps, \
             KL(Q||P) = {kl_backward:.10} bps"
        );

        Self::new(symbols, self.seed, self.affix.clone())
    }

    /// Produce a deterministic sample sequence following this distribution.
    ///
    /// Each symbol appears `ceil(p * count)` times, so the result can be up to
    /// `len()` samples longer than `count`. The order is shuffled with the
    /// source seed (0 when absent).
    pub fn generate_symbols(&self, count: usize) -> Vec<u32> {
        let mut samples = Vec::with_capacity(count + self.symbols.len());
        for symbol in &self.symbols {
            let repetitions = (symbol.probability * count as f64).ceil() as usize;
            samples.extend(std::iter::repeat(symbol.label).take(repetitions));
        }
        let mut rng = StdRng::seed_from_u64(self.seed.unwrap_or(0));
        samples.shuffle(&mut rng);
        samples
    }

    /// Symbols sorted by decreasing probability.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Symbol at a given position of the probability order.
    pub fn symbol(&self, position: usize) -> Symbol {
        self.symbols[position]
    }

    /// Position of a label in the probability order.
    pub fn position(&self, label: u32) -> Option<usize> {
        self.positions.get(&label).copied()
    }

    /// Number of symbols in the alphabet.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Always false: a source holds at least one symbol.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Seed used to generate this source, if any.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Free-form description of the source kind.
    pub fn affix(&self) -> &str {
        &self.affix
    }

    /// Probabilities in symbol order.
    pub fn probabilities(&self) -> Vec<f64> {
        self.symbols.iter().map(|s| s.probability).collect()
    }

    /// Labels in symbol order.
    pub fn labels(&self) -> Vec<u32> {
        self.symbols.iter().map(|s| s.label).collect()
    }

    /// Shannon entropy in bits per symbol.
    pub fn entropy(&self) -> f64 {
        entropy_of(&self.probabilities())
    }

    /// Descriptive name including the affix, alphabet size, entropy and seed.
    pub fn name(&self) -> String {
        let mut name = String::from("Source");
        if !self.affix.is_empty() {
            name.push('_');
            name.push_str(&self.affix);
        }
        name.push_str(&format!(
            "_{}symbols_entropy{:.7}",
            self.symbols.len(),
            self.entropy()
        ));
        if let Some(seed) = self.seed {
            name.push_str(&format!("_seed{seed:#x}"));
        }
        name
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// A source of meta-symbols plus the mapping back to the grouped symbols.
#[derive(Clone, Debug)]
pub struct MetaSource {
    source: Source,
    members: Vec<Vec<Symbol>>,
    member_to_meta: HashMap<u32, (u32, usize)>,
}

impl MetaSource {
    /// The meta-symbol distribution. Meta labels are block indices.
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Symbols grouped under a meta label, in the original probability order.
    pub fn members(&self, meta_label: u32) -> Option<&[Symbol]> {
        self.members.get(meta_label as usize).map(Vec::as_slice)
    }

    /// Meta label and offset within it for an original label.
    pub fn locate(&self, label: u32) -> Option<(u32, usize)> {
        self.member_to_meta.get(&label).copied()
    }

    /// Original symbol at `offset` inside `meta_label`.
    pub fn member(&self, meta_label: u32, offset: usize) -> Option<Symbol> {
        self.members(meta_label)?.get(offset).copied()
    }
}

/// Empirical entropy of a sample sequence, in bits per sample.
pub fn input_entropy(samples: &[u32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &sample in samples {
        *counts.entry(sample).or_default() += 1;
    }
    let total = samples.len() as f64;
    let probabilities: Vec<f64> = counts.values().map(|&c| c as f64 / total).collect();
    entropy_of(&probabilities)
}

fn entropy_of(probabilities: &[f64]) -> f64 {
    probabilities
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.log2())
        .sum()
}

fn sort_descending(symbols: &mut [Symbol]) {
    symbols.sort_by(|a, b| {
        b.probability
            .total_cmp(&a.probability)
            .then(a.label.cmp(&b.label))
    });
}

fn laplace_pdf(symbol_count: usize, scale: f64) -> Vec<f64> {
    let mut pdf = vec![0.0; symbol_count];
    for i in 0..LAPLACIAN_PERIODS * symbol_count {
        pdf[i % symbol_count] += (-(i as f64) / scale).exp();
    }
    for p in pdf.iter_mut() {
        if *p <= MIN_SYMBOL_PROBABILITY {
            *p = 0.0;
        }
    }
    let sum: f64 = pdf.iter().sum();
    pdf.iter_mut().for_each(|p| *p /= sum);
    pdf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_validation() {
        assert!(Source::from_probabilities(&[0.5, 0.25, 0.25]).is_ok());
        assert!(Source::from_probabilities(&[]).is_err());
        assert!(Source::from_probabilities(&[0.5, 0.25]).is_err());
        assert!(Source::from_probabilities(&[0.25, 0.75]).is_err());
        assert!(Source::from_probabilities(&[1.5, -0.5]).is_err());
        let repeated = vec![Symbol::new(1, 0.5), Symbol::new(1, 0.5)];
        assert!(Source::new(repeated, None, "").is_err());
    }

    #[test]
    fn test_entropy() {
        let source = Source::from_probabilities(&[0.25; 4]).unwrap();
        assert!((source.entropy() - 2.0).abs() < 1e-12);
        let source = Source::from_probabilities(&[1.0, 0.0]).unwrap();
        assert_eq!(source.entropy(), 0.0);
        let source = Source::from_probabilities(&[0.5, 0.25, 0.125, 0.125]).unwrap();
        assert!((source.entropy() - 1.75).abs() < 1e-12);
    }

    #[test]
    fn test_from_frequency_data() {
        let source = Source::from_frequency_data(&[3, 3, 3, 1, 1, 7, 3, 1]).unwrap();
        assert_eq!(source.labels(), vec![3, 1, 7]);
        assert_eq!(source.probabilities(), vec![0.5, 0.375, 0.125]);
        assert_eq!(source.position(7), Some(2));
        assert_eq!(source.position(4), None);
    }

    #[test]
    fn test_from_average_distributions() {
        let a = BTreeMap::from([(0, 0.5), (1, 0.5)]);
        let b = BTreeMap::from([(0, 1.0)]);
        let source = Source::from_average_distributions(&[a.clone(), b.clone()], Some(4)).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.labels(), vec![0, 1, 2, 3]);
        assert_eq!(source.probabilities(), vec![0.75, 0.25, 0.0, 0.0]);

        assert!(Source::from_average_distributions(&[a, b], Some(1)).is_err());
        assert!(Source::from_average_distributions(&[], None).is_err());
    }

    #[test]
    fn test_laplacian_entropy_fraction() {
        let source = Source::laplacian(8, 0.5, 7).unwrap();
        assert_eq!(source.len(), 8);
        assert_eq!(source.affix(), "Laplacian");
        assert_eq!(source.seed(), Some(7));
        assert!((source.entropy() / 3.0 - 0.5).abs() <= 1e-9);

        let uniform = Source::laplacian(4, 1.0, 0).unwrap();
        assert!((uniform.entropy() - 2.0).abs() < 1e-12);

        assert!(Source::laplacian(0, 0.5, 0).is_err());
        assert!(Source::laplacian(4, 1.5, 0).is_err());
    }

    #[test]
    fn test_meta_source() {
        let source = Source::from_probabilities(&[0.4, 0.2, 0.2, 0.1, 0.1]).unwrap();
        let meta = source.meta(2).unwrap();
        assert_eq!(meta.source().len(), 3);
        let probabilities = meta.source().probabilities();
        assert!((probabilities[0] - 0.6).abs() < 1e-12);
        assert!((probabilities[1] - 0.3).abs() < 1e-12);
        assert!((probabilities[2] - 0.1).abs() < 1e-12);

        for symbol in source.symbols() {
            let (meta_label, offset) = meta.locate(symbol.label).unwrap();
            assert_eq!(meta.member(meta_label, offset), Some(*symbol));
        }
        assert_eq!(meta.locate(3), Some((1, 1)));
        assert!(source.meta(0).is_err());
    }

    #[test]
    fn test_smoothing_returns_new_source() {
        let source = Source::from_probabilities(&[0.4, 0.25, 0.15, 0.12, 0.08]).unwrap();
        let smoothed = source.smoothed_symmetric().unwrap();
        assert_eq!(source.probabilities(), vec![0.4, 0.25, 0.15, 0.12, 0.08]);
        let p = smoothed.probabilities();
        assert!((p[1] - p[2]).abs() < 1e-15);
        assert!((p[3] - p[4]).abs() < 1e-15);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_generate_symbols_is_deterministic() {
        let source = Source::laplacian(6, 0.6, 42).unwrap();
        let a = source.generate_symbols(5000);
        let b = source.generate_symbols(5000);
        assert_eq!(a, b);
        assert!(a.len() >= 5000 && a.len() < 5000 + source.len());
        assert!((input_entropy(&a) - source.entropy()).abs() < 1e-2);
    }

    #[test]
    fn test_source_serde_validates() {
        let source = Source::from_probabilities(&[0.75, 0.25]).unwrap();
        let json = serde_json::to_string(&source).unwrap();
        let back: Source = serde_json::from_str(&json).unwrap();
        assert_eq!(back.labels(), source.labels());
        assert_eq!(back.position(1), Some(1));

        let broken = json.replace("0.25", "0.5");
        assert!(serde_json::from_str::<Source>(&broken).is_err());
    }
}
