//! # Variable-to-Fixed (V2F) Coding Forests
//!
//! *Fixed-length codewords for variable-length runs of symbols.*
//!
//! ## Intuition First
//!
//! Huffman coding reads one symbol at a time and writes a variable number of
//! bits. A V2F code turns that around: it reads a variable number of symbols
//! and always writes the same number of bits. The dictionary is a tree whose
//! leaves are words; frequent runs such as `0 0 0 0` get one codeword, rare
//! symbols get a short word of their own. Because every codeword has the same
//! length, a decoder is a single table lookup per word, with no bit-level
//! parsing at all.
//!
//! ## The Problem
//!
//! A single tree wastes part of its codeword space: after a word that stopped
//! because the next symbol was not one of its children, the decoder already
//! knows something about that next symbol. Forests exploit this by keeping one
//! tree per context and routing each word to the tree built for what may
//! follow it.
//!
//! ## Historical Context
//!
//! ```text
//! 1967  Tunstall          Optimal V2F codes for memoryless sources
//! 2001  Yamamoto, Yokoo   Almost-instantaneous VF codes, one tree per context
//! 2020  Martinez et al.   Marlin forests: meta-symbols and Markov refinement
//! ```
//!
//! ## Mathematical Formulation
//!
//! For a source with probabilities $p_0 \ge p_1 \ge \dots \ge p_{A-1}$, a word
//! $w = s_1 \dots s_d$ has raw probability $\prod_i p_{s_i}$. An included node
//! with children $C$ is emitted with probability
//!
//! ```text
//! P(w) = raw(w) * (1 - sum_{c in C} p_c)
//! ```
//!
//! and the codec spends $\lceil \log_2 N \rceil$ bits per word for $N$ included
//! nodes, so its rate is that width divided by the expected word length
//! $\sum_w P(w) \cdot |w|$.
//!
//! ## Complexity Analysis
//!
//! - **Tunstall**: $O(N^2 \log N)$ as written (re-sorts the node list).
//! - **Marlin / Fast-Yamamoto**: $O(N \log N)$ heap operations.
//! - **Yamamoto**: $O(N \cdot A \log N)$, each round plans up to $A$ expansions.
//! - **Coding**: $O(\text{depth})$ per word.
//!
//! ## Failure Modes
//!
//! 1. **Skewed sources**: with $p_0 \to 1$, words get deep and trees need many
//!    nodes before the rate approaches the entropy.
//! 2. **Markov refinement cycles**: dictionaries can oscillate between a few
//!    word sets; the loops stop on repeats and report why they stopped.
//!
//! ## Implementation Notes
//!
//! - Trees are flat arenas indexed by [`NodeId`]; builders never share nodes.
//! - [`Forest`] is immutable once built; coding state lives in a
//!   [`CodingSession`] created per message.
//! - [`header`] writes the binary layout read by the C decoder; [`archive`]
//!   stores forests as tagged JSON.
//!
//! ## References
//!
//! - Tunstall, B. (1967). "Synthesis of noiseless compression codes."
//!   PhD thesis, Georgia Tech.
//! - Yamamoto, H., Yokoo, H. (2001). "Average-sense optimality and competitive
//!   optimality for almost instantaneous VF codes."
//! - Martinez, M., Hernandez-Cabronero, M., Blanes, I., Serra-Sagrista, J.
//!   (2020). "High-throughput variable-to-fixed entropy codec using selective,
//!   stochastic code forests."

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod archive;
pub mod builder;
pub mod config;
pub mod error;
pub mod forest;
pub mod header;
pub mod markov_forest;
pub mod marlin;
pub mod source;
pub mod tree;
pub mod tunstall;
pub mod yamamoto;

pub use archive::ForestArchive;
pub use builder::TreeBuilder;
pub use config::{ForestParams, MarkovForestParams, RefinementConfig};
pub use error::{Error, Result};
pub use forest::{AnyForest, CodedMessage, CodingSession, Forest, ForestKind, NodeRef};
pub use header::{parse_header, read_header, write_header};
pub use markov_forest::{MarkovCodedMessage, MarlinMarkovForest};
pub use marlin::{MarkovTree, RefinementReport, StopReason};
pub use source::{MetaSource, Source, Symbol};
pub use tree::{NodeId, Tree};
