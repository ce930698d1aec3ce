//! Trivial and Tunstall dictionaries.
//!
//! # Historical Context
//!
//! Brian Tunstall (1967) gave the first optimal variable-to-fixed code for
//! memoryless sources: repeatedly replace the most probable word by all of its
//! one-symbol extensions.

use crate::error::Result;
use crate::source::Source;
use crate::tree::{NodeId, Tree, ROOT};

/// One child per symbol under the root.
pub fn build_trivial(size: usize, source: &Source) -> Result<Tree> {
    let mut tree = Tree::new(size, source)?;
    for position in 0..source.len() {
        tree.add_child(ROOT, position);
    }
    Ok(tree)
}

/// Tunstall's algorithm: fully expand the most probable node while the
/// created node count stays within `size`.
pub fn build_tunstall(size: usize, source: &Source) -> Result<Tree> {
    let mut tree = Tree::new(size, source)?;
    let alphabet = source.len();
    let mut node_list: Vec<NodeId> = (0..alphabet).map(|p| tree.add_child(ROOT, p)).collect();

    while node_list.len() + alphabet <= size {
        node_list.sort_by(|&a, &b| tree.word_probability(a).total_cmp(&tree.word_probability(b)));
        let Some(&best) = node_list.last() else {
            break;
        };
        for position in 0..alphabet {
            node_list.push(tree.add_child(best, position));
        }
    }
    Ok(tree)
}
