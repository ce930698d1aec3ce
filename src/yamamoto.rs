//! Yamamoto-Yokoo dictionaries.
//!
//! A Yamamoto tree is built for one coding context: the previous word ended
//! on a node with `first` children, so the `first` most probable symbols
//! cannot open the next word and their root branches are never grown.
//!
//! Each round compares two ways of spending the same number of new words:
//!
//! - **S1**: fully expand the most probable node.
//! - **S2**: add one child to each of the locally best nodes, ranked by the
//!   probability of their next unused child.
//!
//! S2 is planned against an immutable snapshot of the tree and only applied
//! if it wins, so the real tree is never cloned.
//!
//! # References
//!
//! - Yamamoto, Yokoo (2001). "Average-sense optimality and competitive
//!   optimality for almost instantaneous VF codes." IEEE Trans. Inf. Theory.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use crate::error::{Error, Result};
use crate::source::Source;
use crate::tree::{NodeId, Tree, ROOT};

/// Progress is logged every this many expansions by the fast builder.
const PROGRESS_INTERVAL: usize = 5000;

/// Heap entry, valid while the node still has `children` children.
#[derive(Clone, Copy, Debug)]
struct Ranked {
    probability: f64,
    children: usize,
    node: NodeId,
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.probability
            .total_cmp(&other.probability)
            .then_with(|| self.children.cmp(&other.children))
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

fn check_first_allowed(alphabet: usize, first: usize) -> Result<()> {
    if alphabet < 2 || first > alphabet - 2 {
        return Err(Error::InvalidParameter(format!(
            "first allowed symbol index {first} needs at least {} symbols, got {alphabet}",
            first + 2
        )));
    }
    Ok(())
}

/// Tree view with a few uncommitted nodes on top.
///
/// Virtual nodes get the ids the real tree would assign if the same
/// children were added in the same order.
struct Overlay<'a> {
    tree: &'a Tree,
    next_id: NodeId,
    children: HashMap<NodeId, usize>,
    raw: HashMap<NodeId, f64>,
}

impl<'a> Overlay<'a> {
    fn new(tree: &'a Tree) -> Self {
        Self {
            tree,
            next_id: tree.arena_len(),
            children: HashMap::new(),
            raw: HashMap::new(),
        }
    }

    fn is_real(&self, node: NodeId) -> bool {
        node < self.tree.arena_len()
    }

    fn children_count(&self, node: NodeId) -> usize {
        match self.children.get(&node) {
            Some(&count) => count,
            None if self.is_real(node) => self.tree.children_count(node),
            None => 0,
        }
    }

    fn raw_probability(&self, node: NodeId) -> f64 {
        if self.is_real(node) {
            self.tree.raw_word_probability(node)
        } else {
            self.raw.get(&node).copied().unwrap_or(0.0)
        }
    }

    fn add_child(&mut self, parent: NodeId, position: usize) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        let probability =
            self.raw_probability(parent) * self.tree.source().symbol(position).probability;
        self.raw.insert(id, probability);
        let count = self.children_count(parent) + 1;
        self.children.insert(parent, count);
        id
    }
}

/// A sequence of child insertions and the raw mass it adds.
#[derive(Debug, Default)]
struct Plan {
    steps: Vec<(NodeId, usize)>,
    gain: f64,
    expansions: usize,
}

fn next_child_entry(raw: f64, children: usize, node: NodeId, probabilities: &[f64]) -> Ranked {
    Ranked {
        probability: raw * probabilities[children],
        children,
        node,
    }
}

/// Plan `count` single-child expansions, each on the node whose next unused
/// child is most probable. A node reaching `A - 1` children also receives the
/// last symbol, which costs no extra word.
fn plan_local_expansions(tree: &Tree, tilde: &BinaryHeap<Ranked>, count: usize) -> Plan {
    let alphabet = tree.alphabet_size();
    let probabilities = tree.source().probabilities();
    let mut heap = tilde.clone();
    let mut overlay = Overlay::new(tree);
    let mut plan = Plan::default();

    while plan.expansions < count {
        let Some(entry) = heap.pop() else {
            break;
        };
        if overlay.children_count(entry.node) != entry.children {
            continue;
        }
        let position = entry.children;
        let new_node = overlay.add_child(entry.node, position);
        plan.steps.push((entry.node, position));
        plan.gain += overlay.raw_probability(new_node);

        let mut requeued = entry.node;
        if position + 1 == alphabet - 1 {
            let last = overlay.add_child(entry.node, alphabet - 1);
            plan.steps.push((entry.node, alphabet - 1));
            plan.gain += overlay.raw_probability(last);
            requeued = last;
        }
        for node in [requeued, new_node] {
            heap.push(next_child_entry(
                overlay.raw_probability(node),
                overlay.children_count(node),
                node,
                &probabilities,
            ));
        }
        plan.expansions += 1;
    }
    plan
}

struct Queues {
    hat: BinaryHeap<Ranked>,
    tilde: BinaryHeap<Ranked>,
    probabilities: Vec<f64>,
}

impl Queues {
    fn push(&mut self, tree: &Tree, node: NodeId) {
        let children = tree.children_count(node);
        let raw = tree.raw_word_probability(node);
        self.hat.push(Ranked {
            probability: raw,
            children,
            node,
        });
        self.tilde
            .push(next_child_entry(raw, children, node, &self.probabilities));
    }

    /// Most probable expandable node, dropping stale entries on the way.
    fn best(&mut self, tree: &Tree) -> Option<Ranked> {
        while let Some(&top) = self.hat.peek() {
            if tree.children_count(top.node) == top.children {
                return Some(top);
            }
            self.hat.pop();
        }
        None
    }

    fn expand_fully(&mut self, tree: &mut Tree, node: NodeId) {
        for position in tree.children_count(node)..tree.alphabet_size() {
            let child = tree.add_child(node, position);
            self.push(tree, child);
        }
    }

    fn apply(&mut self, tree: &mut Tree, plan: &Plan) {
        let mut touched = BTreeSet::new();
        for &(parent, position) in &plan.steps {
            let child = tree.add_child(parent, position);
            touched.insert(parent);
            touched.insert(child);
        }
        for node in touched {
            if tree.children_count(node) < tree.alphabet_size() {
                self.push(tree, node);
            }
        }
    }
}

/// Yamamoto-Yokoo construction for the context `first_allowed_symbol_index`.
///
/// # Errors
/// Returns `Error::InvalidParameter` unless `first_allowed_symbol_index <= A - 2`.
pub fn build_yamamoto(
    size: usize,
    source: &Source,
    first_allowed_symbol_index: usize,
) -> Result<Tree> {
    let alphabet = source.len();
    check_first_allowed(alphabet, first_allowed_symbol_index)?;
    let mut tree = Tree::new(size, source)?;

    let mut queues = Queues {
        hat: BinaryHeap::new(),
        tilde: BinaryHeap::new(),
        probabilities: source.probabilities(),
    };
    for position in first_allowed_symbol_index..alphabet {
        let node = tree.add_child(ROOT, position);
        queues.push(&tree, node);
    }

    let mut node_count = alphabet - first_allowed_symbol_index;
    while node_count < size {
        let Some(best) = queues.best(&tree) else {
            break;
        };
        let expansion_count = alphabet - best.children - 1;

        let added = if node_count + expansion_count <= size {
            let s1 = best.probability * queues.probabilities[best.children..].iter().sum::<f64>();
            let plan = plan_local_expansions(&tree, &queues.tilde, expansion_count);
            if s1 >= plan.gain {
                queues.expand_fully(&mut tree, best.node);
                expansion_count
            } else {
                queues.apply(&mut tree, &plan);
                plan.expansions
            }
        } else {
            let plan = plan_local_expansions(&tree, &queues.tilde, size - node_count);
            queues.apply(&mut tree, &plan);
            plan.expansions
        };
        if added == 0 {
            break;
        }
        node_count += added;
    }
    Ok(tree)
}

/// Yamamoto construction without the S1/S2 comparison.
///
/// Every root branch is created, but only the branches from
/// `first_allowed_symbol_index` on are ever expanded. Exactly `size - A`
/// single-child expansions are made.
pub fn build_fast_yamamoto(
    size: usize,
    source: &Source,
    first_allowed_symbol_index: usize,
) -> Result<Tree> {
    let alphabet = source.len();
    check_first_allowed(alphabet, first_allowed_symbol_index)?;
    let mut tree = Tree::new(size, source)?;

    let mut heap = BinaryHeap::with_capacity(size + 1);
    for position in 0..alphabet {
        let node = tree.add_child(ROOT, position);
        if position >= first_allowed_symbol_index {
            heap.push(Ranked {
                probability: tree.word_probability(node),
                children: 0,
                node,
            });
        }
    }

    for processed in 0..size - alphabet {
        if processed % PROGRESS_INTERVAL == 0 {
            log::info!("Forest generation {source} :: processed {processed} nodes");
        }
        let Some(best) = heap.pop() else {
            break;
        };
        let child = tree.add_child(best.node, best.children);
        heap.push(Ranked {
            probability: tree.word_probability(child),
            children: 0,
            node: child,
        });

        let children = tree.children_count(best.node);
        if children < alphabet - 1 {
            heap.push(Ranked {
                probability: tree.word_probability(best.node),
                children,
                node: best.node,
            });
        } else {
            let last = tree.add_child(best.node, alphabet - 1);
            heap.push(Ranked {
                probability: tree.word_probability(last),
                children: 0,
                node: last,
            });
        }
    }
    log::info!("Forest generation {source} :: processed all nodes");
    Ok(tree)
}
