//! Binary v2f header.
//!
//! The header describes every tree of a positionally routed forest in the
//! layout consumed by the C codec. All integers are unsigned big-endian.
//!
//! ```text
//! total_entry_count      4
//! bytes_per_word         1
//! bytes_per_sample       1
//! max_expected_value     2   (A - 1)
//! root_count - 1         2
//! per tree:
//!   root_entry_count     4
//!   root_included_count  4
//!   per entry (decreasing raw word probability):
//!     index              4
//!     child_count        4
//!     child indices      4 each, children sorted by label
//!     if included:
//!       word length      2
//!       labels           bytes_per_sample each
//!       word index       bytes_per_word
//!   root child count     4
//!   (child index 4, label bytes_per_sample) sorted by label
//! ```

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::forest::{Forest, ForestKind};
use crate::source::Source;
use crate::tree::{bits_for, NodeId, Tree, ROOT};

const INDEX_BYTES: usize = 4;

fn put(out: &mut Vec<u8>, value: u64, bytes: usize) {
    for shift in (0..bytes).rev() {
        out.push((value >> (8 * shift)) as u8);
    }
}

fn bytes_for_bits(bits: u32) -> usize {
    bits.div_ceil(8) as usize
}

/// Serialize `forest` as a v2f header.
///
/// # Errors
/// `Error::UnsupportedRouting` unless every word routes to
/// `min(T - 1, children)`; `Error::InvalidParameter` when the alphabet,
/// labels, tree count or word lengths exceed the header field widths.
pub fn header_bytes(forest: &Forest) -> Result<Vec<u8>> {
    if !forest.is_positionally_routed() {
        return Err(Error::UnsupportedRouting);
    }
    let source = forest.source();
    let alphabet = source.len();
    if !(2..=1 << 16).contains(&alphabet) {
        return Err(Error::InvalidParameter(format!(
            "v2f headers need between 2 and 65536 symbols, got {alphabet}"
        )));
    }
    if let Some(label) = source.labels().into_iter().find(|&l| l as usize >= alphabet) {
        return Err(Error::InvalidParameter(format!(
            "label {label} is outside 0..{alphabet}"
        )));
    }
    let trees = forest.trees();
    if trees.len() > 1 << 16 {
        return Err(Error::InvalidParameter(format!(
            "{} trees do not fit a v2f header",
            trees.len()
        )));
    }
    let total_entries: usize = trees.iter().map(Tree::node_count).sum();
    if total_entries > u32::MAX as usize {
        return Err(Error::InvalidParameter(format!(
            "{total_entries} entries do not fit a v2f header"
        )));
    }

    let max_included = trees.iter().map(Tree::included_count).max().unwrap_or(0);
    let bytes_per_word = bytes_for_bits(bits_for(max_included)).max(1);
    let bytes_per_sample = bytes_for_bits(bits_for(alphabet));

    let mut out = Vec::new();
    put(&mut out, total_entries as u64, 4);
    put(&mut out, bytes_per_word as u64, 1);
    put(&mut out, bytes_per_sample as u64, 1);
    put(&mut out, (alphabet - 1) as u64, 2);
    put(&mut out, (trees.len() - 1) as u64, 2);

    for (index, tree) in trees.iter().enumerate() {
        log::debug!("writing tree {index} with {} entries", tree.node_count());
        write_tree(&mut out, tree, bytes_per_word, bytes_per_sample)?;
    }
    Ok(out)
}

fn write_tree(
    out: &mut Vec<u8>,
    tree: &Tree,
    bytes_per_word: usize,
    bytes_per_sample: usize,
) -> Result<()> {
    let mut entries = tree.nodes_depth_first();
    entries.sort_by(|&a, &b| {
        tree.raw_word_probability(b)
            .total_cmp(&tree.raw_word_probability(a))
    });
    let entry_index: HashMap<NodeId, usize> =
        entries.iter().enumerate().map(|(i, &node)| (node, i)).collect();
    let included: Vec<NodeId> = entries
        .iter()
        .copied()
        .filter(|&node| tree.is_included(node))
        .collect();
    let word_index: HashMap<NodeId, usize> =
        included.iter().enumerate().map(|(i, &node)| (node, i)).collect();

    let sorted_children = |node: NodeId| {
        let mut children: Vec<(u32, NodeId)> = tree
            .node(node)
            .children()
            .iter()
            .map(|&(position, child)| (tree.source().symbol(position).label, child))
            .collect();
        children.sort_unstable();
        children
    };

    put(out, entries.len() as u64, 4);
    put(out, included.len() as u64, 4);
    for (index, &node) in entries.iter().enumerate() {
        put(out, index as u64, INDEX_BYTES);
        let children = sorted_children(node);
        put(out, children.len() as u64, 4);
        for (_, child) in &children {
            put(out, entry_index[child] as u64, INDEX_BYTES);
        }
        if let Some(&word) = word_index.get(&node) {
            let labels = tree.word_labels(node);
            if labels.len() > u16::MAX as usize {
                return Err(Error::InvalidParameter(format!(
                    "word of length {} does not fit a v2f header",
                    labels.len()
                )));
            }
            put(out, labels.len() as u64, 2);
            for label in labels {
                put(out, u64::from(label), bytes_per_sample);
            }
            put(out, word as u64, bytes_per_word);
        }
    }

    let root_children = sorted_children(ROOT);
    put(out, root_children.len() as u64, 4);
    for (label, child) in root_children {
        put(out, entry_index[&child] as u64, INDEX_BYTES);
        put(out, u64::from(label), bytes_per_sample);
    }
    Ok(())
}

/// Write `forest` as a v2f header.
pub fn write_header<W: Write>(forest: &Forest, writer: &mut W) -> Result<()> {
    writer.write_all(&header_bytes(forest)?)?;
    Ok(())
}

/// Read a v2f header written for `source`.
pub fn read_header<R: Read>(reader: &mut R, source: &Source) -> Result<Forest> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    parse_header(&bytes, source)
}

fn corrupted(message: impl Into<String>) -> Error {
    Error::CorruptedHeader(message.into())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Cursor<'_> {
    fn get(&mut self, width: usize) -> Result<u64> {
        let end = self.offset + width;
        let field = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| corrupted(format!("truncated at byte {}", self.offset)))?;
        self.offset = end;
        Ok(field.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }

    fn get_usize(&mut self, width: usize) -> Result<usize> {
        Ok(self.get(width)? as usize)
    }

    /// An entry index below `entry_count`.
    fn get_entry(&mut self, entry_count: usize) -> Result<usize> {
        let entry = self.get_usize(INDEX_BYTES)?;
        if entry >= entry_count {
            return Err(corrupted(format!("entry index {entry} out of range")));
        }
        Ok(entry)
    }

    /// A label of `source`, returned as its symbol position.
    fn get_position(&mut self, source: &Source, width: usize) -> Result<usize> {
        let label = self.get(width)?;
        u32::try_from(label)
            .ok()
            .and_then(|label| source.position(label))
            .ok_or_else(|| corrupted(format!("unknown label {label}")))
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }
}

fn check_count(what: &str, declared: usize, rebuilt: usize) -> Result<()> {
    if declared != rebuilt {
        return Err(corrupted(format!(
            "{what}: {declared} declared, words rebuild {rebuilt}"
        )));
    }
    Ok(())
}

struct Entry {
    children: Vec<usize>,
    word: Option<usize>,
}

/// Parse a v2f header and rebuild its forest over `source`.
///
/// # Errors
/// `Error::CorruptedHeader` for truncated input, out-of-range fields or any
/// structure that differs from what the included words rebuild.
pub fn parse_header(bytes: &[u8], source: &Source) -> Result<Forest> {
    let mut cursor = Cursor { bytes, offset: 0 };
    let total_entries = cursor.get_usize(4)?;
    let bytes_per_word = cursor.get_usize(1)?;
    let bytes_per_sample = cursor.get_usize(1)?;
    let alphabet = cursor.get_usize(2)? + 1;
    let root_count = cursor.get_usize(2)? + 1;

    if !(1..=4).contains(&bytes_per_word) {
        return Err(corrupted(format!("bytes_per_word {bytes_per_word}")));
    }
    if !(1..=2).contains(&bytes_per_sample) {
        return Err(corrupted(format!("bytes_per_sample {bytes_per_sample}")));
    }
    if alphabet != source.len() {
        return Err(corrupted(format!(
            "header alphabet of {alphabet} symbols, source has {}",
            source.len()
        )));
    }

    let mut trees = Vec::with_capacity(root_count.min(cursor.remaining()));
    let mut seen_entries = 0usize;
    for index in 0..root_count {
        let tree = parse_tree(&mut cursor, source, bytes_per_word, bytes_per_sample)
            .map_err(|err| match err {
                Error::CorruptedHeader(message) => corrupted(format!("tree {index}: {message}")),
                other => other,
            })?;
        seen_entries += tree.node_count();
        trees.push(tree);
    }
    if seen_entries != total_entries {
        return Err(corrupted(format!(
            "declared {total_entries} entries, found {seen_entries}"
        )));
    }
    if cursor.remaining() != 0 {
        return Err(corrupted(format!("{} trailing bytes", cursor.remaining())));
    }
    Forest::positional(ForestKind::Header, source.clone(), trees)
}

fn parse_tree(
    cursor: &mut Cursor<'_>,
    source: &Source,
    bytes_per_word: usize,
    bytes_per_sample: usize,
) -> Result<Tree> {
    let alphabet = source.len();
    let entry_count = cursor.get_usize(4)?;
    let included_count = cursor.get_usize(4)?;
    // Every entry takes at least its index and child count.
    if entry_count > cursor.remaining() / 8 {
        return Err(corrupted(format!("{entry_count} entries exceed the input")));
    }
    if included_count > entry_count {
        return Err(corrupted(format!(
            "{included_count} included of {entry_count} entries"
        )));
    }

    let mut entries = Vec::with_capacity(entry_count);
    let mut words: Vec<Option<Vec<usize>>> = vec![None; included_count];
    for expected in 0..entry_count {
        let index = cursor.get_usize(INDEX_BYTES)?;
        if index != expected {
            return Err(corrupted(format!("entry {expected} declares index {index}")));
        }
        let child_count = cursor.get_usize(4)?;
        if child_count > alphabet {
            return Err(corrupted(format!("entry {index} has {child_count} children")));
        }
        let children = (0..child_count)
            .map(|_| cursor.get_entry(entry_count))
            .collect::<Result<Vec<_>>>()?;

        let mut word = None;
        if child_count < alphabet {
            let length = cursor.get_usize(2)?;
            if length == 0 {
                return Err(corrupted(format!("entry {index} has an empty word")));
            }
            let positions = (0..length)
                .map(|_| cursor.get_position(source, bytes_per_sample))
                .collect::<Result<Vec<_>>>()?;
            let slot = cursor.get_usize(bytes_per_word)?;
            match words.get_mut(slot) {
                Some(entry @ None) => *entry = Some(positions),
                Some(Some(_)) => return Err(corrupted(format!("word index {slot} repeated"))),
                None => return Err(corrupted(format!("word index {slot} out of range"))),
            }
            word = Some(slot);
        }
        entries.push(Entry { children, word });
    }

    let root_child_count = cursor.get_usize(4)?;
    if root_child_count > alphabet {
        return Err(corrupted(format!("root has {root_child_count} children")));
    }
    let root_children = (0..root_child_count)
        .map(|_| {
            let child = cursor.get_entry(entry_count)?;
            Ok((child, cursor.get_position(source, bytes_per_sample)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tree = Tree::empty(included_count, source);
    let mut word_nodes = Vec::with_capacity(included_count);
    for (slot, word) in words.iter().enumerate() {
        let positions = word
            .as_ref()
            .ok_or_else(|| corrupted(format!("word index {slot} missing")))?;
        word_nodes.push(tree.insert_word(positions));
    }

    check_count("entries", entry_count, tree.node_count())?;
    check_count("included entries", included_count, tree.included_count())?;

    let entry_node = |entry: usize| entries[entry].word.map(|slot| word_nodes[slot]);
    for entry in &entries {
        let Some(slot) = entry.word else {
            continue;
        };
        let node = word_nodes[slot];
        check_count(
            &format!("children of word {slot}"),
            entry.children.len(),
            tree.children_count(node),
        )?;
        for &child in &entry.children {
            if let Some(child_node) = entry_node(child) {
                if tree.node(child_node).parent() != Some(node) {
                    return Err(corrupted(format!("entry {child} is not a child of word {slot}")));
                }
            }
        }
    }

    check_count("root children", root_children.len(), tree.children_count(ROOT))?;
    for (child, position) in root_children {
        let rebuilt = tree
            .child(ROOT, position)
            .ok_or_else(|| corrupted(format!("root child {child} has no words below it")))?;
        if let Some(declared) = entry_node(child) {
            if declared != rebuilt {
                return Err(corrupted(format!("root child {child} mismatch")));
            }
        }
    }
    Ok(tree)
}
