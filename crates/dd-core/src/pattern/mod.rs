//! Pattern Matching Engine
//!
//! Maps a target string to a signature by walking the node tree.
//!
//! Phases, in order, stopping at the first that produces a signature:
//!
//! 1. **Exact**: extract the deepest complete node at each root position,
//!    right to left, and binary search the signatures for that node list.
//! 2. **Numeric**: extract again, letting digit-only child keys match the
//!    nearest value of the same magnitude.
//! 3. **Nearest** / **Closest**: score a shortlist of candidate signatures
//!    (see [`closest`]).
//!
//! Record read errors never escape a request: they end the match with
//! `MatchMethod::None`.

mod closest;

use std::sync::Arc;

use crate::collection::{Collection, MemoryTracker, Source};
use crate::config::PatternConfig;
use crate::dataset::{DataSetError, DataSetHeader, Node, SectionId, Signature, NO_OFFSET};
use crate::types::MatchMethod;

// =============================================================================
// Data
// =============================================================================

/// Read access to a node tree.
///
/// Implemented by the loaded data set and by the data set compiler, so both
/// extract node lists the same way.
pub trait NodeLookup {
    /// Number of root positions.
    fn root_count(&self) -> usize;

    /// Offset of the root node at `position`, if any.
    fn root(&self, position: usize) -> Result<Option<u32>, DataSetError>;

    fn node(&self, offset: u32) -> Result<Arc<Node>, DataSetError>;
}

/// Pattern engine sections of a data set.
pub struct PatternData {
    root_nodes: Collection<u32>,
    nodes: Collection<Node>,
    signatures: Collection<Signature>,
    signature_node_offsets: Collection<u32>,
    signature_profiles: Collection<u32>,
    node_ranked_signatures: Collection<u32>,
    ranked_signatures: Collection<u32>,
    component_count: usize,
}

impl PatternData {
    pub fn load(
        source: &Arc<Source>,
        header: &DataSetHeader,
        cache: usize,
        tracker: &mut MemoryTracker,
    ) -> Result<Self, DataSetError> {
        let component_count = header.component_count as usize;

        let data = Self {
            root_nodes: Collection::new(Arc::clone(source), header.require(SectionId::RootNodes)?, 0, tracker)?,
            nodes: Collection::new(Arc::clone(source), header.require(SectionId::Nodes)?, cache, tracker)?,
            signatures: Collection::new(Arc::clone(source), header.require(SectionId::Signatures)?, 0, tracker)?,
            signature_node_offsets: Collection::new(
                Arc::clone(source),
                header.require(SectionId::SignatureNodeOffsets)?,
                0,
                tracker,
            )?,
            signature_profiles: Collection::new(Arc::clone(source), header.require(SectionId::SignatureProfiles)?, 0, tracker)?,
            node_ranked_signatures: Collection::new(
                Arc::clone(source),
                header.require(SectionId::NodeRankedSignatureIndexes)?,
                0,
                tracker,
            )?,
            ranked_signatures: Collection::new(
                Arc::clone(source),
                header.require(SectionId::RankedSignatureIndexes)?,
                0,
                tracker,
            )?,
            component_count,
        };

        let signatures = data.signatures.count() as usize;
        if data.signature_profiles.count() as usize != signatures * component_count {
            return Err(DataSetError::CorruptData(format!(
                "{} signature profiles for {} signatures of {} components",
                data.signature_profiles.count(),
                signatures,
                component_count
            )));
        }
        if data.ranked_signatures.count() as usize != signatures {
            return Err(DataSetError::CorruptData(format!(
                "{} ranked signatures for {} signatures",
                data.ranked_signatures.count(),
                signatures
            )));
        }
        Ok(data)
    }

    pub fn signature_count(&self) -> u32 {
        self.signatures.count()
    }

    pub fn node_bytes(&self) -> u64 {
        self.nodes.byte_length()
    }

    pub fn signature(&self, index: u32) -> Result<Signature, DataSetError> {
        self.signatures.value(index)
    }

    /// Node offsets of a signature, ascending.
    pub fn signature_nodes(&self, signature: &Signature) -> Result<Vec<u32>, DataSetError> {
        (0..signature.node_count as u32)
            .map(|i| self.signature_node_offsets.value(signature.first_node + i))
            .collect()
    }

    /// Profile offset per component for a signature.
    pub fn signature_profiles(&self, index: u32) -> Result<Vec<Option<u32>>, DataSetError> {
        let base = index as usize * self.component_count;
        (0..self.component_count)
            .map(|c| {
                let offset = self.signature_profiles.value((base + c) as u32)?;
                Ok((offset != NO_OFFSET).then_some(offset))
            })
            .collect()
    }

    /// Ranks of the signatures that contain `node`, ascending.
    pub fn node_ranks(&self, node: &Node) -> Result<Vec<u32>, DataSetError> {
        (0..node.signature_count)
            .map(|i| self.node_ranked_signatures.value(node.first_signature + i))
            .collect()
    }

    /// Signature index for a rank.
    pub fn signature_for_rank(&self, rank: u32) -> Result<u32, DataSetError> {
        self.ranked_signatures.value(rank)
    }

    /// Binary search the signatures for an ascending node list.
    pub fn find_signature(&self, nodes: &[u32], iterations: &mut u32) -> Result<Option<u32>, DataSetError> {
        let found = self.signatures.binary_search_by(|signature| {
            *iterations += 1;
            let offsets = self.signature_nodes(signature)?;
            Ok(offsets.as_slice().cmp(nodes))
        })?;
        Ok(found.ok())
    }
}

impl NodeLookup for PatternData {
    fn root_count(&self) -> usize {
        self.root_nodes.count() as usize
    }

    fn root(&self, position: usize) -> Result<Option<u32>, DataSetError> {
        let offset = self.root_nodes.value(position as u32)?;
        Ok((offset != NO_OFFSET).then_some(offset))
    }

    fn node(&self, offset: u32) -> Result<Arc<Node>, DataSetError> {
        self.nodes.get(offset)
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// A node found in the target.
#[derive(Debug, Clone)]
pub struct FoundNode {
    pub offset: u32,
    pub node: Arc<Node>,
    /// Sum of numeric deltas accepted on the way to this node.
    pub difference: i32,
}

/// Extract the node list of `target`, rightmost node first.
///
/// With `numeric` set, a child key that is all digits and has no exact
/// child may match the numeric child nearest in value.
pub fn extract_nodes<T: NodeLookup + ?Sized>(
    tree: &T,
    target: &[u8],
    numeric: bool,
) -> Result<Vec<FoundNode>, DataSetError> {
    let mut found = Vec::new();
    let limit = target.len().min(tree.root_count());
    let mut position = limit as i32 - 1;
    while position >= 0 {
        match deepest_complete(tree, target, position as usize, numeric)? {
            Some(hit) => {
                let next = hit.node.next_char_position as i32;
                position = if next < position { next } else { position - 1 };
                found.push(hit);
            }
            None => position -= 1,
        }
    }
    Ok(found)
}

fn deepest_complete<T: NodeLookup + ?Sized>(
    tree: &T,
    target: &[u8],
    root_position: usize,
    numeric: bool,
) -> Result<Option<FoundNode>, DataSetError> {
    let Some(mut offset) = tree.root(root_position)? else {
        return Ok(None);
    };
    let mut node = tree.node(offset)?;
    let mut difference = 0i32;
    let mut best = None;

    loop {
        let key_length = node.child_key_length as i32;
        if key_length == 0 || node.children.is_empty() {
            break;
        }
        let end = node.position as i32;
        let start = end - key_length + 1;
        if start < 0 || end as usize >= target.len() {
            break;
        }
        let key = &target[start as usize..=end as usize];

        let next = match node.find_child(key) {
            Some(child) => Some(child),
            None if numeric => nearest_numeric(&node, key).map(|(child, delta)| {
                difference += delta;
                child
            }),
            None => None,
        };
        let Some(child) = next else { break };

        offset = child;
        node = tree.node(offset)?;
        if node.is_complete() {
            best = Some(FoundNode {
                offset,
                node: Arc::clone(&node),
                difference,
            });
        }
    }
    Ok(best)
}

/// Numeric child nearest to the digits in `key`, within the same power of ten.
fn nearest_numeric(node: &Node, key: &[u8]) -> Option<(u32, i32)> {
    if node.numeric_children.is_empty() || key.len() > 9 || !key.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value = key.iter().fold(0i32, |acc, b| acc * 10 + (b - b'0') as i32);
    let band = magnitude(value);
    node.numeric_children
        .iter()
        .filter(|child| magnitude(child.value) == band)
        .min_by_key(|child| (child.value - value).abs())
        .map(|child| (child.offset, (child.value - value).abs()))
}

fn magnitude(value: i32) -> u32 {
    value.max(1).ilog10()
}

// =============================================================================
// Matching
// =============================================================================

/// Outcome of matching one target string.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternMatch {
    pub method: MatchMethod,
    pub difference: i32,
    pub signature_index: Option<u32>,
    pub matched_nodes: u32,
    pub iterations: u32,
    pub profile_offsets: Vec<Option<u32>>,
    pub matched_target: Option<String>,
}

impl PatternMatch {
    fn none(component_count: usize, iterations: u32) -> Self {
        Self {
            method: MatchMethod::None,
            difference: 0,
            signature_index: None,
            matched_nodes: 0,
            iterations,
            profile_offsets: vec![None; component_count],
            matched_target: None,
        }
    }
}

/// Per-request state of the pattern engine.
pub struct PatternWorkset<'a> {
    pub target: &'a [u8],
    /// Exact nodes, rightmost first.
    pub nodes: Vec<FoundNode>,
    /// Exact node offsets, ascending.
    pub sorted: Vec<u32>,
    pub iterations: u32,
}

impl<'a> PatternWorkset<'a> {
    fn new(target: &'a [u8], nodes: Vec<FoundNode>) -> Self {
        let mut sorted: Vec<u32> = nodes.iter().map(|n| n.offset).collect();
        sorted.sort_unstable();
        sorted.dedup();
        Self {
            target,
            nodes,
            sorted,
            iterations: 0,
        }
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.sorted.binary_search(&offset).is_ok()
    }
}

/// Match `target` against the pattern sections.
pub fn match_target(data: &PatternData, target: &str, config: &PatternConfig) -> PatternMatch {
    match try_match(data, target.as_bytes(), config) {
        Ok(found) => found,
        Err(e) => {
            log::debug!("pattern match aborted: {e}");
            PatternMatch::none(data.component_count, 0)
        }
    }
}

fn try_match(data: &PatternData, target: &[u8], config: &PatternConfig) -> Result<PatternMatch, DataSetError> {
    let exact = extract_nodes(data, target, false)?;
    let mut workset = PatternWorkset::new(target, exact);

    // Exact
    if !workset.sorted.is_empty() {
        if let Some(index) = data.find_signature(&workset.sorted, &mut workset.iterations)? {
            let matched = workset.nodes.len() as u32;
            return finish(data, &workset, config, MatchMethod::Exact, 0, index, matched);
        }
    }

    // Numeric
    let numeric = extract_nodes(data, target, true)?;
    if numeric.iter().any(|n| n.difference > 0) {
        let mut offsets: Vec<u32> = numeric.iter().map(|n| n.offset).collect();
        offsets.sort_unstable();
        offsets.dedup();
        if let Some(index) = data.find_signature(&offsets, &mut workset.iterations)? {
            let difference = numeric.iter().map(|n| n.difference).sum();
            let matched = numeric.len() as u32;
            return finish(data, &workset, config, MatchMethod::Numeric, difference, index, matched);
        }
    }

    if config.closest_signatures == 0 || workset.nodes.is_empty() {
        return Ok(PatternMatch::none(data.component_count, workset.iterations));
    }

    // Nearest, then closest
    let shortlist = closest::shortlist(data, &mut workset, config.closest_signatures)?;
    if shortlist.is_empty() {
        return Ok(PatternMatch::none(data.component_count, workset.iterations));
    }
    let matched = workset.nodes.len() as u32;
    if let Some((index, score)) = closest::score(data, &mut workset, &shortlist, closest::nearest_score)? {
        return finish(data, &workset, config, MatchMethod::Nearest, score, index, matched);
    }
    if let Some((index, score)) = closest::score(data, &mut workset, &shortlist, closest::closest_score)? {
        return finish(data, &workset, config, MatchMethod::Closest, score, index, matched);
    }
    finish(data, &workset, config, MatchMethod::Closest, 0, shortlist[0], matched)
}

fn finish(
    data: &PatternData,
    workset: &PatternWorkset<'_>,
    config: &PatternConfig,
    method: MatchMethod,
    difference: i32,
    signature_index: u32,
    matched_nodes: u32,
) -> Result<PatternMatch, DataSetError> {
    let matched_target = if config.update_matched_user_agent {
        Some(matched_characters(data, workset.target, signature_index)?)
    } else {
        None
    };
    Ok(PatternMatch {
        method,
        difference,
        signature_index: Some(signature_index),
        matched_nodes,
        iterations: workset.iterations,
        profile_offsets: data.signature_profiles(signature_index)?,
        matched_target,
    })
}

/// The target with every character the signature does not account for
/// replaced by `_`.
fn matched_characters(data: &PatternData, target: &[u8], signature_index: u32) -> Result<String, DataSetError> {
    let mut buffer = vec![b'_'; target.len()];
    let signature = data.signature(signature_index)?;
    for offset in data.signature_nodes(&signature)? {
        let node = data.node(offset)?;
        let start = closest::nearest_occurrence(target, &node)
            .unwrap_or(node.start().max(0) as usize);
        for (i, &c) in node.characters.iter().enumerate() {
            if let Some(slot) = target.get(start + i) {
                if *slot == c {
                    buffer[start + i] = c;
                }
            }
        }
    }
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
