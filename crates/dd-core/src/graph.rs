//! Hash Matching Engine
//!
//! Each (component, header) pair owns two graphs of hash nodes: a
//! performance graph and a predictive graph. A node holds a perfect hash
//! table of the substrings expected to start within
//! `first_index..=last_index`. Traversal tries, in order:
//!
//! 1. every window inside the expected range,
//! 2. windows up to `drift` characters outside it,
//! 3. hashes within `difference` of a window hash.
//!
//! The first hit is followed; otherwise the node's unmatched child is.
//! Negative child values are leaves encoding a profile offset.

use std::sync::Arc;

use crate::collection::{Collection, MemoryTracker, Source};
use crate::config::HashConfig;
use crate::dataset::{
    graph_leaf_profile, DataSetError, DataSetHeader, GraphRecord, HashNode, SectionId, HASH_NODE_FIXED_SIZE, NO_OFFSET,
};
use crate::hash::{rk_hash, RollingWindows};
use crate::types::{GraphKind, MatchMethod};

/// Graph engine sections of a data set.
pub struct GraphData {
    graphs: Vec<GraphRecord>,
    nodes: Collection<HashNode>,
    max_steps: u64,
}

impl GraphData {
    pub fn load(
        source: &Arc<Source>,
        header: &DataSetHeader,
        cache: usize,
        tracker: &mut MemoryTracker,
    ) -> Result<Self, DataSetError> {
        let records: Collection<GraphRecord> =
            Collection::new(Arc::clone(source), header.require(SectionId::HashGraphs)?, 0, tracker)?;
        let graphs = (0..records.count())
            .map(|i| records.value(i))
            .collect::<Result<Vec<_>, _>>()?;
        tracker.add(graphs.len() * std::mem::size_of::<GraphRecord>());

        let nodes: Collection<HashNode> =
            Collection::new(Arc::clone(source), header.require(SectionId::HashNodes)?, cache, tracker)?;
        let max_steps = nodes.byte_length() / HASH_NODE_FIXED_SIZE as u64 + 1;

        for graph in &graphs {
            if graph.component >= header.component_count {
                return Err(DataSetError::CorruptData(format!(
                    "graph references component {}",
                    graph.component
                )));
            }
            for root in [graph.performance_root, graph.predictive_root] {
                if root != NO_OFFSET && root as u64 >= nodes.byte_length() {
                    return Err(DataSetError::CorruptData(format!("graph root {root} out of range")));
                }
            }
        }

        Ok(Self {
            graphs,
            nodes,
            max_steps,
        })
    }

    pub fn graphs(&self) -> &[GraphRecord] {
        &self.graphs
    }

    pub fn graph(&self, component: u8, header: u32) -> Option<&GraphRecord> {
        self.graphs
            .iter()
            .find(|g| g.component == component as u16 && g.header as u32 == header)
    }

    pub fn node(&self, offset: u32) -> Result<Arc<HashNode>, DataSetError> {
        self.nodes.get(offset)
    }

    pub fn node_bytes(&self) -> u64 {
        self.nodes.byte_length()
    }
}

/// Outcome of matching one component against one header value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphMatch {
    pub method: MatchMethod,
    pub profile_offset: Option<u32>,
    pub difference: i32,
    pub drift: i32,
    pub iterations: u32,
    pub matched_nodes: u32,
    /// `(start, length)` of every matched substring.
    pub spans: Vec<(usize, usize)>,
}

#[derive(Debug, Clone, Copy)]
struct Hit {
    value: i32,
    start: usize,
    difference: i32,
    drift: i32,
}

/// Match `target` with the graphs of one (component, header) pair.
///
/// The performance graph goes first; the predictive graph is tried only if
/// the performance graph produced no profile. A disabled graph is never
/// traversed.
pub fn match_graph(
    data: &GraphData,
    graph: &GraphRecord,
    target: &[u8],
    config: &HashConfig,
) -> Result<GraphMatch, DataSetError> {
    let mut iterations = 0;
    let candidates = [
        (GraphKind::Performance, config.use_performance_graph, graph.performance_root),
        (GraphKind::Predictive, config.use_predictive_graph, graph.predictive_root),
    ];
    for (kind, enabled, root) in candidates {
        if !enabled || root == NO_OFFSET {
            continue;
        }
        let found = traverse(data, root, target, config, kind)?;
        iterations += found.iterations;
        if found.method.is_match() {
            return Ok(GraphMatch { iterations, ..found });
        }
    }
    Ok(GraphMatch {
        iterations,
        ..GraphMatch::default()
    })
}

fn traverse(
    data: &GraphData,
    root: u32,
    target: &[u8],
    config: &HashConfig,
    kind: GraphKind,
) -> Result<GraphMatch, DataSetError> {
    let mut found = GraphMatch::default();
    let mut value = i32::try_from(root).map_err(|_| DataSetError::CorruptData(format!("graph root {root}")))?;
    let mut steps = 0u64;

    let profile = loop {
        steps += 1;
        if steps > data.max_steps {
            return Err(DataSetError::CorruptData("graph traversal does not terminate".to_string()));
        }
        found.iterations += 1;
        let node = data.node(value as u32)?;
        value = match find(&node, target, config) {
            Some(hit) => {
                found.matched_nodes += 1;
                found.difference += hit.difference;
                found.drift = found.drift.max(hit.drift);
                found.spans.push((hit.start, node.length as usize));
                hit.value
            }
            None => node.unmatched,
        };
        if value < 0 {
            break graph_leaf_profile(value);
        }
    };

    if found.matched_nodes > 0 && profile.is_some() {
        found.method = kind.method();
        found.profile_offset = profile;
    }
    Ok(found)
}

fn find(node: &HashNode, target: &[u8], config: &HashConfig) -> Option<Hit> {
    let length = node.length as usize;
    if node.hash_count == 0 || length == 0 || target.len() < length {
        return None;
    }
    let first = node.first_index.max(0) as usize;
    let last = node.last_index.max(0) as usize;
    let hit = |value, start, difference, drift| Hit {
        value,
        start,
        difference,
        drift,
    };

    // Expected range
    let windows: Vec<(usize, u32)> = RollingWindows::new(target, length, first, last).collect();
    for &(start, hash) in &windows {
        if let Some(value) = node.lookup(hash) {
            return Some(hit(value, start, 0, 0));
        }
    }

    // Drift
    for drift in 1..=config.drift.max(0) as usize {
        let before = first.checked_sub(drift);
        let after = Some(last + drift);
        for start in [before, after].into_iter().flatten() {
            if start + length > target.len() {
                continue;
            }
            if let Some(value) = node.lookup(rk_hash(&target[start..start + length])) {
                return Some(hit(value, start, 0, drift as i32));
            }
        }
    }

    // Difference
    for delta in 1..=config.difference.max(0) {
        for &(start, hash) in &windows {
            for candidate in [hash.wrapping_add(delta as u32), hash.wrapping_sub(delta as u32)] {
                if let Some(value) = node.lookup(candidate) {
                    return Some(hit(value, start, delta, 0));
                }
            }
        }
    }
    None
}

/// The target with every character outside the matched spans replaced by `_`.
pub fn matched_characters(target: &[u8], spans: &[(usize, usize)]) -> String {
    let mut buffer = vec![b'_'; target.len()];
    for &(start, length) in spans {
        let end = (start + length).min(target.len());
        if start < end {
            buffer[start..end].copy_from_slice(&target[start..end]);
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{graph_leaf, HashSlot, GRAPH_NO_MATCH};

    fn node_for(substrings: &[(&[u8], i32)], first: i16, last: i16) -> HashNode {
        let length = substrings[0].0.len() as u16;
        let modulo = 31u32;
        let mut slots = vec![
            HashSlot {
                hash: 0,
                value: GRAPH_NO_MATCH
            };
            modulo as usize
        ];
        for &(s, value) in substrings {
            let hash = rk_hash(s);
            slots[(hash % modulo) as usize] = HashSlot { hash, value };
        }
        HashNode {
            first_index: first,
            last_index: last,
            length,
            modulo,
            unmatched: GRAPH_NO_MATCH,
            hash_count: substrings.len() as u32,
            slots,
        }
    }

    #[test]
    fn finds_within_expected_range() {
        let node = node_for(&[(b"iPhone", graph_leaf(8))], 5, 14);
        let target = b"Mozilla (iPhone; CPU)";
        let hit = find(&node, target, &HashConfig::default()).unwrap();
        assert_eq!(hit.start, 9);
        assert_eq!(hit.drift, 0);

        let node = node_for(&[(b"iPhone", graph_leaf(8))], 0, 5);
        assert!(find(&node, target, &HashConfig::default()).is_none());
    }

    #[test]
    fn drift_widens_range() {
        let node = node_for(&[(b"iPhone", graph_leaf(8))], 12, 14);
        let target = b"Mozilla (iPhone; CPU)";
        assert!(find(&node, target, &HashConfig::default()).is_none());

        let config = HashConfig {
            drift: 3,
            ..HashConfig::default()
        };
        let hit = find(&node, target, &config).unwrap();
        assert_eq!(hit.start, 9);
        assert_eq!(hit.drift, 3);
    }

    #[test]
    fn difference_tolerates_last_character() {
        let node = node_for(&[(b"Chrome/90", graph_leaf(4))], 0, 0);
        let target = b"Chrome/93";
        assert!(find(&node, target, &HashConfig::default()).is_none());

        let config = HashConfig {
            difference: 3,
            ..HashConfig::default()
        };
        let hit = find(&node, target, &config).unwrap();
        assert_eq!(hit.difference, 3);
        assert_eq!(graph_leaf_profile(hit.value), Some(4));
    }

    #[test]
    fn matched_characters_masks_unmatched() {
        assert_eq!(matched_characters(b"abcdef", &[(1, 2), (5, 4)]), "_bc__f");
    }
}
