//! Nearest and closest signature scoring
//!
//! Both phases score the same shortlist. The shortlist tallies, for every
//! signature sharing a node with the exact node list, how many nodes it
//! shares and how many characters those nodes cover. Scoring then only
//! looks at the nodes of a candidate that were not found exactly.

use std::collections::BTreeMap;

use super::{NodeLookup, PatternData, PatternWorkset};
use crate::dataset::{DataSetError, Node};

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    count: u32,
    characters: u32,
}

/// Up to `limit` candidate signature indexes, best first.
pub(super) fn shortlist(
    data: &PatternData,
    workset: &mut PatternWorkset<'_>,
    limit: usize,
) -> Result<Vec<u32>, DataSetError> {
    // Rightmost node first, then the most specific nodes.
    let mut order: Vec<_> = workset.nodes.iter().collect();
    if order.len() > 1 {
        order[1..].sort_by_key(|found| found.node.signature_count);
    }

    let mut tallies: BTreeMap<u32, Tally> = BTreeMap::new();
    let mut visited = 0u32;
    for found in order {
        for rank in data.node_ranks(&found.node)? {
            visited += 1;
            let tally = tallies.entry(rank).or_default();
            tally.count += 1;
            tally.characters += found.node.characters.len() as u32;
        }
    }
    workset.iterations += visited;

    let mut ranked: Vec<(u32, Tally)> = tallies.into_iter().collect();
    ranked.sort_by(|(rank_a, a), (rank_b, b)| {
        b.characters
            .cmp(&a.characters)
            .then(b.count.cmp(&a.count))
            .then(rank_a.cmp(rank_b))
    });
    ranked.truncate(limit);

    ranked
        .into_iter()
        .map(|(rank, _)| data.signature_for_rank(rank))
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct Best {
    index: u32,
    score: u64,
    sample: u64,
}

impl Best {
    /// `score / sample` compared without division.
    fn beaten_by(&self, score: u64, sample: u64) -> bool {
        score * self.sample < self.score * sample
    }

    fn exceeded_by(&self, score: u64, sample: u64) -> bool {
        score * self.sample > self.score * sample
    }
}

/// Score every candidate and return the best as `(signature, normalized score)`.
///
/// `scorer` returns `None` when a node cannot be placed, which rules the
/// candidate out. Ties keep the earlier candidate.
pub(super) fn score<F>(
    data: &PatternData,
    workset: &mut PatternWorkset<'_>,
    candidates: &[u32],
    scorer: F,
) -> Result<Option<(u32, i32)>, DataSetError>
where
    F: Fn(&[u8], &Node) -> Option<u64>,
{
    let mut best: Option<Best> = None;

    'candidates: for &index in candidates {
        let signature = data.signature(index)?;
        let offsets = data.signature_nodes(&signature)?;
        let missing: Vec<u32> = offsets.into_iter().filter(|&o| !workset.contains(o)).collect();
        let sample = missing.len().max(1) as u64;

        let mut total = 0u64;
        for offset in missing {
            workset.iterations += 1;
            let node = data.node(offset)?;
            match scorer(workset.target, &node) {
                Some(score) => total += score,
                None => continue 'candidates,
            }
            if best.is_some_and(|b| b.exceeded_by(total, sample)) {
                continue 'candidates;
            }
        }

        if best.map_or(true, |b| b.beaten_by(total, sample)) {
            best = Some(Best {
                index,
                score: total,
                sample,
            });
        }
    }

    Ok(best.map(|b| (b.index, (b.score / b.sample) as i32)))
}

/// Distance between the node's expected start and its nearest occurrence.
pub(super) fn nearest_score(target: &[u8], node: &Node) -> Option<u64> {
    let expected = node.start() as i64;
    occurrences(target, &node.characters)
        .map(|found| (found as i64 - expected).unsigned_abs())
        .min()
}

/// Sum of character differences at the node's expected position.
///
/// Characters beyond the end of the target count their full value.
pub(super) fn closest_score(target: &[u8], node: &Node) -> Option<u64> {
    let start = node.start().max(0) as usize;
    let score = node
        .characters
        .iter()
        .enumerate()
        .map(|(i, &expected)| match target.get(start + i) {
            Some(&actual) => (actual as i64 - expected as i64).unsigned_abs(),
            None => expected as u64,
        })
        .sum();
    Some(score)
}

/// Start of the occurrence of the node's characters nearest its expected start.
pub(super) fn nearest_occurrence(target: &[u8], node: &Node) -> Option<usize> {
    let expected = node.start() as i64;
    occurrences(target, &node.characters).min_by_key(|&found| (found as i64 - expected).unsigned_abs())
}

fn occurrences<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    let windows = if needle.is_empty() || needle.len() > haystack.len() {
        None
    } else {
        Some(haystack.windows(needle.len()))
    };
    windows
        .into_iter()
        .flatten()
        .enumerate()
        .filter(move |(_, window)| *window == needle)
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occurrences_finds_every_start() {
        let found: Vec<_> = occurrences(b"abcabcab", b"ab").collect();
        assert_eq!(found, vec![0, 3, 6]);
        assert_eq!(occurrences(b"ab", b"abc").count(), 0);
        assert_eq!(occurrences(b"ab", b"").count(), 0);
    }

    #[test]
    fn best_compares_normalized_scores() {
        let best = Best { index: 0, score: 4, sample: 2 };
        assert!(best.beaten_by(1, 1));
        assert!(!best.beaten_by(2, 1));
        assert!(!best.beaten_by(6, 3));
        assert!(best.exceeded_by(7, 3));
    }
}
