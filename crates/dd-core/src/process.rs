//! Request processing
//!
//! Turns evidence into [`Results`] with whichever engine the data set is
//! configured for.

use std::sync::Arc;

use crate::dataset::{ActiveEngine, DataSet};
use crate::evidence::Evidence;
use crate::graph::{self, GraphMatch};
use crate::overrides::Overrides;
use crate::pattern::{self, PatternMatch};
use crate::results::{DetectionResult, Results};
use crate::types::MatchMethod;

const USER_AGENT: &str = "User-Agent";

impl DataSet {
    /// Detect from request evidence.
    pub fn process_evidence(self: &Arc<Self>, evidence: &Evidence) -> Results {
        let present: Vec<bool> = self.headers().iter().map(|h| evidence.header(h).is_some()).collect();

        let mut results = match self.engine() {
            ActiveEngine::Pattern => self.pattern_results(evidence, &present),
            ActiveEngine::Hash => self.graph_results(evidence, &present),
        };
        self.fill_unmatched(&mut results);

        let overrides = Overrides::from_evidence(self, evidence);
        overrides.apply(&mut results, self.component_count());
        Results::new(Arc::clone(self), results, overrides, present)
    }

    /// Detect from a User-Agent string alone.
    pub fn process_user_agent(self: &Arc<Self>, user_agent: &str) -> Results {
        let header = self.header_index(USER_AGENT);
        let mut present = vec![false; self.headers().len()];
        if let Some(h) = header {
            present[h as usize] = true;
        }

        let mut result = match self.engine() {
            ActiveEngine::Pattern => self.pattern_result(header, user_agent),
            ActiveEngine::Hash => {
                let mut result = DetectionResult::empty(header, self.component_count());
                result.target = Some(user_agent.to_string());
                let mut spans = Vec::new();
                if let Some(h) = header {
                    for component in 0..self.component_count() {
                        if let Some(found) = self.graph_match(component, h, user_agent) {
                            spans.extend(merge_graph_match(&mut result, component, found));
                        }
                    }
                }
                self.finish_graph_result(&mut result, &spans);
                result
            }
        };
        self.fill_unmatched(std::slice::from_mut(&mut result));
        Results::new(Arc::clone(self), vec![result], Overrides::default(), present)
    }

    /// Adopt the profiles named by a device id without matching.
    ///
    /// Segments are positional per component. A segment that does not parse,
    /// names an unknown profile, or names a profile of another component
    /// leaves that component null.
    pub fn process_device_id(self: &Arc<Self>, device_id: &str) -> Results {
        let count = self.component_count();
        let mut result = DetectionResult::empty(None, count);

        for (component, segment) in device_id.split('-').enumerate().take(count) {
            let Ok(profile_id) = segment.trim().parse::<u32>() else {
                log::debug!("device id segment '{segment}' is not a profile id");
                continue;
            };
            if profile_id == 0 {
                continue;
            }
            let offset = match self.profile_offset(profile_id) {
                Ok(Some(offset)) => offset,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("device id profile {profile_id}: {e}");
                    continue;
                }
            };
            match self.profile(offset) {
                Ok(profile) if profile.component as usize == component => {
                    result.profile_offsets[component] = Some(offset);
                    result.overridden[component] = true;
                }
                Ok(_) => log::debug!("device id profile {profile_id} belongs to another component"),
                Err(e) => log::debug!("device id profile {profile_id}: {e}"),
            }
        }

        let present = vec![false; self.headers().len()];
        Results::new(Arc::clone(self), vec![result], Overrides::default(), present)
    }

    // -------------------------------------------------------------------------
    // Pattern
    // -------------------------------------------------------------------------

    /// One result per present header any component uses. Identical targets
    /// are matched once.
    fn pattern_results(&self, evidence: &Evidence, present: &[bool]) -> Vec<DetectionResult> {
        let mut results: Vec<DetectionResult> = Vec::new();
        for (index, name) in self.headers().iter().enumerate() {
            let index = index as u32;
            if !present[index as usize] || !self.components().iter().any(|c| c.headers.contains(&index)) {
                continue;
            }
            let Some(target) = evidence.header(name) else { continue };

            let reused = results
                .iter()
                .find(|r| r.target.as_deref() == Some(target))
                .cloned();
            let result = match reused {
                Some(mut result) => {
                    result.header = Some(index);
                    result
                }
                None => self.pattern_result(Some(index), target),
            };
            results.push(result);
        }
        results
    }

    fn pattern_result(&self, header: Option<u32>, target: &str) -> DetectionResult {
        let mut result = DetectionResult::empty(header, self.component_count());
        result.target = Some(target.to_string());
        let Some(data) = self.pattern() else {
            return result;
        };

        let found: PatternMatch = pattern::match_target(data, target, &self.config().pattern);
        log::trace!("pattern {:?} difference {} for '{}'", found.method, found.difference, target);
        result.method = found.method;
        result.difference = found.difference;
        result.iterations = found.iterations;
        result.matched_nodes = found.matched_nodes;
        result.signature_index = found.signature_index;
        result.profile_offsets = found.profile_offsets;
        result.matched_target = found.matched_target;
        result
    }

    // -------------------------------------------------------------------------
    // Graph
    // -------------------------------------------------------------------------

    /// One result per present header. Each component takes its profile from
    /// the first of its headers, in precedence order, whose graph matches.
    fn graph_results(&self, evidence: &Evidence, present: &[bool]) -> Vec<DetectionResult> {
        let count = self.component_count();
        let mut results: Vec<DetectionResult> = Vec::new();
        let mut slots: Vec<Option<usize>> = vec![None; self.headers().len()];
        for (index, name) in self.headers().iter().enumerate() {
            if let Some(target) = present[index].then(|| evidence.header(name)).flatten() {
                let mut result = DetectionResult::empty(Some(index as u32), count);
                result.target = Some(target.to_string());
                slots[index] = Some(results.len());
                results.push(result);
            }
        }

        let mut spans: Vec<Vec<(usize, usize)>> = vec![Vec::new(); results.len()];
        for (component, details) in self.components().iter().enumerate() {
            for &header in &details.headers {
                let Some(slot) = slots.get(header as usize).copied().flatten() else {
                    continue;
                };
                let Some(target) = results[slot].target.clone() else { continue };
                if let Some(found) = self.graph_match(component, header, &target) {
                    let profile = found.profile_offset.is_some();
                    spans[slot].extend(merge_graph_match(&mut results[slot], component, found));
                    if profile {
                        break;
                    }
                }
            }
        }

        for (result, spans) in results.iter_mut().zip(&spans) {
            self.finish_graph_result(result, spans);
        }
        results
    }

    fn graph_match(&self, component: usize, header: u32, target: &str) -> Option<GraphMatch> {
        let data = self.graphs()?;
        let record = data.graph(component as u8, header)?;
        match graph::match_graph(data, record, target.as_bytes(), &self.config().hash) {
            Ok(found) => Some(found),
            Err(e) => {
                log::debug!("graph match aborted: {e}");
                None
            }
        }
    }

    fn finish_graph_result(&self, result: &mut DetectionResult, spans: &[(usize, usize)]) {
        if !self.config().hash.update_matched_user_agent {
            return;
        }
        if let Some(target) = result.target.as_deref() {
            result.matched_target = Some(graph::matched_characters(target.as_bytes(), spans));
        }
    }

    /// Give components without a profile their default profile when
    /// unmatched results are allowed.
    fn fill_unmatched(&self, results: &mut [DetectionResult]) {
        if !self.config().results.allow_unmatched {
            return;
        }
        for result in results {
            for (component, details) in self.components().iter().enumerate() {
                if result.profile_offsets[component].is_none() {
                    result.profile_offsets[component] = details.default_profile;
                }
            }
        }
    }
}

/// Fold one component's graph match into a header's result, returning the
/// spans it matched.
fn merge_graph_match(result: &mut DetectionResult, component: usize, found: GraphMatch) -> Vec<(usize, usize)> {
    result.iterations += found.iterations;
    if found.profile_offset.is_none() {
        return Vec::new();
    }
    result.profile_offsets[component] = found.profile_offset;
    result.matched_nodes += found.matched_nodes;
    result.difference += found.difference;
    result.drift = result.drift.max(found.drift);
    result.method = match (result.method, found.method) {
        (MatchMethod::Predictive, _) | (_, MatchMethod::Predictive) => MatchMethod::Predictive,
        (_, method) => method,
    };
    found.spans
}
