//! Detection results
//!
//! A [`Results`] holds one [`DetectionResult`] per header used by a request,
//! the overrides found in its evidence, and a shared handle on the data set
//! that produced it. The handle keeps that data set alive after a reload, so
//! values read from a `Results` always come from the data set it was built
//! with.
//!
//! Property values are checked against the acceptance policy before being
//! returned. A property has no value when, in this order:
//!
//! 1. the required property index is out of range,
//! 2. there are no results,
//! 3. no result covers the property's component,
//! 4. the covering result did not match and unmatched results are not allowed,
//! 5. its difference or drift exceeds the configured maximum,
//! 6. its profile for the component is null.
//!
//! Checks 4 and 5 are skipped for components whose profile was overridden.

use std::sync::Arc;

use serde::Serialize;

use crate::dataset::{DataSet, DataSetError};
use crate::overrides::Overrides;
use crate::types::{MatchMethod, PropertyFlags};

/// Why a property has no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NoValueReason {
    #[error("property index is not a required property")]
    InvalidProperty,
    #[error("no results")]
    NoResults,
    #[error("no result for the property's component")]
    NoResultForComponent,
    #[error("profile for the component is null")]
    NullProfile,
    #[error("no match and unmatched results are not allowed")]
    Unmatched,
    #[error("difference exceeds the configured maximum")]
    DifferenceExceeded,
    #[error("drift exceeds the configured maximum")]
    DriftExceeded,
    #[error("corrupt data: {0}")]
    CorruptData(String),
}

impl From<DataSetError> for NoValueReason {
    fn from(e: DataSetError) -> Self {
        Self::CorruptData(e.to_string())
    }
}

/// Match outcome for one header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Index of the header the target came from; `None` when the result was
    /// not produced from a header.
    pub header: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub method: MatchMethod,
    pub difference: i32,
    pub drift: i32,
    pub iterations: u32,
    pub matched_nodes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_index: Option<u32>,
    /// Profile offset per component.
    pub profile_offsets: Vec<Option<u32>>,
    /// Per component, whether the profile came from an override.
    pub overridden: Vec<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_target: Option<String>,
}

impl DetectionResult {
    pub fn empty(header: Option<u32>, component_count: usize) -> Self {
        Self {
            header,
            target: None,
            method: MatchMethod::None,
            difference: 0,
            drift: 0,
            iterations: 0,
            matched_nodes: 0,
            signature_index: None,
            profile_offsets: vec![None; component_count],
            overridden: vec![false; component_count],
            matched_target: None,
        }
    }

    pub fn profile_offset(&self, component: usize) -> Option<u32> {
        self.profile_offsets.get(component).copied().flatten()
    }

    pub fn is_overridden(&self, component: usize) -> bool {
        self.overridden.get(component).copied().unwrap_or(false)
    }
}

/// Results of one request.
pub struct Results {
    data_set: Arc<DataSet>,
    results: Vec<DetectionResult>,
    overrides: Overrides,
    present_headers: Vec<bool>,
}

impl std::fmt::Debug for Results {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Results")
            .field("results", &self.results)
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl Results {
    pub fn new(
        data_set: Arc<DataSet>,
        results: Vec<DetectionResult>,
        overrides: Overrides,
        present_headers: Vec<bool>,
    ) -> Self {
        Self {
            data_set,
            results,
            overrides,
            present_headers,
        }
    }

    /// The data set these results were produced with.
    pub fn data_set(&self) -> &Arc<DataSet> {
        &self.data_set
    }

    pub fn results(&self) -> &[DetectionResult] {
        &self.results
    }

    pub fn result_mut(&mut self, index: usize) -> Option<&mut DetectionResult> {
        self.results.get_mut(index)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Whether the header at `index` was present in the evidence.
    pub fn header_present(&self, index: u32) -> bool {
        self.present_headers.get(index as usize).copied().unwrap_or(false)
    }

    /// The result that governs `component`.
    ///
    /// Results from the component's headers are preferred in header
    /// precedence order, first those holding a profile for the component,
    /// then any result holding one, then any result from one of its headers,
    /// then a result not tied to a header.
    pub fn result_for_component(&self, component: usize) -> Option<&DetectionResult> {
        let headers = &self.data_set.components().get(component)?.headers;
        let from = |h: u32| self.results.iter().filter(move |r| r.header == Some(h));

        headers
            .iter()
            .find_map(|&h| from(h).find(|r| r.profile_offset(component).is_some()))
            .or_else(|| self.results.iter().find(|r| r.profile_offset(component).is_some()))
            .or_else(|| headers.iter().find_map(|&h| from(h).next()))
            .or_else(|| self.results.iter().find(|r| r.header.is_none()))
    }

    /// Profile offset of a component after the acceptance policy.
    pub fn component_profile(&self, component: usize) -> Result<u32, NoValueReason> {
        if self.results.is_empty() {
            return Err(NoValueReason::NoResults);
        }
        let result = self
            .result_for_component(component)
            .ok_or(NoValueReason::NoResultForComponent)?;

        if !result.is_overridden(component) {
            let policy = &self.data_set.config().results;
            if result.method == MatchMethod::None && !policy.allow_unmatched {
                return Err(NoValueReason::Unmatched);
            }
            if policy.max_difference.is_some_and(|max| result.difference > max) {
                return Err(NoValueReason::DifferenceExceeded);
            }
            if policy.max_drift.is_some_and(|max| result.drift > max) {
                return Err(NoValueReason::DriftExceeded);
            }
        }
        result.profile_offset(component).ok_or(NoValueReason::NullProfile)
    }

    /// Values of the required property at `index`.
    pub fn values(&self, index: usize) -> Result<Vec<Arc<str>>, NoValueReason> {
        let property = self
            .data_set
            .required_property(index)
            .ok_or(NoValueReason::InvalidProperty)?;

        if let Some(value) = self.overrides.property_value(property.index) {
            return Ok(vec![Arc::from(value)]);
        }

        // The snippet that calculates an overridden property has run already.
        if property.flags.contains(PropertyFlags::JAVASCRIPT) {
            if let Some(target) = property.overrides_property {
                if self.overrides.has_property(target) {
                    return Ok(vec![Arc::from("")]);
                }
            }
        }

        if !property.suppress_headers.is_empty() && property.suppress_headers.iter().all(|&h| self.header_present(h)) {
            return Ok(vec![Arc::from("")]);
        }

        let offset = self.component_profile(property.component as usize)?;
        let profile = self.data_set.profile(offset)?;
        Ok(self.data_set.profile_values(&profile, property)?)
    }

    pub fn values_by_name(&self, name: &str) -> Result<Vec<Arc<str>>, NoValueReason> {
        let index = self.data_set.required_index(name).ok_or(NoValueReason::InvalidProperty)?;
        self.values(index)
    }

    /// Values of a property joined with `separator`.
    pub fn value_string(&self, name: &str, separator: &str) -> Result<String, NoValueReason> {
        let values = self.values_by_name(name)?;
        Ok(values.iter().map(|v| v.as_ref()).collect::<Vec<_>>().join(separator))
    }

    pub fn has_values(&self, index: usize) -> bool {
        self.values(index).is_ok()
    }

    pub fn no_value_reason(&self, index: usize) -> Option<NoValueReason> {
        self.values(index).err()
    }

    /// Profile id per component, 0 where there is none or the policy rejects it.
    pub fn profile_ids(&self) -> Vec<u32> {
        (0..self.data_set.component_count())
            .map(|c| {
                self.component_profile(c)
                    .ok()
                    .and_then(|offset| self.data_set.profile(offset).ok())
                    .map_or(0, |profile| profile.profile_id)
            })
            .collect()
    }

    /// Profile ids joined with `-` in component order.
    pub fn device_id(&self) -> String {
        self.profile_ids()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Method of the first result, `None` without results.
    pub fn method(&self) -> MatchMethod {
        self.results.first().map_or(MatchMethod::None, |r| r.method)
    }

    /// Largest difference over all results.
    pub fn difference(&self) -> i32 {
        self.results.iter().map(|r| r.difference).max().unwrap_or(0)
    }

    /// Largest drift over all results.
    pub fn drift(&self) -> i32 {
        self.results.iter().map(|r| r.drift).max().unwrap_or(0)
    }
}
