//! Evidence overrides
//!
//! Two kinds of override are read from query and cookie evidence, query
//! first:
//!
//! - profile overrides (`51D_ProfileIds`, `51D_deviceId`): profile ids that
//!   replace the matched profile of their component,
//! - property overrides (`51D_<Name>`): a literal value for an overridable
//!   property.
//!
//! Malformed values are skipped, never reported.

use crate::dataset::DataSet;
use crate::evidence::{Evidence, DEVICE_ID_KEY, OVERRIDE_PRECEDENCE, PROFILE_IDS_KEY, PROPERTY_OVERRIDE_PREFIX};
use crate::results::DetectionResult;
use crate::types::PropertyFlags;

/// Overrides collected from one request's evidence.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Profile offset per component.
    profiles: Vec<Option<u32>>,
    /// `(property index, value)`, first occurrence wins.
    properties: Vec<(u32, String)>,
}

impl Overrides {
    pub fn from_evidence(data_set: &DataSet, evidence: &Evidence) -> Self {
        let mut overrides = Self {
            profiles: vec![None; data_set.component_count()],
            properties: Vec::new(),
        };

        for prefix in OVERRIDE_PRECEDENCE {
            for item in evidence.iter_prefix(prefix) {
                if item.key.eq_ignore_ascii_case(PROFILE_IDS_KEY) || item.key.eq_ignore_ascii_case(DEVICE_ID_KEY) {
                    overrides.add_profile_ids(data_set, &item.value);
                }
            }
        }

        for property in data_set.properties() {
            if !property.flags.contains(PropertyFlags::OVERRIDABLE) {
                continue;
            }
            let key = format!("{PROPERTY_OVERRIDE_PREFIX}{}", property.name);
            let found = evidence
                .get_all(&OVERRIDE_PRECEDENCE, &key)
                .find(|v| !v.is_empty())
                .map(str::to_string);
            if let Some(value) = found {
                overrides.properties.push((property.index, value));
            }
        }

        overrides
    }

    /// Parse `-`, `|` or `,` separated profile ids. Components that already
    /// have an override keep it.
    fn add_profile_ids(&mut self, data_set: &DataSet, value: &str) {
        for segment in value.split(|c: char| matches!(c, '-' | '|' | ',')) {
            let Ok(profile_id) = segment.trim().parse::<u32>() else {
                log::debug!("ignoring profile id override segment '{segment}'");
                continue;
            };
            if profile_id == 0 {
                continue;
            }
            let offset = match data_set.profile_offset(profile_id) {
                Ok(Some(offset)) => offset,
                Ok(None) => {
                    log::debug!("profile id override {profile_id} is not in the data set");
                    continue;
                }
                Err(e) => {
                    log::debug!("profile id override {profile_id}: {e}");
                    continue;
                }
            };
            match data_set.profile(offset) {
                Ok(profile) => {
                    if let Some(slot) = self.profiles.get_mut(profile.component as usize) {
                        slot.get_or_insert(offset);
                    }
                }
                Err(e) => log::debug!("profile id override {profile_id}: {e}"),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty() && !self.has_profiles()
    }

    pub fn has_profiles(&self) -> bool {
        self.profiles.iter().any(Option::is_some)
    }

    pub fn profile(&self, component: usize) -> Option<u32> {
        self.profiles.get(component).copied().flatten()
    }

    pub fn property_value(&self, property: u32) -> Option<&str> {
        self.properties
            .iter()
            .find(|(index, _)| *index == property)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_property(&self, property: u32) -> bool {
        self.property_value(property).is_some()
    }

    /// Replace matched profiles with the overridden ones in every result.
    ///
    /// When nothing was matched an empty result is added to carry them.
    pub fn apply(&self, results: &mut Vec<DetectionResult>, component_count: usize) {
        if !self.has_profiles() {
            return;
        }
        if results.is_empty() {
            results.push(DetectionResult::empty(None, component_count));
        }
        for result in results.iter_mut() {
            for (component, profile) in self.profiles.iter().enumerate() {
                if let Some(offset) = profile {
                    result.profile_offsets[component] = Some(*offset);
                    result.overridden[component] = true;
                }
            }
        }
    }
}
