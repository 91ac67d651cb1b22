//! Declarative data set source
//!
//! The JSON document the compiler reads. Everything is referenced by name
//! except profiles, which are referenced by id.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::CompileError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSetSource {
    pub name: String,
    #[serde(default)]
    pub build_id: u32,
    /// Seconds since the epoch.
    #[serde(default)]
    pub published: u32,
    /// HTTP header names the data set matches on.
    pub headers: Vec<String>,
    pub components: Vec<ComponentSource>,
    pub properties: Vec<PropertySource>,
    pub profiles: Vec<ProfileSource>,
    #[serde(default)]
    pub patterns: Vec<PatternSource>,
    #[serde(default)]
    pub graphs: Vec<GraphSource>,
}

impl DataSetSource {
    pub fn from_json(json: &str) -> Result<Self, CompileError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSource {
    pub name: String,
    /// Profile used when nothing matched; 0 for none.
    #[serde(default)]
    pub default_profile: u32,
    /// Header names, highest precedence first.
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyFlagName {
    Overridable,
    Javascript,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertySource {
    pub name: String,
    pub component: String,
    #[serde(default)]
    pub flags: Vec<PropertyFlagName>,
    /// Property whose value this JavaScript property calculates.
    #[serde(default)]
    pub overrides: Option<String>,
    /// Headers whose joint presence empties the property.
    #[serde(default)]
    pub suppress_headers: Vec<String>,
    /// Values to list before those found in profiles.
    #[serde(default)]
    pub values: Vec<String>,
}

/// One value or a list of values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSource {
    One(String),
    Many(Vec<String>),
}

impl ValueSource {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(value) => std::slice::from_ref(value),
            Self::Many(values) => values,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSource {
    pub id: u32,
    pub component: String,
    /// Values keyed by property name.
    #[serde(default)]
    pub values: BTreeMap<String, ValueSource>,
}

/// A training string with its significant substrings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternSource {
    pub target: String,
    pub substrings: Vec<SubstringSource>,
    /// Profile ids, at most one per component.
    pub profiles: Vec<u32>,
    /// Popularity, lower is more popular. Unranked entries follow ranked
    /// ones in source order.
    #[serde(default)]
    pub rank: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstringSource {
    pub start: usize,
    pub text: String,
}

/// The graphs of one (component, header) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSource {
    pub component: String,
    pub header: String,
    #[serde(default)]
    pub performance: Option<HashNodeSource>,
    #[serde(default)]
    pub predictive: Option<HashNodeSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashNodeSource {
    pub first_index: i16,
    pub last_index: i16,
    #[serde(default)]
    pub children: Vec<HashChildSource>,
    #[serde(default)]
    pub unmatched: GraphTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashChildSource {
    pub substring: String,
    pub target: GraphTarget,
}

/// Where a graph edge leads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphTarget {
    #[default]
    NoMatch,
    Profile(u32),
    Node(Box<HashNodeSource>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_graph_targets() {
        let json = r#"{
            "first_index": 0,
            "last_index": 4,
            "children": [
                { "substring": "iPad", "target": { "profile": 12 } },
                { "substring": "iPod", "target": "no_match" },
                { "substring": "iPho", "target": { "node": { "first_index": 4, "last_index": 4 } } }
            ]
        }"#;
        let node: HashNodeSource = serde_json::from_str(json).unwrap();
        assert_eq!(node.children.len(), 3);
        assert!(matches!(node.children[0].target, GraphTarget::Profile(12)));
        assert!(matches!(node.children[1].target, GraphTarget::NoMatch));
        assert!(matches!(&node.children[2].target, GraphTarget::Node(inner) if inner.first_index == 4));
        assert!(matches!(node.unmatched, GraphTarget::NoMatch));
    }

    #[test]
    fn values_accept_one_or_many() {
        let profile: ProfileSource = serde_json::from_str(
            r#"{ "id": 3, "component": "Hardware", "values": { "IsMobile": "True", "Names": ["a", "b"] } }"#,
        )
        .unwrap();
        assert_eq!(profile.values["IsMobile"].as_slice(), ["True"]);
        assert_eq!(profile.values["Names"].as_slice(), ["a", "b"]);
    }
}
