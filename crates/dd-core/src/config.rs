//! Detection configuration.
//!
//! Every field has a default, so a JSON file only needs the settings it
//! changes:
//!
//! ```json
//! { "engine": "pattern", "properties": ["IsMobile"], "results": { "max_difference": 10 } }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors raised while reading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which matching engine processes evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Graph engine when the data set carries graphs, otherwise pattern.
    #[default]
    Auto,
    Pattern,
    Hash,
}

/// How the data set bytes are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// Whole file copied into memory.
    #[default]
    Memory,
    /// Whole file memory mapped.
    Mapped,
    /// Records read lazily through a file handle pool.
    File,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Signatures scored by the nearest and closest phases; 0 disables them.
    pub closest_signatures: usize,
    /// Record which target characters contributed to the match.
    pub update_matched_user_agent: bool,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            closest_signatures: 200,
            update_matched_user_agent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HashConfig {
    /// Hash value tolerance per node.
    pub difference: i32,
    /// Positional slack per node.
    pub drift: i32,
    pub use_performance_graph: bool,
    pub use_predictive_graph: bool,
    pub update_matched_user_agent: bool,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            difference: 0,
            drift: 0,
            use_performance_graph: true,
            use_predictive_graph: true,
            update_matched_user_agent: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Substitute default profiles for components that did not match.
    pub allow_unmatched: bool,
    /// Results with a larger difference have no values.
    pub max_difference: Option<i32>,
    /// Results with a larger drift have no values.
    pub max_drift: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub mode: LoadMode,
    /// Expected simultaneous readers; sizes the file handle pool.
    pub concurrency: usize,
    /// Decoded records cached per collection; 0 disables caching.
    pub cache_capacity: usize,
    pub verify_crc: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            mode: LoadMode::Memory,
            concurrency: 10,
            cache_capacity: 0,
            verify_crc: true,
        }
    }
}

/// Top-level detection configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub engine: EngineKind,
    /// Required property names; empty means every property.
    pub properties: Vec<String>,
    pub pattern: PatternConfig,
    pub hash: HashConfig,
    pub results: ResultsConfig,
    pub collection: CollectionConfig,
}

impl DetectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn with_engine(mut self, engine: EngineKind) -> Self {
        self.engine = engine;
        self
    }

    /// Parse a comma separated property list.
    pub fn with_properties(mut self, list: &str) -> Self {
        self.properties = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        self
    }

    pub fn with_mode(mut self, mode: LoadMode) -> Self {
        self.collection.mode = mode;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.collection.concurrency = concurrency;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.collection.cache_capacity = capacity;
        self
    }

    pub fn with_closest_signatures(mut self, count: usize) -> Self {
        self.pattern.closest_signatures = count;
        self
    }

    pub fn with_allow_unmatched(mut self, allow: bool) -> Self {
        self.results.allow_unmatched = allow;
        self
    }

    pub fn with_max_difference(mut self, max: i32) -> Self {
        self.results.max_difference = Some(max);
        self
    }

    pub fn with_max_drift(mut self, max: i32) -> Self {
        self.results.max_drift = Some(max);
        self
    }

    pub fn with_difference(mut self, difference: i32) -> Self {
        self.hash.difference = difference;
        self
    }

    pub fn with_drift(mut self, drift: i32) -> Self {
        self.hash.drift = drift;
        self
    }

    pub fn with_graphs(mut self, performance: bool, predictive: bool) -> Self {
        self.hash.use_performance_graph = performance;
        self.hash.use_predictive_graph = predictive;
        self
    }

    pub fn with_matched_user_agent(mut self, enabled: bool) -> Self {
        self.pattern.update_matched_user_agent = enabled;
        self.hash.update_matched_user_agent = enabled;
        self
    }
}
