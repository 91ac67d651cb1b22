//! Core type definitions for DeviceDetect
//!
//! These types map directly to fields of the DDS data set format and are
//! used throughout the matching engines.

use serde::Serialize;

// =============================================================================
// Match Methods
// =============================================================================

/// How a result was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MatchMethod {
    /// Nothing matched
    #[default]
    None = 0,
    /// Signature equal to the extracted node list
    Exact = 1,
    /// Signature reached by accepting nearby numeric substrings
    Numeric = 2,
    /// Signature whose substrings were all found elsewhere in the target
    Nearest = 3,
    /// Signature with the smallest character difference
    Closest = 4,
    /// Graph engine, performance graph
    Performance = 5,
    /// Graph engine, predictive graph
    Predictive = 6,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Exact => "exact",
            Self::Numeric => "numeric",
            Self::Nearest => "nearest",
            Self::Closest => "closest",
            Self::Performance => "performance",
            Self::Predictive => "predictive",
        }
    }

    /// True for every method except `None`.
    pub fn is_match(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl std::fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Property Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags for property behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PropertyFlags: u8 {
        /// Value may be replaced with `51D_<Name>` evidence
        const OVERRIDABLE = 1 << 0;
        /// Value is a JavaScript snippet
        const JAVASCRIPT = 1 << 1;
        /// Property can hold several values per profile
        const LIST = 1 << 2;
    }
}

// =============================================================================
// Signature Flags
// =============================================================================

bitflags::bitflags! {
    /// Flags stored with each pattern signature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignatureFlags: u16 {
        /// Several training strings produced this signature with different profiles
        const CONFLICTED = 1 << 0;
        /// At least one node of the signature has numeric children
        const HAS_NUMERIC = 1 << 1;
    }
}

// =============================================================================
// Graph Kinds
// =============================================================================

/// The two traversal graphs of the hash engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphKind {
    /// Tuned for strings seen during training
    Performance,
    /// Tuned for strings never seen before
    Predictive,
}

impl GraphKind {
    pub fn method(&self) -> MatchMethod {
        match self {
            Self::Performance => MatchMethod::Performance,
            Self::Predictive => MatchMethod::Predictive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names() {
        assert_eq!(MatchMethod::default(), MatchMethod::None);
        assert_eq!(MatchMethod::Closest.to_string(), "closest");
        assert!(!MatchMethod::None.is_match());
        assert!(MatchMethod::Predictive.is_match());
        assert_eq!(GraphKind::Predictive.method(), MatchMethod::Predictive);
    }

    #[test]
    fn method_serializes_lowercase() {
        let json = serde_json::to_string(&MatchMethod::Nearest).unwrap();
        assert_eq!(json, "\"nearest\"");
    }
}
