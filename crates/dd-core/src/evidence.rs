//! Request evidence
//!
//! Evidence is an ordered list of `(prefix, key, value)` items collected
//! from a request. Prefixes and keys compare case-insensitively. When the
//! same key appears more than once under a prefix, the earliest item wins.

use bitflags::bitflags;

bitflags! {
    /// Where an evidence item came from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EvidencePrefix: u8 {
        /// HTTP request header
        const HEADER = 1 << 0;
        /// Query string parameter
        const QUERY = 1 << 1;
        /// Cookie
        const COOKIE = 1 << 2;
        /// Server variable; never used for matching
        const SERVER = 1 << 3;
    }
}

impl EvidencePrefix {
    /// Parse a prefix name such as `header` or `Query`.
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("header") {
            Some(Self::HEADER)
        } else if name.eq_ignore_ascii_case("query") {
            Some(Self::QUERY)
        } else if name.eq_ignore_ascii_case("cookie") {
            Some(Self::COOKIE)
        } else if name.eq_ignore_ascii_case("server") {
            Some(Self::SERVER)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        if *self == Self::HEADER {
            "header"
        } else if *self == Self::QUERY {
            "query"
        } else if *self == Self::COOKIE {
            "cookie"
        } else if *self == Self::SERVER {
            "server"
        } else {
            "mixed"
        }
    }
}

/// Prefix order used to find match targets: query values shadow headers.
pub const MATCH_PRECEDENCE: [EvidencePrefix; 2] = [EvidencePrefix::QUERY, EvidencePrefix::HEADER];

/// Prefix order used to find overrides.
pub const OVERRIDE_PRECEDENCE: [EvidencePrefix; 2] = [EvidencePrefix::QUERY, EvidencePrefix::COOKIE];

/// Key holding `-`, `|` or `,` separated profile ids.
pub const PROFILE_IDS_KEY: &str = "51D_ProfileIds";

/// Key holding a device id.
pub const DEVICE_ID_KEY: &str = "51D_deviceId";

/// Prefix of per-property override keys.
pub const PROPERTY_OVERRIDE_PREFIX: &str = "51D_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceItem {
    pub prefix: EvidencePrefix,
    pub key: String,
    pub value: String,
}

/// Ordered evidence for one request.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    items: Vec<EvidenceItem>,
}

impl Evidence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, prefix: EvidencePrefix, key: impl Into<String>, value: impl Into<String>) {
        self.items.push(EvidenceItem {
            prefix,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Add an item keyed as `prefix.key`, e.g. `header.User-Agent`.
    ///
    /// Returns false, adding nothing, when the prefix is missing or unknown.
    pub fn add_pair(&mut self, field: &str, value: impl Into<String>) -> bool {
        let Some((prefix, key)) = field.split_once('.') else {
            return false;
        };
        match EvidencePrefix::parse(prefix) {
            Some(prefix) if !key.is_empty() => {
                self.add(prefix, key, value);
                true
            }
            _ => false,
        }
    }

    /// Convenience for a single User-Agent header.
    pub fn from_user_agent(user_agent: &str) -> Self {
        let mut evidence = Self::new();
        evidence.add(EvidencePrefix::HEADER, "User-Agent", user_agent);
        evidence
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EvidenceItem> {
        self.items.iter()
    }

    /// Items whose prefix is in `mask`, in insertion order.
    pub fn iter_prefix(&self, mask: EvidencePrefix) -> impl Iterator<Item = &EvidenceItem> {
        self.items.iter().filter(move |item| mask.intersects(item.prefix))
    }

    /// First value for `key`, trying each prefix in turn.
    pub fn get(&self, prefixes: &[EvidencePrefix], key: &str) -> Option<&str> {
        prefixes.iter().find_map(|prefix| {
            self.items
                .iter()
                .find(|item| item.prefix == *prefix && item.key.eq_ignore_ascii_case(key))
                .map(|item| item.value.as_str())
        })
    }

    /// Every value for `key` in prefix order, earliest first within a prefix.
    pub fn get_all<'a>(&'a self, prefixes: &'a [EvidencePrefix], key: &'a str) -> impl Iterator<Item = &'a str> {
        prefixes.iter().flat_map(move |prefix| {
            self.items
                .iter()
                .filter(move |item| item.prefix == *prefix && item.key.eq_ignore_ascii_case(key))
                .map(|item| item.value.as_str())
        })
    }

    /// Value of an HTTP header, query parameters taking priority.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.get(&MATCH_PRECEDENCE, name)
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for Evidence {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut evidence = Self::new();
        for (field, value) in iter {
            if !evidence.add_pair(field.as_ref(), value) {
                log::debug!("ignoring evidence with unknown prefix: {}", field.as_ref());
            }
        }
        evidence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parsing_is_case_insensitive() {
        assert_eq!(EvidencePrefix::parse("HEADER"), Some(EvidencePrefix::HEADER));
        assert_eq!(EvidencePrefix::parse("Cookie"), Some(EvidencePrefix::COOKIE));
        assert_eq!(EvidencePrefix::parse("form"), None);
        assert_eq!(EvidencePrefix::QUERY.as_str(), "query");
    }

    #[test]
    fn add_pair_splits_prefix() {
        let mut evidence = Evidence::new();
        assert!(evidence.add_pair("header.User-Agent", "Mozilla/5.0"));
        assert!(evidence.add_pair("query.51D_ProfileIds", "12-34"));
        assert!(!evidence.add_pair("User-Agent", "x"));
        assert!(!evidence.add_pair("body.User-Agent", "x"));
        assert!(!evidence.add_pair("header.", "x"));
        assert_eq!(evidence.len(), 2);
    }

    #[test]
    fn query_shadows_header() {
        let evidence: Evidence = [
            ("header.user-agent", "from-header"),
            ("query.User-Agent", "from-query"),
        ]
        .into_iter()
        .collect();
        assert_eq!(evidence.header("USER-AGENT"), Some("from-query"));
        assert_eq!(evidence.get(&[EvidencePrefix::HEADER], "User-Agent"), Some("from-header"));
    }

    #[test]
    fn earliest_wins_within_prefix() {
        let evidence: Evidence = [
            ("cookie.51D_ProfileIds", "1"),
            ("query.51d_profileids", "2"),
            ("query.51D_ProfileIds", "3"),
        ]
        .into_iter()
        .collect();
        assert_eq!(evidence.get(&OVERRIDE_PRECEDENCE, PROFILE_IDS_KEY), Some("2"));
        let all: Vec<_> = evidence.get_all(&OVERRIDE_PRECEDENCE, PROFILE_IDS_KEY).collect();
        assert_eq!(all, vec!["2", "3", "1"]);
    }

    #[test]
    fn iter_prefix_filters() {
        let evidence: Evidence = [
            ("header.A", "1"),
            ("server.B", "2"),
            ("cookie.C", "3"),
        ]
        .into_iter()
        .collect();
        let keys: Vec<_> = evidence
            .iter_prefix(EvidencePrefix::HEADER | EvidencePrefix::COOKIE)
            .map(|i| i.key.as_str())
            .collect();
        assert_eq!(keys, vec!["A", "C"]);
    }
}
