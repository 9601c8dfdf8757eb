//! Internal/external classification of recipient addresses.
//!
//! An address is internal when, after trimming and lower-casing, it ends
//! with `@` followed by one of the configured domains. The comparison is a
//! suffix equality anchored at the `@`, so `user@bcc.no.attacker.com` and
//! `user@notbcc.no` are both external for an allow-list containing `bcc.no`.

use serde::{Deserialize, Serialize};

use crate::util::normalize_address;

/// Result of classifying one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Classification {
    Internal,
    External,
}

/// How an empty or missing address is classified.
///
/// Both behaviors have shipped: treating the unknown address as internal
/// never produces a spurious warning, treating it as external errs towards
/// warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnknownAddress {
    Internal,
    #[default]
    External,
}

impl UnknownAddress {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" | "safe" => Some(UnknownAddress::Internal),
            "external" | "unsafe" => Some(UnknownAddress::External),
            _ => None,
        }
    }

    fn classification(self) -> Classification {
        match self {
            UnknownAddress::Internal => Classification::Internal,
            UnknownAddress::External => Classification::External,
        }
    }
}

/// Organisation-owned domains, normalised once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainAllowList {
    /// Pre-built `@domain` suffixes, lower case, in configuration order.
    suffixes: Vec<String>,
}

impl DomainAllowList {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut suffixes: Vec<String> = Vec::new();
        for raw in domains {
            let domain = raw.as_ref().trim().trim_start_matches('@').to_lowercase();
            if domain.is_empty() {
                continue;
            }
            let suffix = format!("@{}", domain);
            if !suffixes.contains(&suffix) {
                suffixes.push(suffix);
            }
        }
        Self { suffixes }
    }

    /// Configured domains without the `@` prefix.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.suffixes.iter().map(|s| &s[1..])
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }

    /// `normalized` must already be trimmed and lower-cased.
    fn matches(&self, normalized: &str) -> bool {
        self.suffixes
            .iter()
            .any(|suffix| normalized.ends_with(suffix.as_str()))
    }
}

/// Pure classifier over an allow-list and an unknown-address default.
#[derive(Debug, Clone, Default)]
pub struct DomainClassifier {
    allow_list: DomainAllowList,
    unknown: UnknownAddress,
}

impl DomainClassifier {
    pub fn new(allow_list: DomainAllowList, unknown: UnknownAddress) -> Self {
        Self {
            allow_list,
            unknown,
        }
    }

    pub fn allow_list(&self) -> &DomainAllowList {
        &self.allow_list
    }

    pub fn unknown_address(&self) -> UnknownAddress {
        self.unknown
    }

    pub fn classify(&self, address: &str) -> Classification {
        let normalized = normalize_address(address);
        if normalized.is_empty() {
            return self.unknown.classification();
        }
        if self.allow_list.matches(&normalized) {
            Classification::Internal
        } else {
            Classification::External
        }
    }

    pub fn is_external(&self, address: &str) -> bool {
        self.classify(address) == Classification::External
    }
}
