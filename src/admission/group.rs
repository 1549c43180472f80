//! # Rate-Limit Groups and Endpoint Classification
//!
//! Exchanges publish their quotas per *family* of endpoints, not per URL.
//! Every outbound call is mapped onto one of a fixed set of groups, and all
//! pacing state is kept per group.
//!
//! ## Classification Order
//!
//! ```text
//!     (endpoint, method)
//!            │
//!            ▼
//!     ┌──────────────────┐  hit
//!     │ exact override   │──────► group   (e.g. POST /private/v1/order)
//!     └────────┬─────────┘
//!              │ miss
//!              ▼
//!     ┌──────────────────┐  hit
//!     │ longest prefix   │──────► group   (e.g. /private/…)
//!     └────────┬─────────┘
//!              │ miss
//!              ▼
//!        default group            (most conservative)
//! ```
//!
//! Classification is total: an unknown endpoint is never an error, it is
//! simply paced under the default group.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Closed set of rate-limit groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitGroup {
    /// Unauthenticated market data reads.
    PublicRead,
    /// Authenticated endpoints without a dedicated quota.
    PrivateDefault,
    /// Order placement, amendment and single cancels.
    PrivateOrder,
    /// Bulk cancel ("cancel all") endpoints.
    PrivateCancelAll,
    /// WebSocket connection/authentication handshakes.
    StreamConnect,
}

impl RateLimitGroup {
    /// Every group, in declaration order.
    pub const ALL: [RateLimitGroup; 5] = [
        Self::PublicRead,
        Self::PrivateDefault,
        Self::PrivateOrder,
        Self::PrivateCancelAll,
        Self::StreamConnect,
    ];

    /// Snake-case name used in configuration files and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PublicRead => "public_read",
            Self::PrivateDefault => "private_default",
            Self::PrivateOrder => "private_order",
            Self::PrivateCancelAll => "private_cancel_all",
            Self::StreamConnect => "stream_connect",
        }
    }
}

impl fmt::Display for RateLimitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown rate-limit group: {s}"))
    }
}

/// Exact `(endpoint, method)` mapping for endpoints whose quota depends on
/// the HTTP verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodOverride {
    /// Endpoint path, matched exactly (query string ignored).
    pub endpoint: String,
    /// HTTP method, matched case-insensitively.
    pub method: String,
    /// Group the pair belongs to.
    pub group: RateLimitGroup,
}

/// Endpoint prefix mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixRule {
    /// Path prefix; the longest matching prefix wins.
    pub prefix: String,
    /// Group for endpoints under this prefix.
    pub group: RateLimitGroup,
}

/// Static classification table, usually loaded with the rest of
/// [`LimiterConfig`](crate::LimiterConfig).
///
/// When the section is omitted from a configuration file the built-in table
/// ([`ClassifierConfig::default`]) applies; when it is present, only the
/// listed overrides and rules exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Group used when nothing else matches.
    pub default_group: RateLimitGroup,
    /// Verb-specific exact matches, consulted first.
    #[serde(default)]
    pub overrides: Vec<MethodOverride>,
    /// Prefix rules, consulted when no override matches.
    #[serde(default)]
    pub rules: Vec<PrefixRule>,
}

impl Default for ClassifierConfig {
    /// Built-in table for a typical public/private REST layout.
    fn default() -> Self {
        let exact = |endpoint: &str, method: &str, group| MethodOverride {
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            group,
        };
        let order = |method: &str| exact("/private/v1/order", method, RateLimitGroup::PrivateOrder);
        let rule = |prefix: &str, group| PrefixRule {
            prefix: prefix.to_string(),
            group,
        };

        Self {
            default_group: RateLimitGroup::PrivateCancelAll,
            overrides: vec![
                order("POST"),
                order("PUT"),
                order("DELETE"),
                exact("/ws", "GET", RateLimitGroup::StreamConnect),
            ],
            rules: vec![
                rule("/public/", RateLimitGroup::PublicRead),
                rule("/private/", RateLimitGroup::PrivateDefault),
                rule("/private/v1/cancelAll", RateLimitGroup::PrivateCancelAll),
                rule("/ws/", RateLimitGroup::StreamConnect),
            ],
        }
    }
}

impl ClassifierConfig {
    /// Every group the table can produce, including the default.
    pub fn referenced_groups(&self) -> impl Iterator<Item = RateLimitGroup> + '_ {
        std::iter::once(self.default_group)
            .chain(self.overrides.iter().map(|o| o.group))
            .chain(self.rules.iter().map(|r| r.group))
    }
}

/// Maps `(endpoint, method)` pairs to a [`RateLimitGroup`].
///
/// Pure and total; see the module docs for the lookup order.
///
/// # Example
///
/// ```rust
/// use zero429::{ClassifierConfig, GroupClassifier, RateLimitGroup};
///
/// let classifier = GroupClassifier::new(&ClassifierConfig::default());
///
/// assert_eq!(classifier.classify("/public/v1/ticker", "GET"), RateLimitGroup::PublicRead);
/// assert_eq!(classifier.classify("/private/v1/order", "post"), RateLimitGroup::PrivateOrder);
/// assert_eq!(classifier.classify("/private/v1/order", "GET"), RateLimitGroup::PrivateDefault);
/// assert_eq!(classifier.classify("/somewhere/else", "GET"), RateLimitGroup::PrivateCancelAll);
/// ```
#[derive(Debug, Clone)]
pub struct GroupClassifier {
    /// Keyed by (endpoint, UPPERCASE method)
    exact: HashMap<(String, String), RateLimitGroup, ahash::RandomState>,
    /// Sorted longest prefix first
    prefixes: Vec<PrefixRule>,
    default_group: RateLimitGroup,
}

impl GroupClassifier {
    /// Builds a classifier from its table.
    pub fn new(config: &ClassifierConfig) -> Self {
        let mut exact = HashMap::with_hasher(ahash::RandomState::new());
        for o in &config.overrides {
            exact.insert(
                (strip_query(&o.endpoint).to_string(), o.method.to_ascii_uppercase()),
                o.group,
            );
        }

        let mut prefixes = config.rules.clone();
        // Stable sort keeps declaration order among equal-length prefixes
        prefixes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self {
            exact,
            prefixes,
            default_group: config.default_group,
        }
    }

    /// Classifies a request. Never fails.
    pub fn classify(&self, endpoint: &str, method: &str) -> RateLimitGroup {
        let path = strip_query(endpoint);

        if !self.exact.is_empty() {
            let key = (path.to_string(), method.to_ascii_uppercase());
            if let Some(group) = self.exact.get(&key) {
                return *group;
            }
        }

        self.prefixes
            .iter()
            .find(|rule| path.starts_with(rule.prefix.as_str()))
            .map(|rule| rule.group)
            .unwrap_or(self.default_group)
    }

    /// Group used for unclassifiable endpoints.
    pub fn default_group(&self) -> RateLimitGroup {
        self.default_group
    }
}

#[inline]
fn strip_query(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}
