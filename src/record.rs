//! Typed record and identifier types shared across the crawl pipeline.
//!
//! [`ItemId`] is the opaque key extracted from list pages; [`Record`] is the
//! structured result of parsing one detail page. Both are produced by the
//! [`PageParser`](crate::parser::PageParser) seam and consumed read-only
//! downstream by the orchestrator and the sink.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque identifier for one crawlable unit.
///
/// Produced by the list enumerator, never mutated afterwards. Equality and
/// hashing follow the underlying string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One parsed detail page.
///
/// Field content comes solely from the parser; the orchestrator only inspects
/// `title` (required) and otherwise passes records through to the sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier of the source item.
    pub id: ItemId,
    /// Source tag identifying the crawled index (e.g. a site name).
    pub source: String,
    /// Canonical URL of the detail page.
    pub url: String,
    /// Posting title. Required: an empty title is a parse failure upstream.
    pub title: String,
    /// Organization name, empty when not present on the page.
    pub company: String,
    /// Free-form locality string, empty when not present.
    pub location: String,
    /// Raw salary text as it appeared on the page.
    pub salary_text: String,
    /// Employment type label (full-time, contract, ...), empty when unknown.
    pub employment_type: String,
    /// Unix timestamp of the fetch that produced this record.
    pub fetched_at: i64,
}

/// Current time as unix seconds.
///
/// Saturates to zero for clocks before the epoch rather than panicking.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_display_matches_input() {
        let id = ItemId::new("49812345");
        assert_eq!(id.to_string(), "49812345");
        assert_eq!(id.as_str(), "49812345");
    }

    #[test]
    fn test_item_id_equality_and_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ItemId::from("a"));
        set.insert(ItemId::from("a"));
        set.insert(ItemId::from("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_item_id_serde_transparent() {
        let id = ItemId::new("123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"123\"");
    }

    #[test]
    fn test_unix_now_is_positive() {
        assert!(unix_now() > 0);
    }
}
