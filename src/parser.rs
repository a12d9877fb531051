//! Page parsing seam between the crawl engine and the crawled site.
//!
//! The engine only depends on the [`PageParser`] trait; [`JsonLdParser`] is
//! the bundled implementation for indexes that embed JSON-LD `JobPosting`
//! metadata in their detail pages, with meta-tag fallbacks for sparser pages.

use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

use crate::record::{ItemId, Record, unix_now};

/// Errors produced while parsing a detail page.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A required field was absent or empty. A record missing its required
    /// fields is never stored.
    #[error("missing required field `{field}`")]
    MissingField {
        /// Name of the missing field.
        field: &'static str,
    },
}

/// Extracts item ids from list pages and records from detail pages.
///
/// Implementations must be pure with respect to the engine: no network access,
/// no shared mutable state.
pub trait PageParser: Send + Sync {
    /// Extracts item ids from one list page body, in page order.
    fn parse_list_page(&self, body: &str) -> Vec<ItemId>;

    /// Parses one detail page body into a record.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the body does not yield a record with all
    /// required fields.
    fn parse_detail(&self, id: &ItemId, url: &str, body: &str) -> Result<Record, ParseError>;
}

/// Regex-driven parser for JSON-LD `JobPosting` detail pages.
#[derive(Debug)]
pub struct JsonLdParser {
    source: String,
    list_id: Regex,
    job_posting: Regex,
    json_title: Regex,
    og_title: Regex,
    html_title: Regex,
    company: Regex,
    locality: Regex,
    salary_name: Regex,
    employment: Regex,
}

impl JsonLdParser {
    /// Creates a parser.
    ///
    /// `list_id_pattern` is the regex applied to list pages; its first capture
    /// group is the item id (e.g. `detail/(\d+)` for path-embedded ids).
    ///
    /// # Errors
    ///
    /// Returns the regex compilation error when `list_id_pattern` is invalid.
    pub fn new(source: impl Into<String>, list_id_pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            source: source.into(),
            list_id: Regex::new(list_id_pattern)?,
            job_posting: Regex::new(r#""@type"\s*:\s*"JobPosting""#)?,
            json_title: Regex::new(r#""title"\s*:\s*"([^"]+)""#)?,
            og_title: Regex::new(
                r#"<meta[^>]*property="og:title"[^>]*content="([^"]*)""#,
            )?,
            html_title: Regex::new(r"<title>([^<]+)</title>")?,
            company: Regex::new(r#""hiringOrganization"\s*:\s*\{[^}]*"name"\s*:\s*"([^"]+)""#)?,
            locality: Regex::new(r#""addressLocality"\s*:\s*"([^"]+)""#)?,
            salary_name: Regex::new(r#""salaryName"\s*:\s*"([^"]+)""#)?,
            employment: Regex::new(r#""employmentType"\s*:\s*"([^"]+)""#)?,
        })
    }

    fn first_capture<'b>(&self, re: &Regex, body: &'b str) -> Option<&'b str> {
        re.captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim())
            .filter(|s| !s.is_empty())
    }

    fn extract_title(&self, body: &str) -> Option<String> {
        // JSON-LD title is the most reliable source, but only trust it on
        // pages that actually declare a JobPosting object.
        if self.job_posting.is_match(body)
            && let Some(title) = self.first_capture(&self.json_title, body)
        {
            return Some(title.to_string());
        }
        if let Some(title) = self.first_capture(&self.og_title, body) {
            return Some(title.to_string());
        }
        // <title> is the last resort; strip trailing site-name segments.
        self.first_capture(&self.html_title, body).map(|raw| {
            raw.split(" - ")
                .next()
                .unwrap_or(raw)
                .split(" | ")
                .next()
                .unwrap_or(raw)
                .trim()
                .to_string()
        })
    }
}

/// Maps JSON-LD employmentType codes to the labels stored on records.
fn normalize_employment(code: &str) -> String {
    match code.to_ascii_uppercase().as_str() {
        "FULL_TIME" | "PERMANENT" => "full-time".to_string(),
        "PART_TIME" | "PARTTIME" => "part-time".to_string(),
        "CONTRACTOR" | "CONTRACT" => "contract".to_string(),
        "TEMPORARY" | "DISPATCH" => "temporary".to_string(),
        "INTERN" | "INTERNSHIP" => "internship".to_string(),
        "FREELANCE" => "freelance".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

impl PageParser for JsonLdParser {
    fn parse_list_page(&self, body: &str) -> Vec<ItemId> {
        let mut seen = HashSet::new();
        self.list_id
            .captures_iter(body)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .filter(|id| seen.insert(id.to_string()))
            .map(ItemId::from)
            .collect()
    }

    fn parse_detail(&self, id: &ItemId, url: &str, body: &str) -> Result<Record, ParseError> {
        let title = self
            .extract_title(body)
            .ok_or(ParseError::MissingField { field: "title" })?;

        Ok(Record {
            id: id.clone(),
            source: self.source.clone(),
            url: url.to_string(),
            title,
            company: self
                .first_capture(&self.company, body)
                .unwrap_or_default()
                .to_string(),
            location: self
                .first_capture(&self.locality, body)
                .unwrap_or_default()
                .to_string(),
            salary_text: self
                .first_capture(&self.salary_name, body)
                .unwrap_or_default()
                .to_string(),
            employment_type: self
                .first_capture(&self.employment, body)
                .map(normalize_employment)
                .unwrap_or_default(),
            fetched_at: unix_now(),
        })
    }
}
