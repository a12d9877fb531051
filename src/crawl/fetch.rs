//! Single detail-page fetch and outcome classification.
//!
//! Every attempt collapses into a [`FetchOutcome`]; transport errors, hostile
//! statuses, soft block pages, and parse failures are all data to the
//! orchestrator's retry machinery, never `Err` values.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

use super::error::FailureKind;
use super::identity::Identity;
use crate::config::SiteConfig;
use crate::parser::PageParser;
use crate::record::{ItemId, Record};

/// Substrings that mark an HTTP 200 body as a disguised block page. Matched
/// case-insensitively against the start of the body.
const BLOCK_MARKERS: [&str; 4] = ["captcha", "access denied", "unusual traffic", "blocked"];

/// How far into the body block markers are searched. Block interstitials are
/// small; real detail pages bury these words deep in unrelated content.
const BLOCK_SCAN_BYTES: usize = 4096;

/// Terminal result of one detail fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The page yielded a complete record.
    Success(Record),
    /// The server definitively reported the item gone (404/410). Terminal;
    /// never retried.
    NotFound,
    /// The attempt failed; the kind drives retry and escalation bookkeeping.
    Failure(FailureKind),
}

fn looks_blocked(body: &str) -> bool {
    let mut end = body.len().min(BLOCK_SCAN_BYTES);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_lowercase();
    BLOCK_MARKERS.iter().any(|marker| head.contains(marker))
}

/// Fetches and parses one detail page through the given identity.
pub async fn fetch_detail(
    identity: &Identity,
    parser: &dyn PageParser,
    site: &Arc<SiteConfig>,
    id: &ItemId,
    timeout: Duration,
) -> FetchOutcome {
    let url = site.detail_url_for(id);
    trace!(%id, %url, "fetching detail page");

    let response = match identity.client().get(&url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            debug!(%id, error = %e, "detail request failed");
            return FetchOutcome::Failure(FailureKind::Transport);
        }
    };

    let status = response.status();
    match status.as_u16() {
        404 | 410 => return FetchOutcome::NotFound,
        403 | 429 => {
            debug!(%id, %status, "hostile status on detail page");
            return FetchOutcome::Failure(FailureKind::Blocked);
        }
        _ if !status.is_success() => {
            debug!(%id, %status, "unexpected status on detail page");
            return FetchOutcome::Failure(FailureKind::Transport);
        }
        _ => {}
    }

    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            debug!(%id, error = %e, "failed to read detail body");
            return FetchOutcome::Failure(FailureKind::Transport);
        }
    };

    if looks_blocked(&body) {
        debug!(%id, "block page served with 200 status");
        return FetchOutcome::Failure(FailureKind::Blocked);
    }

    match parser.parse_detail(id, &url, &body) {
        Ok(record) if !record.title.trim().is_empty() => FetchOutcome::Success(record),
        Ok(_) => {
            debug!(%id, "parsed record has an empty title");
            FetchOutcome::Failure(FailureKind::Parse)
        }
        Err(e) => {
            debug!(%id, error = %e, "detail page did not parse");
            FetchOutcome::Failure(FailureKind::Parse)
        }
    }
}
