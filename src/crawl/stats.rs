//! Run-wide counters and the end-of-run summary.
//!
//! [`CrawlStats`] uses atomic counters so workers and the collector can update
//! it without locking; its lifecycle is bound to one crawl run and it is reset
//! only by creating a new run.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use serde::Serialize;

/// Final disposition of one crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every enumerated id reached a terminal success or not-found outcome.
    Success,
    /// The run completed but some ids exhausted their retry budget.
    Partial,
    /// A fatal condition prevented the run from making progress.
    Failed,
}

impl RunOutcome {
    /// Stable label persisted in the run log.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// Process-wide counters for one crawl run.
#[derive(Debug, Default)]
pub struct CrawlStats {
    pages_enumerated: AtomicUsize,
    ids_enumerated: AtomicUsize,
    details_succeeded: AtomicUsize,
    details_failed: AtomicUsize,
    details_not_found: AtomicUsize,
    block_events: AtomicUsize,
    rate_limit_events: AtomicUsize,
    escalated: AtomicBool,
}

impl CrawlStats {
    /// Creates a zeroed stats tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one enumerated list page and the ids it yielded.
    pub fn record_page(&self, ids: usize) {
        self.pages_enumerated.fetch_add(1, Ordering::SeqCst);
        self.ids_enumerated.fetch_add(ids, Ordering::SeqCst);
    }

    /// Records one successfully parsed detail page.
    pub fn record_success(&self) {
        self.details_succeeded.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one id that exhausted its retry budget.
    pub fn record_failure(&self) {
        self.details_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one definitive not-found outcome.
    pub fn record_not_found(&self) {
        self.details_not_found.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one blocked/CAPTCHA response.
    pub fn record_block(&self) {
        self.block_events.fetch_add(1, Ordering::SeqCst);
    }

    /// Records one hostile-throttling signal fed to the rate limiter.
    pub fn record_rate_limit(&self) {
        self.rate_limit_events.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks that the run escalated to pooled egress. One-way.
    pub fn mark_escalated(&self) {
        self.escalated.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn pages_enumerated(&self) -> usize {
        self.pages_enumerated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn ids_enumerated(&self) -> usize {
        self.ids_enumerated.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn details_succeeded(&self) -> usize {
        self.details_succeeded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn details_failed(&self) -> usize {
        self.details_failed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn details_not_found(&self) -> usize {
        self.details_not_found.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn block_events(&self) -> usize {
        self.block_events.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rate_limit_events(&self) -> usize {
        self.rate_limit_events.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn escalated(&self) -> bool {
        self.escalated.load(Ordering::SeqCst)
    }
}

/// Snapshot of one finished run, persisted to the run log.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: i64,
    pub finished_at: i64,
    pub pages_enumerated: usize,
    pub ids_enumerated: usize,
    pub details_succeeded: usize,
    pub details_failed: usize,
    pub details_not_found: usize,
    pub block_events: usize,
    pub rate_limit_events: usize,
    pub escalated: bool,
    pub outcome: RunOutcome,
}

impl RunSummary {
    /// Builds a summary from the live counters.
    #[must_use]
    pub fn from_stats(
        stats: &CrawlStats,
        started_at: i64,
        finished_at: i64,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            started_at,
            finished_at,
            pages_enumerated: stats.pages_enumerated(),
            ids_enumerated: stats.ids_enumerated(),
            details_succeeded: stats.details_succeeded(),
            details_failed: stats.details_failed(),
            details_not_found: stats.details_not_found(),
            block_events: stats.block_events(),
            rate_limit_events: stats.rate_limit_events(),
            escalated: stats.escalated(),
            outcome,
        }
    }
}
