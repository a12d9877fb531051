//! Sequential enumeration of the paginated index.
//!
//! Pagination is walked one page at a time through the rate limiter; the
//! interesting part is termination. Hostile indexes do not 404 past the last
//! page, they keep serving content, so the enumerator stops on the first of:
//! the caller's page cap, a hard ceiling, consecutive pages with an identical
//! id set (the index clamping to its last page), or consecutive pages that
//! yield nothing new (ordering churn near the tail).

use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::identity::{Identity, IdentityManager};
use super::rate_limiter::{AdaptiveRateLimiter, ErrorSignal};
use super::stats::CrawlStats;
use crate::config::{ListConfig, SiteConfig};
use crate::parser::PageParser;
use crate::record::ItemId;

/// Walks list pages and collects the ids to crawl, in first-seen order.
pub struct ListEnumerator {
    manager: Arc<IdentityManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    parser: Arc<dyn PageParser>,
    site: Arc<SiteConfig>,
    cfg: ListConfig,
    stats: Arc<CrawlStats>,
}

impl ListEnumerator {
    #[must_use]
    pub fn new(
        manager: Arc<IdentityManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        parser: Arc<dyn PageParser>,
        site: Arc<SiteConfig>,
        cfg: ListConfig,
        stats: Arc<CrawlStats>,
    ) -> Self {
        Self {
            manager,
            limiter,
            parser,
            site,
            cfg,
            stats,
        }
    }

    fn last_page(&self) -> usize {
        self.cfg
            .max_pages
            .map_or(self.cfg.page_ceiling, |m| m.min(self.cfg.page_ceiling))
            .max(1)
    }

    /// Enumerates the index until a termination condition fires.
    ///
    /// Enumeration is best-effort by design: a page that fails twice is
    /// skipped, not fatal, because the detail phase works off whatever ids
    /// were collected.
    #[instrument(skip(self))]
    pub async fn enumerate(&self) -> Vec<ItemId> {
        let last_page = self.last_page();
        let mut collected: Vec<ItemId> = Vec::new();
        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut prev_page: Option<HashSet<ItemId>> = None;
        let mut repeat_streak: u32 = 0;
        let mut stale_streak: u32 = 0;

        for page in 1..=last_page {
            let Some(identity) = self.manager.identity_for(page).await else {
                warn!("enumeration requested before identities were provisioned");
                break;
            };

            let Some(ids) = self.fetch_page_with_retry(&identity, page).await else {
                debug!(page, "page skipped after retry");
                sleep(self.limiter.current_delay()).await;
                continue;
            };
            self.limiter.on_success();
            self.stats.record_page(ids.len());

            let page_set: HashSet<ItemId> = ids.iter().cloned().collect();
            if prev_page.as_ref() == Some(&page_set) {
                repeat_streak += 1;
            } else {
                repeat_streak = 0;
            }

            let mut new_on_page = 0usize;
            for id in ids {
                if seen.insert(id.clone()) {
                    collected.push(id);
                    new_on_page += 1;
                }
            }
            if new_on_page == 0 {
                stale_streak += 1;
            } else {
                stale_streak = 0;
            }
            debug!(page, new_on_page, total = collected.len(), "page enumerated");

            if repeat_streak >= self.cfg.repeat_page_limit {
                info!(page, "index is repeating its last page; enumeration done");
                break;
            }
            if stale_streak >= self.cfg.stale_page_limit {
                info!(page, "no new ids for {} pages; enumeration done", stale_streak);
                break;
            }

            prev_page = Some(page_set);
            sleep(self.limiter.current_delay()).await;
        }

        info!(ids = collected.len(), "enumeration finished");
        collected
    }

    /// Fetches one page, retrying once after feeding the failure to the
    /// limiter. Returns `None` when both attempts fail.
    async fn fetch_page_with_retry(&self, identity: &Identity, page: usize) -> Option<Vec<ItemId>> {
        for attempt in 0..2 {
            if attempt > 0 {
                sleep(self.limiter.current_delay()).await;
            }
            match self.fetch_page(identity, page).await {
                Ok(ids) => return Some(ids),
                Err(signal) => {
                    self.limiter.on_error(signal);
                    if signal == ErrorSignal::Hostile {
                        self.stats.record_rate_limit();
                    }
                    warn!(page, attempt, "list page fetch failed");
                }
            }
        }
        None
    }

    async fn fetch_page(&self, identity: &Identity, page: usize) -> Result<Vec<ItemId>, ErrorSignal> {
        let response = identity
            .client()
            .get(&self.site.index_url)
            .query(&self.site.index_params)
            .query(&[(self.site.page_param.as_str(), page.to_string())])
            .timeout(self.cfg.timeout)
            .send()
            .await
            .map_err(|e| {
                debug!(page, error = %e, "list request failed");
                ErrorSignal::Benign
            })?;

        let status = response.status();
        if matches!(status.as_u16(), 403 | 429) {
            debug!(page, %status, "hostile status on list page");
            return Err(ErrorSignal::Hostile);
        }
        if !status.is_success() {
            debug!(page, %status, "unexpected status on list page");
            return Err(ErrorSignal::Benign);
        }

        let body = response.text().await.map_err(|e| {
            debug!(page, error = %e, "failed to read list body");
            ErrorSignal::Benign
        })?;
        Ok(self.parser.parse_list_page(&body))
    }
}
