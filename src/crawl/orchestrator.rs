//! Concurrent detail-page crawling with retry rounds.
//!
//! The orchestrator runs N workers fanning their outcomes into one collector
//! over an mpsc channel. The collector is the sole owner of attempt counts,
//! the record buffer, and the retry set, so no per-item state needs a lock.
//! Failed ids accumulate into the next round, which runs with one fewer
//! worker and a raised rate-limiter floor; a definitive not-found is terminal
//! and never re-enters the retry set.
//!
//! The collector also hosts the escalation checkpoint: every `progress_every`
//! processed attempts it measures trailing throughput and decides whether the
//! egress strategy has to change, and whether the run is beyond saving.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::error::{CrawlError, FailureKind};
use super::fetch::{FetchOutcome, fetch_detail};
use super::identity::{EgressMode, IdentityManager};
use super::rate_limiter::{AdaptiveRateLimiter, ErrorSignal};
use super::stats::{CrawlStats, RunOutcome};
use crate::config::{OrchestratorConfig, SiteConfig};
use crate::parser::PageParser;
use crate::record::{ItemId, Record};
use crate::sink::{RecordSink, SinkReport};

/// Upper bound on configured concurrency.
const MAX_WORKERS: usize = 100;

/// Outcome of one detail crawl over a set of ids.
#[derive(Debug)]
pub struct RunReport {
    /// Ids that yielded a stored record.
    pub succeeded: usize,
    /// Ids the server definitively reported gone.
    pub not_found: usize,
    /// Ids that exhausted their retry budget, with their last failure kind.
    pub exhausted: Vec<(ItemId, FailureKind)>,
    /// Aggregate sink tally across all flushes.
    pub sink: SinkReport,
    /// Number of rounds the crawl took.
    pub rounds: u32,
    /// Overall disposition.
    pub outcome: RunOutcome,
}

struct WorkerMessage {
    worker_idx: usize,
    id: ItemId,
    outcome: FetchOutcome,
}

/// Trailing measurement window for the escalation checkpoint.
struct Window {
    started: Instant,
    processed: usize,
    completed: usize,
    blocks: usize,
    slow_streak: u32,
    blocked_zero_streak: u32,
    escalation_refused: bool,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            processed: 0,
            completed: 0,
            blocks: 0,
            slow_streak: 0,
            blocked_zero_streak: 0,
            escalation_refused: false,
        }
    }

    fn roll(&mut self) {
        self.started = Instant::now();
        self.processed = 0;
        self.completed = 0;
        self.blocks = 0;
    }
}

fn shrink_workers(workers: usize, min_workers: usize) -> usize {
    workers.saturating_sub(1).max(min_workers)
}

/// Drives the detail phase of one crawl run.
pub struct DetailOrchestrator {
    manager: Arc<IdentityManager>,
    limiter: Arc<AdaptiveRateLimiter>,
    parser: Arc<dyn PageParser>,
    sink: Arc<dyn RecordSink>,
    site: Arc<SiteConfig>,
    cfg: OrchestratorConfig,
    stats: Arc<CrawlStats>,
}

impl DetailOrchestrator {
    /// Creates an orchestrator after validating the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] for out-of-range concurrency or batch
    /// settings.
    pub fn new(
        manager: Arc<IdentityManager>,
        limiter: Arc<AdaptiveRateLimiter>,
        parser: Arc<dyn PageParser>,
        sink: Arc<dyn RecordSink>,
        site: Arc<SiteConfig>,
        cfg: OrchestratorConfig,
        stats: Arc<CrawlStats>,
    ) -> Result<Self, CrawlError> {
        if cfg.workers == 0 || cfg.workers > MAX_WORKERS {
            return Err(CrawlError::Config(format!(
                "workers must be between 1 and {MAX_WORKERS}, got {}",
                cfg.workers
            )));
        }
        if cfg.min_workers == 0 || cfg.min_workers > cfg.workers {
            return Err(CrawlError::Config(format!(
                "min_workers must be between 1 and workers ({}), got {}",
                cfg.workers, cfg.min_workers
            )));
        }
        if cfg.batch_size == 0 {
            return Err(CrawlError::Config("batch_size must be at least 1".to_string()));
        }
        if cfg.progress_every == 0 {
            return Err(CrawlError::Config(
                "progress_every must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            manager,
            limiter,
            parser,
            sink,
            site,
            cfg,
            stats,
        })
    }

    /// Crawls every id to a terminal outcome or an exhausted retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::HardBlocked`] when throughput stays at zero while
    /// blocked even after escalation; buffered records are flushed first.
    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    pub async fn run(&self, ids: Vec<ItemId>) -> Result<RunReport, CrawlError> {
        let deadline = self.cfg.run_budget.map(|budget| Instant::now() + budget);
        let mut pending = ids;
        let mut workers = self.cfg.workers;
        let mut rounds: u32 = 0;
        let mut attempts: HashMap<ItemId, u32> = HashMap::new();
        let mut buffer: Vec<Record> = Vec::new();
        let mut sink_report = SinkReport::default();
        let mut exhausted: Vec<(ItemId, FailureKind)> = Vec::new();
        let mut succeeded = 0usize;
        let mut not_found = 0usize;
        let mut total_processed = 0usize;
        let mut window = Window::new();

        while !pending.is_empty() {
            rounds += 1;
            info!(round = rounds, ids = pending.len(), workers, "detail round started");

            let (tx, mut rx) = mpsc::channel::<WorkerMessage>(workers * 2);
            let handles = self.spawn_workers(pending.split_off(0), workers, deadline, &tx);
            drop(tx);

            let mut retry: Vec<ItemId> = Vec::new();
            while let Some(msg) = rx.recv().await {
                total_processed += 1;
                window.processed += 1;

                match msg.outcome {
                    FetchOutcome::Success(record) => {
                        self.limiter.on_success();
                        self.manager.record_success(msg.worker_idx).await;
                        self.stats.record_success();
                        succeeded += 1;
                        window.completed += 1;
                        buffer.push(record);
                        if buffer.len() >= self.cfg.batch_size {
                            self.flush(&mut buffer, &mut sink_report).await;
                        }
                    }
                    FetchOutcome::NotFound => {
                        // The server answered normally; only the item is gone.
                        self.limiter.on_success();
                        self.manager.record_success(msg.worker_idx).await;
                        self.stats.record_not_found();
                        not_found += 1;
                        window.completed += 1;
                        debug!(id = %msg.id, "item no longer exists");
                    }
                    FetchOutcome::Failure(kind) => {
                        match kind {
                            FailureKind::Blocked => {
                                self.limiter.on_error(ErrorSignal::Hostile);
                                self.stats.record_block();
                                self.stats.record_rate_limit();
                                window.blocks += 1;
                                self.manager
                                    .record_block(msg.worker_idx, "blocked response")
                                    .await;
                            }
                            FailureKind::Transport | FailureKind::Parse => {
                                self.limiter.on_error(ErrorSignal::Benign);
                            }
                        }

                        let attempt = attempts.entry(msg.id.clone()).or_insert(0);
                        *attempt += 1;
                        if *attempt <= self.cfg.retry_limit {
                            retry.push(msg.id);
                        } else {
                            warn!(id = %msg.id, kind = %kind, "retry budget exhausted");
                            self.stats.record_failure();
                            exhausted.push((msg.id, kind));
                        }
                    }
                }

                if window.processed >= self.cfg.progress_every {
                    // Escalation failures abort the run the same way a hard
                    // block does: parsed records outlive the abort.
                    let fatal = match self
                        .checkpoint(&mut window, total_processed, succeeded + not_found)
                        .await
                    {
                        Ok(verdict) => verdict,
                        Err(e) => Some(e),
                    };
                    if let Some(fatal) = fatal {
                        self.flush(&mut buffer, &mut sink_report).await;
                        for handle in &handles {
                            handle.abort();
                        }
                        return Err(fatal);
                    }
                    window.roll();
                }
            }

            for handle in handles {
                if handle.await.is_err() {
                    warn!("detail worker panicked");
                }
            }
            self.flush(&mut buffer, &mut sink_report).await;

            if !retry.is_empty() {
                workers = shrink_workers(workers, self.cfg.min_workers);
                let raised = self.limiter.raise_floor(self.cfg.retry_backoff);
                info!(
                    retrying = retry.len(),
                    workers,
                    delay_ms = raised.as_millis(),
                    "next round with reduced concurrency"
                );
            }
            pending = retry;
        }

        let outcome = if exhausted.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::Partial
        };
        info!(
            succeeded,
            not_found,
            exhausted = exhausted.len(),
            rounds,
            outcome = outcome.as_str(),
            "detail crawl finished"
        );
        Ok(RunReport {
            succeeded,
            not_found,
            exhausted,
            sink: sink_report,
            rounds,
            outcome,
        })
    }

    /// Round-robin partitions `ids` over `workers` tasks.
    ///
    /// Each worker re-reads the limiter delay before every request, so a
    /// slow-down triggered by any worker's failure applies immediately to all
    /// of them.
    fn spawn_workers(
        &self,
        ids: Vec<ItemId>,
        workers: usize,
        deadline: Option<Instant>,
        tx: &mpsc::Sender<WorkerMessage>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut chunks: Vec<Vec<ItemId>> = vec![Vec::new(); workers];
        for (i, id) in ids.into_iter().enumerate() {
            chunks[i % workers].push(id);
        }

        let mut handles = Vec::with_capacity(workers);
        for (worker_idx, chunk) in chunks.into_iter().enumerate() {
            if chunk.is_empty() {
                continue;
            }
            let tx = tx.clone();
            let manager = self.manager.clone();
            let limiter = self.limiter.clone();
            let parser = self.parser.clone();
            let site = self.site.clone();
            let timeout = self.cfg.detail_timeout;

            handles.push(tokio::spawn(async move {
                for id in chunk {
                    let past_deadline =
                        deadline.is_some_and(|deadline| Instant::now() >= deadline);
                    let outcome = if past_deadline {
                        // Out of budget: report the id unfetched so the
                        // retry accounting still reaches a terminal state.
                        FetchOutcome::Failure(FailureKind::Transport)
                    } else if let Some(identity) = manager.identity_for(worker_idx).await {
                        sleep(limiter.current_delay()).await;
                        fetch_detail(&identity, parser.as_ref(), &site, &id, timeout).await
                    } else {
                        FetchOutcome::Failure(FailureKind::Transport)
                    };

                    if tx
                        .send(WorkerMessage {
                            worker_idx,
                            id,
                            outcome,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }));
        }
        handles
    }

    /// Escalation and abort decision for one trailing window.
    ///
    /// Returns the fatal error to abort with, if any. Measured over processed
    /// attempts rather than completions, so a streak of pure failures still
    /// produces checkpoints instead of silently stalling the policy.
    async fn checkpoint(
        &self,
        window: &mut Window,
        total_processed: usize,
        total_completed: usize,
    ) -> Result<Option<CrawlError>, CrawlError> {
        let esc = &self.cfg.escalation;
        let elapsed = window.started.elapsed().as_secs_f64().max(1e-6);
        let speed = window.completed as f64 / elapsed;
        let delay = self.limiter.current_delay();
        let pooled = self.manager.mode().await == EgressMode::ProxyPool;

        info!(
            completed = total_completed,
            speed = format!("{speed:.2}"),
            delay_ms = delay.as_millis(),
            blocks = window.blocks,
            "progress checkpoint"
        );

        if !pooled && total_processed >= esc.warmup_items {
            let throttled =
                delay >= esc.delay_threshold || self.limiter.is_blocked() || window.blocks > 0;
            if speed < esc.throughput_floor && throttled {
                window.slow_streak += 1;
            } else {
                window.slow_streak = 0;
            }

            if window.slow_streak >= esc.consecutive_windows {
                window.slow_streak = 0;
                if self
                    .manager
                    .escalate("sustained low throughput while throttled")
                    .await?
                {
                    self.stats.mark_escalated();
                    self.limiter.reset();
                    window.blocked_zero_streak = 0;
                    return Ok(None);
                }
                window.escalation_refused = true;
            }
        }

        // Past the point where escalation can help, a blocked window with
        // zero completions means the crawl is making no progress at all.
        if window.completed == 0
            && self.limiter.is_blocked()
            && (pooled || window.escalation_refused)
        {
            window.blocked_zero_streak += 1;
            if window.blocked_zero_streak >= esc.fatal_blocked_windows {
                return Ok(Some(CrawlError::HardBlocked {
                    windows: window.blocked_zero_streak,
                }));
            }
        } else if window.completed > 0 {
            window.blocked_zero_streak = 0;
        }
        Ok(None)
    }

    async fn flush(&self, buffer: &mut Vec<Record>, report: &mut SinkReport) {
        if buffer.is_empty() {
            return;
        }
        match self.sink.upsert_batch(buffer).await {
            Ok(batch) => {
                debug!(new = batch.new, updated = batch.updated, "batch flushed");
                report.merge(batch);
            }
            Err(e) => {
                warn!(error = %e, dropped = buffer.len(), "sink flush failed, batch dropped");
                report.failed += buffer.len();
            }
        }
        buffer.clear();
    }
}
