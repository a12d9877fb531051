//! CLI entry point for the harvester tool.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::record::unix_now;
use harvester_core::{
    AdaptiveRateLimiter, CrawlStats, Database, DetailOrchestrator, EgressConfig, IdentityManager,
    JsonLdParser, ListConfig, ListEnumerator, OrchestratorConfig, ProxyConfig, RateLimitConfig,
    RecordSink, RunOutcome, RunSummary, SiteConfig, SqliteSink,
};
use tracing::{debug, info, warn};
use url::Url;

mod cli;

use cli::{Args, Mode};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("Harvester starting");

    Url::parse(&args.index_url).context("invalid --index-url")?;
    Url::parse(&args.detail_url).context("invalid --detail-url")?;

    let site = Arc::new(SiteConfig {
        index_url: args.index_url.clone(),
        page_param: args.page_param.clone(),
        index_params: Vec::new(),
        detail_url: args.detail_url.clone(),
        source: args.source.clone(),
    });

    let proxy = ProxyConfig::from_env();
    if (args.proxy || args.pooled) && proxy.is_none() {
        warn!("--proxy/--pooled requested but PROXY_* env vars are not set; running direct");
    }
    let egress = EgressConfig {
        proxy,
        start_with_proxy: args.proxy,
        start_pooled: args.pooled,
        ..EgressConfig::default()
    };

    let workers = usize::from(args.workers);
    let limiter = Arc::new(AdaptiveRateLimiter::new(RateLimitConfig::default()));
    let stats = Arc::new(CrawlStats::new());
    let parser = Arc::new(
        JsonLdParser::new(args.source.clone(), &args.id_pattern)
            .context("invalid --id-pattern")?,
    );
    let manager = Arc::new(IdentityManager::new(egress, site.clone()));

    let db = Database::new(Path::new(&args.db)).await?;
    let sink = Arc::new(SqliteSink::new(db.clone()));

    let started_at = unix_now();

    // No crawl can proceed without the baseline session; log the failed run
    // before bailing so the attempt still shows up in the run log.
    if let Err(e) = manager.initialize(workers).await {
        let summary = RunSummary::from_stats(&stats, started_at, unix_now(), RunOutcome::Failed);
        if let Err(log_err) = db.record_run(&summary).await {
            warn!(error = %log_err, "failed to record run");
        }
        db.close().await;
        return Err(e.into());
    }

    let enumerator = ListEnumerator::new(
        manager.clone(),
        limiter.clone(),
        parser.clone(),
        site.clone(),
        ListConfig {
            max_pages: args.max_pages,
            ..ListConfig::default()
        },
        stats.clone(),
    );
    let mut ids = enumerator.enumerate().await;

    if args.mode == Mode::ListOnly {
        let summary = RunSummary::from_stats(&stats, started_at, unix_now(), RunOutcome::Success);
        if let Err(e) = db.record_run(&summary).await {
            warn!(error = %e, "failed to record run");
        }
        println!("{}", serde_json::to_string_pretty(&summary)?);
        db.close().await;
        return Ok(ExitCode::SUCCESS);
    }

    if args.mode == Mode::Incremental {
        let known = sink.known_ids().await?;
        let before = ids.len();
        ids.retain(|id| !known.contains(id.as_str()));
        info!(
            known = known.len(),
            skipped = before - ids.len(),
            remaining = ids.len(),
            "incremental filter applied"
        );
    }

    let orchestrator = DetailOrchestrator::new(
        manager,
        limiter,
        parser,
        sink,
        site,
        OrchestratorConfig {
            workers,
            min_workers: workers.min(3),
            retry_limit: u32::from(args.retry_limit),
            batch_size: args.batch_size as usize,
            run_budget: args.budget_secs.map(Duration::from_secs),
            ..OrchestratorConfig::default()
        },
        stats.clone(),
    )?;

    match orchestrator.run(ids).await {
        Ok(report) => {
            let summary = RunSummary::from_stats(&stats, started_at, unix_now(), report.outcome);
            if let Err(e) = db.record_run(&summary).await {
                warn!(error = %e, "failed to record run");
            }
            info!(
                stored = report.sink.stored(),
                not_found = report.not_found,
                exhausted = report.exhausted.len(),
                rounds = report.rounds,
                outcome = report.outcome.as_str(),
                "Crawl complete"
            );
            println!("{}", serde_json::to_string_pretty(&summary)?);
            db.close().await;
            match report.outcome {
                RunOutcome::Success => Ok(ExitCode::SUCCESS),
                _ => Ok(ExitCode::from(2)),
            }
        }
        Err(e) => {
            let summary =
                RunSummary::from_stats(&stats, started_at, unix_now(), RunOutcome::Failed);
            if let Err(log_err) = db.record_run(&summary).await {
                warn!(error = %log_err, "failed to record run");
            }
            db.close().await;
            Err(e.into())
        }
    }
}
