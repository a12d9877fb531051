//! Integration tests for egress escalation and the hard-block abort.
//!
//! These drive the orchestrator against a mock index that turns hostile,
//! with the escalation policy tightened so the behavior is observable in a
//! handful of requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use harvester_core::record::ItemId;
use harvester_core::{
    AdaptiveRateLimiter, CrawlError, CrawlStats, DetailOrchestrator, EgressConfig, EgressMode,
    EscalationConfig, IdentityManager, OrchestratorConfig, ProxyConfig, RecordSink,
};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

mod support;

use support::{detail_body, fast_rate, parser, site_for, sink};

/// Escalation policy that fires after two ten-item windows.
fn tight_escalation() -> EscalationConfig {
    EscalationConfig {
        // Any window counts as slow; the trigger is purely the streak.
        throughput_floor: f64::MAX,
        delay_threshold: Duration::ZERO,
        consecutive_windows: 2,
        warmup_items: 20,
        fatal_blocked_windows: 2,
    }
}

/// Proxy credentials pointing back at the mock server, so escalated traffic
/// has somewhere to connect.
fn loopback_proxy(server_uri: &str) -> ProxyConfig {
    let addr = server_uri.trim_start_matches("http://");
    let (host, port) = addr.split_once(':').expect("host:port");
    ProxyConfig {
        host: host.to_string(),
        port: port.to_string(),
        username: "user".to_string(),
        password: "pass".to_string(),
    }
}

/// Detail responder that changes disposition after `flip_after` requests:
/// hostile-then-healthy models a block that escalation gets around,
/// healthy-then-hostile models an index that turns on the crawl mid-run.
struct StagedDetail {
    flip_after: usize,
    hostile_first: bool,
    seen: AtomicUsize,
}

impl StagedDetail {
    fn hostile_then_healthy(flip_after: usize) -> Self {
        Self {
            flip_after,
            hostile_first: true,
            seen: AtomicUsize::new(0),
        }
    }

    fn healthy_then_hostile(flip_after: usize) -> Self {
        Self {
            flip_after,
            hostile_first: false,
            seen: AtomicUsize::new(0),
        }
    }
}

impl Respond for StagedDetail {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.seen.fetch_add(1, Ordering::SeqCst);
        let before_flip = n < self.flip_after;
        if before_flip == self.hostile_first {
            ResponseTemplate::new(403)
        } else {
            ResponseTemplate::new(200).set_body_string(detail_body("Recovered Role"))
        }
    }
}

async fn mount_list(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/list"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(server)
        .await;
}

async fn mount_details(server: &MockServer, responder: StagedDetail) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/detail/\d+$"))
        .respond_with(responder)
        .mount(server)
        .await;
}

fn ids(n: u64) -> Vec<ItemId> {
    (1..=n).map(|i| ItemId::from(i.to_string())).collect()
}

#[tokio::test]
async fn test_sustained_blocking_escalates_and_resets_the_limiter() {
    let server = MockServer::start().await;
    mount_list(&server).await;
    // The first 30 requests are denied, which carries the run through the
    // warm-up threshold and two slow windows; everything after the flip is
    // healthy so the reset limiter stays clear.
    mount_details(&server, StagedDetail::hostile_then_healthy(30)).await;

    let site = site_for(&server.uri());
    let egress = EgressConfig {
        proxy: Some(loopback_proxy(&server.uri())),
        // Provisioning must stay offline-fast; the identities themselves are
        // enough to observe the mode change.
        warm_pool: false,
        pool_size: 4,
        ..EgressConfig::default()
    };
    let manager = Arc::new(IdentityManager::new(egress, site.clone()));
    manager.initialize(4).await.expect("initialize");
    assert_eq!(manager.mode().await, EgressMode::Direct);

    let limiter = Arc::new(AdaptiveRateLimiter::new(fast_rate()));
    let stats = Arc::new(CrawlStats::new());
    let orchestrator = DetailOrchestrator::new(
        manager.clone(),
        limiter.clone(),
        parser(),
        sink().await,
        site,
        OrchestratorConfig {
            workers: 4,
            min_workers: 1,
            retry_limit: 1,
            progress_every: 10,
            escalation: tight_escalation(),
            ..OrchestratorConfig::default()
        },
        stats.clone(),
    )
    .expect("valid config");

    let report = orchestrator.run(ids(60)).await.expect("crawl");

    assert!(stats.escalated(), "run should have escalated");
    assert_eq!(manager.mode().await, EgressMode::ProxyPool);
    assert!(stats.block_events() > 0);

    // The denials tripped the limiter's blocked flag on the way up;
    // escalation resets it and the healthy tail keeps it clear.
    assert!(
        !limiter.is_blocked(),
        "escalation must reset the limiter's blocked flag"
    );

    // Every id reached a terminal outcome once the index recovered.
    assert!(report.exhausted.is_empty());
    assert_eq!(report.succeeded + report.not_found, 60);
}

#[tokio::test]
async fn test_escalation_is_skipped_before_warmup() {
    let server = MockServer::start().await;
    mount_list(&server).await;
    mount_details(&server, StagedDetail::hostile_then_healthy(usize::MAX)).await;

    let site = site_for(&server.uri());
    let egress = EgressConfig {
        proxy: Some(loopback_proxy(&server.uri())),
        warm_pool: false,
        ..EgressConfig::default()
    };
    let manager = Arc::new(IdentityManager::new(egress, site.clone()));
    manager.initialize(2).await.expect("initialize");

    let stats = Arc::new(CrawlStats::new());
    let orchestrator = DetailOrchestrator::new(
        manager.clone(),
        Arc::new(AdaptiveRateLimiter::new(fast_rate())),
        parser(),
        sink().await,
        site,
        OrchestratorConfig {
            workers: 2,
            min_workers: 1,
            retry_limit: 0,
            progress_every: 5,
            escalation: EscalationConfig {
                warmup_items: 1000,
                ..tight_escalation()
            },
            ..OrchestratorConfig::default()
        },
        stats.clone(),
    )
    .expect("valid config");

    // Only 15 attempts ever happen, far below the warm-up threshold, so the
    // noisy early failures must not trigger an escalation.
    let report = orchestrator.run(ids(15)).await.expect("crawl");
    assert!(!stats.escalated());
    assert_eq!(manager.mode().await, EgressMode::Direct);
    assert_eq!(report.exhausted.len(), 15);
}

#[tokio::test]
async fn test_zero_throughput_while_blocked_aborts_when_escalation_unavailable() {
    let server = MockServer::start().await;
    mount_list(&server).await;
    mount_details(&server, StagedDetail::hostile_then_healthy(usize::MAX)).await;

    let site = site_for(&server.uri());
    // No proxy configured: escalation is refused, leaving abort as the only
    // way out of a fully blocked run.
    let manager = Arc::new(IdentityManager::new(EgressConfig::default(), site.clone()));
    manager.initialize(4).await.expect("initialize");

    let stats = Arc::new(CrawlStats::new());
    let orchestrator = DetailOrchestrator::new(
        manager.clone(),
        Arc::new(AdaptiveRateLimiter::new(fast_rate())),
        parser(),
        sink().await,
        site,
        OrchestratorConfig {
            workers: 4,
            min_workers: 1,
            retry_limit: 10,
            progress_every: 10,
            escalation: EscalationConfig {
                consecutive_windows: 1,
                warmup_items: 10,
                fatal_blocked_windows: 2,
                ..tight_escalation()
            },
            ..OrchestratorConfig::default()
        },
        stats.clone(),
    )
    .expect("valid config");

    let result = orchestrator.run(ids(60)).await;
    assert!(
        matches!(result, Err(CrawlError::HardBlocked { .. })),
        "expected a hard-block abort, got {result:?}"
    );
    assert!(!stats.escalated());
    assert_eq!(manager.mode().await, EgressMode::Direct);
}

#[tokio::test]
async fn test_failed_escalation_still_flushes_buffered_records() {
    let server = MockServer::start().await;
    mount_list(&server).await;
    // 20 healthy responses fill the record buffer, then the index turns
    // hostile and drives the run into escalation.
    mount_details(&server, StagedDetail::healthy_then_hostile(20)).await;

    let site = site_for(&server.uri());
    // Unparseable proxy port: escalation is attempted but identity
    // construction fails, aborting the run mid-round.
    let egress = EgressConfig {
        proxy: Some(ProxyConfig {
            host: "proxy.example.net".to_string(),
            port: "not-a-port".to_string(),
            username: "user".to_string(),
            password: "pass".to_string(),
        }),
        warm_pool: false,
        ..EgressConfig::default()
    };
    let manager = Arc::new(IdentityManager::new(egress, site.clone()));
    manager.initialize(4).await.expect("initialize");

    let stats = Arc::new(CrawlStats::new());
    let record_sink = sink().await;
    let orchestrator = DetailOrchestrator::new(
        manager.clone(),
        Arc::new(AdaptiveRateLimiter::new(fast_rate())),
        parser(),
        record_sink.clone(),
        site,
        OrchestratorConfig {
            workers: 4,
            min_workers: 1,
            retry_limit: 10,
            // Larger than the healthy prefix, so nothing flushes before the
            // abort on its own.
            batch_size: 500,
            progress_every: 10,
            escalation: tight_escalation(),
            ..OrchestratorConfig::default()
        },
        stats.clone(),
    )
    .expect("valid config");

    let result = orchestrator.run(ids(60)).await;
    assert!(
        matches!(result, Err(CrawlError::Client { .. })),
        "expected a client-build abort, got {result:?}"
    );

    // The 20 records parsed before the index turned hostile must survive
    // the aborted run.
    let known = record_sink.known_ids().await.expect("known ids");
    assert_eq!(known.len(), 20);
}
