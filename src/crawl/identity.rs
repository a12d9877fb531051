//! Network identity provisioning and rotation.
//!
//! An [`Identity`] is one egress path: an HTTP client bound to a cookie jar,
//! a device fingerprint (user-agent) and, in proxied modes, a sticky proxy
//! session. The [`IdentityManager`] owns the pool of identities workers draw
//! from, and implements the two recovery moves the orchestrator can request:
//! rotating a single poisoned worker identity, and the one-way escalation
//! from direct/single egress to a pool of independent sticky sessions.
//!
//! Cookie discipline: direct and single-proxy modes deliberately share one
//! jar across all identities (one session, many workers); pooled identities
//! each get an isolated jar seeded by their own warm-up fetch. No two tasks
//! ever mutate a jar outside reqwest's own synchronization.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream;
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use reqwest::{Client, Proxy};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::error::CrawlError;
use crate::config::{EgressConfig, SiteConfig, USER_AGENTS};

/// Overall request timeout baked into every identity's client. Individual
/// fetches override this with their own, shorter deadlines.
const CLIENT_TIMEOUT_SECS: u64 = 30;

/// Connection establishment timeout.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Which egress strategy the pool is currently running.
///
/// Transitions are monotonic: a run may move to `ProxyPool` once and never
/// downgrades back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressMode {
    /// No intermediary; all identities share the baseline session cookies.
    Direct,
    /// One fixed proxy egress shared by every worker.
    SingleProxy,
    /// N independent sticky-session proxy identities, one per worker.
    ProxyPool,
}

impl fmt::Display for EgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::SingleProxy => "single-proxy",
            Self::ProxyPool => "proxy-pool",
        })
    }
}

/// One egress path: client, cookie jar, fingerprint, optional sticky session.
#[derive(Debug)]
pub struct Identity {
    client: Client,
    user_agent: &'static str,
    session_id: Option<String>,
}

impl Identity {
    /// HTTP client for this identity. Requests through it carry the
    /// identity's cookies, user-agent, and proxy binding.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Sticky proxy session id, present only in pooled mode.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// User-agent presented by this identity.
    #[must_use]
    pub fn user_agent(&self) -> &'static str {
        self.user_agent
    }
}

fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers
}

fn build_identity(
    user_agent: &'static str,
    jar: Arc<Jar>,
    proxy_url: Option<&str>,
    session_id: Option<String>,
) -> Result<Identity, CrawlError> {
    let mut builder = Client::builder()
        .user_agent(user_agent)
        .default_headers(default_headers())
        .cookie_provider(jar)
        .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS));

    if let Some(url) = proxy_url {
        builder = builder.proxy(Proxy::all(url).map_err(CrawlError::client)?);
    }

    let client = builder.build().map_err(CrawlError::client)?;
    Ok(Identity {
        client,
        user_agent,
        session_id,
    })
}

/// Sticky session key for one worker slot: reproducible prefix for debugging,
/// random suffix to avoid collision across runs.
fn make_session_id(worker_idx: usize) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..100_000);
    format!("w{:02}{:05}", worker_idx % 100, suffix)
}

struct PoolState {
    mode: EgressMode,
    shared_jar: Arc<Jar>,
    identities: Vec<Arc<Identity>>,
    failures: Vec<u32>,
}

/// Provisions, hands out, rotates, and escalates identities.
pub struct IdentityManager {
    cfg: EgressConfig,
    site: Arc<SiteConfig>,
    state: RwLock<PoolState>,
}

impl IdentityManager {
    /// Creates a manager in its starting egress mode.
    ///
    /// Proxied starting modes silently degrade to `Direct` when no proxy is
    /// configured; a crawl without credentials can still run direct.
    #[must_use]
    pub fn new(cfg: EgressConfig, site: Arc<SiteConfig>) -> Self {
        let mode = if cfg.proxy.is_some() {
            if cfg.start_pooled {
                EgressMode::ProxyPool
            } else if cfg.start_with_proxy {
                EgressMode::SingleProxy
            } else {
                EgressMode::Direct
            }
        } else {
            if cfg.start_pooled || cfg.start_with_proxy {
                warn!("proxy mode requested but PROXY_* env is not configured; starting direct");
            }
            EgressMode::Direct
        };

        Self {
            cfg,
            site,
            state: RwLock::new(PoolState {
                mode,
                shared_jar: Arc::new(Jar::default()),
                identities: Vec::new(),
                failures: Vec::new(),
            }),
        }
    }

    /// Current egress mode.
    pub async fn mode(&self) -> EgressMode {
        self.state.read().await.mode
    }

    /// Number of provisioned identities.
    pub async fn worker_count(&self) -> usize {
        self.state.read().await.identities.len()
    }

    /// Acquires the baseline session and provisions `workers` identities.
    ///
    /// The warm-up request runs direct (no intermediary) against the index
    /// endpoint to seed cookies. No crawl can proceed without that session.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Session`] when the warm-up request cannot
    /// complete at the network level; this is fatal for the run.
    #[instrument(skip(self))]
    pub async fn initialize(&self, workers: usize) -> Result<(), CrawlError> {
        let jar = self.state.read().await.shared_jar.clone();
        let bootstrap = build_identity(USER_AGENTS[0], jar, None, None)?;

        self.warm_up(bootstrap.client())
            .await
            .map_err(|e| CrawlError::session(&self.site.index_url, e))?;
        info!(url = %self.site.index_url, "baseline session acquired");

        let mode = self.mode().await;
        let count = if mode == EgressMode::ProxyPool {
            self.cfg.pool_size.max(1)
        } else {
            workers.max(1)
        };
        self.provision(count).await?;
        info!(mode = %self.mode().await, workers = count, "identity pool ready");
        Ok(())
    }

    async fn warm_up(&self, client: &Client) -> Result<(), reqwest::Error> {
        let response = client
            .get(&self.site.index_url)
            .query(&self.site.index_params)
            .send()
            .await?;
        if !response.status().is_success() {
            // Cookies may still have been set; treat a bad status as a cold
            // start rather than a fatal condition.
            warn!(status = %response.status(), "warm-up returned non-success status");
        }
        Ok(())
    }

    /// Identity for one worker slot, or `None` before `initialize`.
    pub async fn identity_for(&self, worker_idx: usize) -> Option<Arc<Identity>> {
        let state = self.state.read().await;
        if state.identities.is_empty() {
            return None;
        }
        Some(state.identities[worker_idx % state.identities.len()].clone())
    }

    /// Clears a worker's consecutive-failure streak.
    pub async fn record_success(&self, worker_idx: usize) {
        let mut state = self.state.write().await;
        if state.failures.is_empty() {
            return;
        }
        let slot = worker_idx % state.failures.len();
        state.failures[slot] = 0;
    }

    /// Records a blocked response attributed to one worker's identity.
    ///
    /// In pooled mode, accumulating `rotate_threshold` consecutive block
    /// failures rotates that worker's identity in place so one bad egress
    /// path does not poison the whole run.
    pub async fn record_block(&self, worker_idx: usize, reason: &str) {
        let rotate_slot = {
            let mut state = self.state.write().await;
            if state.failures.is_empty() {
                return;
            }
            let pooled = state.mode == EgressMode::ProxyPool;
            // Workers map onto identities modulo the pool size, exactly as
            // identity_for hands them out; failures must land on the same
            // slot or shared identities could never rotate.
            let slot = worker_idx % state.failures.len();
            state.failures[slot] += 1;
            (pooled && state.failures[slot] >= self.cfg.rotate_threshold).then_some(slot)
        };
        if let Some(slot) = rotate_slot {
            self.rotate_worker(slot, reason).await;
        }
    }

    /// Replaces one worker's identity with a freshly warmed one.
    ///
    /// Only meaningful in pooled mode. Failures here are logged and leave the
    /// old identity in place; the retry machinery covers the gap.
    #[instrument(skip(self))]
    pub async fn rotate_worker(&self, worker_idx: usize, reason: &str) {
        if self.mode().await != EgressMode::ProxyPool {
            return;
        }
        let Some(proxy) = self.cfg.proxy.as_ref() else {
            return;
        };

        let session_id = make_session_id(worker_idx);
        let proxy_url = proxy.url(Some(&session_id), &self.cfg.session_lifetime);
        let jar = Arc::new(Jar::default());
        let identity = match build_identity(
            USER_AGENTS[worker_idx % USER_AGENTS.len()],
            jar,
            Some(&proxy_url),
            Some(session_id),
        ) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(worker = worker_idx, error = %e, "identity rotation failed");
                return;
            }
        };

        if self.cfg.warm_pool
            && let Err(e) = self.warm_up(identity.client()).await
        {
            warn!(worker = worker_idx, error = %e, "rotated identity warm-up failed");
        }

        let mut state = self.state.write().await;
        if state.identities.is_empty() {
            return;
        }
        let slot = worker_idx % state.identities.len();
        state.identities[slot] = Arc::new(identity);
        state.failures[slot] = 0;
        info!(worker = worker_idx, slot, reason, "worker identity rotated");
    }

    /// One-way escalation to pooled egress.
    ///
    /// Resizes the pool to `pool_size` and re-provisions every identity with
    /// its own sticky session and cookie jar. Returns `false` when already
    /// pooled or when no proxy is configured. The caller is responsible for
    /// resetting the rate limiter and block counters afterwards; escalation
    /// is a deliberate fresh start for the traffic-shaping state.
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Client`] when the replacement identities cannot
    /// be constructed.
    #[instrument(skip(self))]
    pub async fn escalate(&self, reason: &str) -> Result<bool, CrawlError> {
        {
            let mut state = self.state.write().await;
            if state.mode == EgressMode::ProxyPool {
                return Ok(false);
            }
            if self.cfg.proxy.is_none() {
                warn!("escalation requested but no proxy is configured");
                return Ok(false);
            }
            state.mode = EgressMode::ProxyPool;
        }

        warn!(reason, pool_size = self.cfg.pool_size, "escalating to pooled egress");
        self.provision(self.cfg.pool_size.max(1)).await?;
        info!("pooled egress active");
        Ok(true)
    }

    /// Builds and installs `count` identities for the current mode.
    async fn provision(&self, count: usize) -> Result<(), CrawlError> {
        let (mode, shared_jar) = {
            let state = self.state.read().await;
            (state.mode, state.shared_jar.clone())
        };

        let identities = match mode {
            EgressMode::Direct | EgressMode::SingleProxy => {
                let proxy_url = match (mode, self.cfg.proxy.as_ref()) {
                    (EgressMode::SingleProxy, Some(proxy)) => Some(proxy.url(None, "")),
                    _ => None,
                };
                (0..count)
                    .map(|i| {
                        build_identity(
                            USER_AGENTS[i % USER_AGENTS.len()],
                            shared_jar.clone(),
                            proxy_url.as_deref(),
                            None,
                        )
                        .map(Arc::new)
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            EgressMode::ProxyPool => self.provision_pool(count).await?,
        };

        let mut state = self.state.write().await;
        state.identities = identities;
        state.failures = vec![0; count];
        debug!(mode = %mode, count, "identities provisioned");
        Ok(())
    }

    /// Builds pooled identities, warming their jars with a bounded fan-out.
    async fn provision_pool(&self, count: usize) -> Result<Vec<Arc<Identity>>, CrawlError> {
        let Some(proxy) = self.cfg.proxy.as_ref() else {
            return Err(CrawlError::Config(
                "pooled egress requires proxy configuration".to_string(),
            ));
        };

        let mut built = Vec::with_capacity(count);
        for i in 0..count {
            let session_id = make_session_id(i);
            let proxy_url = proxy.url(Some(&session_id), &self.cfg.session_lifetime);
            built.push(build_identity(
                USER_AGENTS[i % USER_AGENTS.len()],
                Arc::new(Jar::default()),
                Some(&proxy_url),
                Some(session_id),
            )?);
        }

        if !self.cfg.warm_pool {
            return Ok(built.into_iter().map(Arc::new).collect());
        }

        // Seed per-identity cookies in parallel, bounded so provisioning a
        // large pool does not itself look like a burst.
        let mut warmed: Vec<(usize, Identity)> = stream::iter(built.into_iter().enumerate())
            .map(|(i, identity)| async move {
                if let Err(e) = self.warm_up(identity.client()).await {
                    warn!(worker = i, error = %e, "pool identity warm-up failed; using cold cookies");
                }
                (i, identity)
            })
            .buffer_unordered(self.cfg.warmup_concurrency.max(1))
            .collect()
            .await;
        warmed.sort_by_key(|(i, _)| *i);
        Ok(warmed.into_iter().map(|(_, id)| Arc::new(id)).collect())
    }
}
