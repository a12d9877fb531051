//! Adaptive inter-request backoff.
//!
//! Unlike a fixed-delay limiter, [`AdaptiveRateLimiter`] tracks a single delay
//! value shared by all workers: sustained success gently speeds the crawl up,
//! hostile throttling signals slow it down sharply. Workers re-read
//! [`current_delay`](AdaptiveRateLimiter::current_delay) before every request,
//! so a limiter tightened by one worker's failure immediately slows the rest.
//!
//! The blocked flag is advisory: the orchestrator uses it to decide whether to
//! escalate the egress strategy, never to stop the process.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::config::RateLimitConfig;

/// Consecutive errors before the limiter reports itself blocked.
const BLOCK_THRESHOLD: u32 = 5;

/// Delay decay applied on each success.
const SUCCESS_DECAY: f64 = 0.95;

/// Delay multiplier applied on each hostile-throttling signal.
const HOSTILE_MULTIPLIER: f64 = 3.0;

/// What a failed request said about the server's disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSignal {
    /// Explicit throttling or access denial (HTTP 429/403, block page).
    Hostile,
    /// Any other failure; counts toward the block threshold but does not
    /// change the delay.
    Benign,
}

/// Mutable limiter state. Mutated only through the two transition functions.
#[derive(Debug)]
struct RateState {
    delay: Duration,
    min_delay: Duration,
    consecutive_errors: u32,
    blocked: bool,
}

/// Adaptive rate limiter shared across all workers of one run.
///
/// Reads and writes are cheap, so a plain mutex is the synchronization point;
/// the lock is never held across an await.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    base_min: Duration,
    max_delay: Duration,
    state: Mutex<RateState>,
}

impl AdaptiveRateLimiter {
    /// Creates a limiter with the given bounds.
    #[must_use]
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            base_min: cfg.min_delay,
            max_delay: cfg.max_delay,
            state: Mutex::new(RateState {
                delay: cfg.initial_delay.clamp(cfg.min_delay, cfg.max_delay),
                min_delay: cfg.min_delay,
                consecutive_errors: 0,
                blocked: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RateState> {
        // A poisoned lock only means a panicking thread held it; the state
        // itself stays valid.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current inter-request delay.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.state().delay
    }

    /// Records a successful request: clears the error streak and speeds up
    /// gently, never below the floor.
    pub fn on_success(&self) {
        let mut state = self.state();
        state.consecutive_errors = 0;
        state.delay = state.delay.mul_f64(SUCCESS_DECAY).max(state.min_delay);
    }

    /// Records a failed request.
    ///
    /// A hostile signal multiplies the delay by 3 up to the ceiling; five
    /// consecutive errors of any kind set the advisory blocked flag.
    pub fn on_error(&self, signal: ErrorSignal) {
        let mut state = self.state();
        state.consecutive_errors += 1;

        if signal == ErrorSignal::Hostile {
            state.delay = state.delay.mul_f64(HOSTILE_MULTIPLIER).min(self.max_delay);
            debug!(
                delay_ms = state.delay.as_millis(),
                consecutive_errors = state.consecutive_errors,
                "hostile signal, delay raised"
            );
        }
        if state.consecutive_errors >= BLOCK_THRESHOLD {
            state.blocked = true;
        }
    }

    /// Whether the limiter considers the current egress path blocked.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.state().blocked
    }

    /// Raises the delay floor by `multiplier` for a deliberate round-level
    /// slow-down, distinct from the per-request adaptation. Returns the new
    /// delay.
    pub fn raise_floor(&self, multiplier: f64) -> Duration {
        let mut state = self.state();
        let raised = state.delay.mul_f64(multiplier).min(self.max_delay);
        state.delay = raised;
        state.min_delay = state.min_delay.max(raised);
        raised
    }

    /// Resets delay, floor, error streak, and blocked flag to their initial
    /// values. Called after egress escalation as a fresh start for the
    /// traffic-shaping state.
    pub fn reset(&self) {
        let mut state = self.state();
        state.delay = self.base_min;
        state.min_delay = self.base_min;
        state.consecutive_errors = 0;
        state.blocked = false;
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
