//! The crawl engine: enumeration, adaptive pacing, egress management, and
//! the concurrent detail orchestrator.
//!
//! A run wires the pieces together in a fixed shape: one shared
//! [`AdaptiveRateLimiter`] paces every request, one [`IdentityManager`] owns
//! the egress identities, the [`ListEnumerator`] collects ids sequentially,
//! and the [`DetailOrchestrator`] crawls them concurrently into a
//! [`RecordSink`](crate::sink::RecordSink).

pub mod error;
pub mod fetch;
pub mod identity;
pub mod list;
pub mod orchestrator;
pub mod rate_limiter;
pub mod stats;

pub use error::{CrawlError, FailureKind};
pub use fetch::FetchOutcome;
pub use identity::{EgressMode, Identity, IdentityManager};
pub use list::ListEnumerator;
pub use orchestrator::{DetailOrchestrator, RunReport};
pub use rate_limiter::{AdaptiveRateLimiter, ErrorSignal};
pub use stats::{CrawlStats, RunOutcome, RunSummary};
