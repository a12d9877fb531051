//! Harvester Core Library
//!
//! This library implements a resilient crawler for paginated, rate-limited
//! web indexes: enumerate item ids from list pages, fetch each item's detail
//! page concurrently, and upsert the parsed records into a local store while
//! adapting to throttling and anti-bot countermeasures.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Site endpoints, egress, pacing, and orchestration settings
//! - [`crawl`] - The engine: enumeration, rate limiting, identities, orchestration
//! - [`parser`] - List/detail page parsing behind the [`PageParser`] seam
//! - [`db`] - Database connection, schema management, and the run log
//! - [`sink`] - Record persistence behind the [`RecordSink`] seam
//! - [`record`] - The crawled item record and its id

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod crawl;
pub mod db;
pub mod parser;
pub mod record;
pub mod sink;

// Re-export commonly used types
pub use config::{
    EgressConfig, EscalationConfig, ListConfig, OrchestratorConfig, ProxyConfig, RateLimitConfig,
    SiteConfig, USER_AGENTS,
};
pub use crawl::{
    AdaptiveRateLimiter, CrawlError, CrawlStats, DetailOrchestrator, EgressMode, FailureKind,
    IdentityManager, ListEnumerator, RunOutcome, RunReport, RunSummary,
};
pub use db::{Database, DbError};
pub use parser::{JsonLdParser, PageParser, ParseError};
pub use record::{ItemId, Record};
pub use sink::{RecordSink, SinkError, SinkReport, SqliteSink};
