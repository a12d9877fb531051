//! CLI argument definitions using clap derive macros.

use clap::{Parser, ValueEnum};

/// What subset of the pipeline a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Enumerate the index and crawl every id.
    Full,
    /// Enumerate the index and crawl only ids not already stored.
    Incremental,
    /// Enumerate the index and stop; no detail pages are fetched.
    ListOnly,
}

/// Crawl a paginated web index into a local SQLite store.
///
/// Harvester walks the index's list pages to enumerate item ids, then fetches
/// each item's detail page concurrently, adapting its pace and egress
/// strategy to the server's throttling behavior.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Pipeline subset to run
    #[arg(short, long, value_enum, default_value_t = Mode::Full)]
    pub mode: Mode,

    /// List endpoint walked page by page
    #[arg(long)]
    pub index_url: String,

    /// Base URL for detail pages; item ids are appended as a path segment
    #[arg(long)]
    pub detail_url: String,

    /// Regex applied to list pages; the first capture group is the item id
    #[arg(long, default_value = r"detail/(\d+)")]
    pub id_pattern: String,

    /// Query parameter carrying the page number
    #[arg(long, default_value = "page")]
    pub page_param: String,

    /// Source tag stamped on every stored record
    #[arg(long, default_value = "index")]
    pub source: String,

    /// Concurrent detail workers in the first round (1-100)
    #[arg(short = 'w', long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub workers: u8,

    /// Maximum list pages to enumerate (unset walks to the index's end)
    #[arg(short = 'p', long)]
    pub max_pages: Option<usize>,

    /// Failed attempts allowed per item beyond the first (0-10)
    #[arg(short = 'r', long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retry_limit: u8,

    /// Records buffered before a sink flush
    #[arg(short = 'b', long, default_value_t = 500, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_size: u32,

    /// Wall-clock budget for the detail phase, in seconds (unset for no budget)
    #[arg(long)]
    pub budget_secs: Option<u64>,

    /// Start routed through the proxy instead of escalating lazily
    #[arg(long)]
    pub proxy: bool,

    /// Start with a full pool of sticky proxy sessions
    #[arg(long)]
    pub pooled: bool,

    /// SQLite database path
    #[arg(short = 'd', long, default_value = "harvester.db")]
    pub db: String,
}
