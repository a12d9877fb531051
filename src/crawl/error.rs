//! Error taxonomy for the crawl engine.
//!
//! Per-item failures are a closed set ([`FailureKind`]) so the orchestrator's
//! classification is exhaustive; they never escape the orchestrator and are
//! absorbed into retry bookkeeping. Run-level conditions ([`CrawlError`]) are
//! the only errors that propagate to the caller.

use thiserror::Error;

/// Classification of one failed fetch attempt.
///
/// `NotFound` is deliberately absent: a definitive "resource does not exist"
/// response is a terminal outcome, not a failure, and is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection error or timeout. Always retryable up to the limit.
    Transport,
    /// Throttling or access-denial response (429/403 or a block/CAPTCHA page).
    /// Retryable, and additionally a signal consumed by the rate limiter and
    /// the identity manager.
    Blocked,
    /// The response arrived but did not yield a usable record. Retryable by
    /// default since a transient malformed response is indistinguishable from
    /// a permanent source change at this layer.
    Parse,
}

impl FailureKind {
    /// Stable label used in logs and run reports.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Blocked => "blocked",
            Self::Parse => "parse",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal, run-level crawl errors.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The initial warm-up request could not complete. No crawl can proceed
    /// without a session, so this aborts the run before any work starts.
    #[error("failed to acquire initial session from {url}: {source}")]
    Session {
        /// Warm-up URL that failed.
        url: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },

    /// Failed to construct an HTTP client for an identity.
    #[error("failed to build egress client: {source}")]
    Client {
        /// Underlying builder error.
        #[source]
        source: reqwest::Error,
    },

    /// Throughput stayed at zero while blocked even after egress escalation
    /// was attempted. Retrying forever against a hostile server is pointless.
    #[error(
        "crawl aborted: zero throughput while blocked for {windows} consecutive windows after escalation"
    )]
    HardBlocked {
        /// Number of consecutive blocked measurement windows observed.
        windows: u32,
    },

    /// Invalid configuration supplied by the caller.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CrawlError {
    /// Creates a session acquisition error.
    pub fn session(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Session {
            url: url.into(),
            source,
        }
    }

    /// Creates a client construction error.
    pub fn client(source: reqwest::Error) -> Self {
        Self::Client { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_labels() {
        assert_eq!(FailureKind::Transport.as_str(), "transport");
        assert_eq!(FailureKind::Blocked.as_str(), "blocked");
        assert_eq!(FailureKind::Parse.as_str(), "parse");
        assert_eq!(FailureKind::Blocked.to_string(), "blocked");
    }

    #[test]
    fn test_hard_blocked_display() {
        let err = CrawlError::HardBlocked { windows: 3 };
        let msg = err.to_string();
        assert!(msg.contains("3"), "expected window count in: {msg}");
        assert!(msg.contains("escalation"), "expected context in: {msg}");
    }

    #[test]
    fn test_config_error_display() {
        let err = CrawlError::Config("workers must be at least 1".to_string());
        assert!(err.to_string().contains("workers must be at least 1"));
    }
}
