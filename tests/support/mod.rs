//! Shared helpers for crawl integration tests.

use std::sync::Arc;
use std::time::Duration;

use harvester_core::{
    Database, JsonLdParser, RateLimitConfig, SiteConfig, SqliteSink,
};

/// Site configuration pointing at a mock server.
pub fn site_for(server_uri: &str) -> Arc<SiteConfig> {
    Arc::new(SiteConfig {
        index_url: format!("{server_uri}/list"),
        page_param: "page".to_string(),
        index_params: vec![],
        detail_url: format!("{server_uri}/detail"),
        source: "test".to_string(),
    })
}

/// Parser matching the mock site's `/detail/<digits>` links.
pub fn parser() -> Arc<JsonLdParser> {
    Arc::new(JsonLdParser::new("test", r"detail/(\d+)").expect("valid pattern"))
}

/// Millisecond-scale limiter bounds so tests run fast.
pub fn fast_rate() -> RateLimitConfig {
    RateLimitConfig {
        initial_delay: Duration::from_millis(1),
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(50),
    }
}

/// In-memory sink.
pub async fn sink() -> Arc<SqliteSink> {
    Arc::new(SqliteSink::new(
        Database::new_in_memory().await.expect("in-memory db"),
    ))
}

/// List page body with one detail link per id.
pub fn list_body(ids: &[u64]) -> String {
    let links: String = ids
        .iter()
        .map(|id| format!(r#"<a href="/detail/{id}">item {id}</a>"#))
        .collect();
    format!("<html><body>{links}</body></html>")
}

/// Detail page body carrying a JSON-LD JobPosting.
pub fn detail_body(title: &str) -> String {
    format!(
        r#"<html><head><title>{title} - TestIndex</title></head>
        <script type="application/ld+json">
        {{
          "@type": "JobPosting",
          "title": "{title}",
          "hiringOrganization": {{ "@type": "Organization", "name": "Test Org" }},
          "jobLocation": {{ "address": {{ "addressLocality": "Testville" }} }},
          "employmentType": "FULL_TIME"
        }}
        </script></html>"#
    )
}
