//! Integration tests for the crawl engine
//!
//! These tests use wiremock to create mock HTTP servers and drive full
//! crawl runs end-to-end.

mod crawl_tests;
mod download_tests;

use sumi_harvest::config::{Config, CrawlerConfig};

/// Creates a test configuration with fast, deterministic retry settings
pub fn test_config(concurrency: usize, retry: u32) -> Config {
    Config {
        crawler: CrawlerConfig {
            concurrency,
            timeout: 5000,
            retry,
            interval: 0,
            retry_delay: 0,
            max_retry_delay: 0,
        },
        ..Config::default()
    }
}

/// Wraps `body` in a minimal HTML page with the given title
pub fn html_page(title: &str, body: &str) -> String {
    format!(
        "<html><head><title>{}</title></head><body>{}</body></html>",
        title, body
    )
}
