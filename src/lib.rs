//! Sumi-Harvest: a concurrent crawl and download engine
//!
//! This crate schedules heterogeneous units of work (fetch-and-extract requests
//! and download-to-file transfers) under a concurrency ceiling and a dispatch
//! interval, retries failed attempts, and lets extraction callbacks inject
//! further work back into the running crawl.

pub mod config;
pub mod crawler;

use std::sync::Arc;
use thiserror::Error;

/// Main error type for Sumi-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP error for {url}: {source}")]
    Http { url: String, source: reqwest::Error },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Request timeout for {url} after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: Box<HarvestError>,
    },

    #[error("Stream error ({side}) for {url}: {message}")]
    Stream {
        url: String,
        side: crawler::StreamSide,
        message: String,
    },

    #[error("Operation cancelled: {url}")]
    Cancelled { url: String },

    #[error("Extraction failed for {url}: {source}")]
    Provider { url: String, source: anyhow::Error },

    #[error("{kind} resolver failed for {url}: {message}")]
    Resolver {
        url: String,
        kind: crawler::ResolverKind,
        message: String,
    },

    #[error("Invalid header {name}: {message}")]
    InvalidHeader { name: String, message: String },

    #[error("Invalid selector '{selector}': {message}")]
    Selector { selector: String, message: String },

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarvestError {
    /// Whether this error (or the last attempt it wraps) is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            HarvestError::Cancelled { .. } => true,
            HarvestError::Exhausted { last, .. } => last.is_cancelled(),
            _ => false,
        }
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Sumi-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Shared handle to an error, as delivered to error subscribers
pub type SharedError = Arc<HarvestError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{Crawler, CrawlerBuilder, ErrorEvent, ResponseContext, Task};
