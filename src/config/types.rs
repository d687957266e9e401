use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Main configuration structure for Sumi-Harvest
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// URLs the crawl is seeded with
    #[serde(default)]
    pub seeds: Vec<String>,

    /// User agent of the default HTTP client
    #[serde(default)]
    pub user_agent: Option<String>,

    /// Static proxy applied to every request attempt
    #[serde(default)]
    pub proxy: Option<String>,

    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Static default headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Scheduling and retry behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Maximum number of simultaneously in-flight tasks
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Per-attempt timeout (milliseconds)
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Additional attempts after the first one fails
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Minimum gap between two dispatch starts (milliseconds)
    #[serde(default)]
    pub interval: u64,

    /// Base delay of the exponential retry backoff (milliseconds)
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Upper bound of the retry backoff (milliseconds)
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: u64,
}

impl CrawlerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval)
    }

    /// Backoff before re-attempt number `attempt` (1-based, counting the
    /// first re-attempt as 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if self.retry_delay == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let delay = self.retry_delay.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_retry_delay))
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout: default_timeout(),
            retry: default_retry(),
            interval: 0,
            retry_delay: default_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Directory downloads queued by the CLI are written to
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
        }
    }
}

fn default_concurrency() -> usize {
    5
}

fn default_timeout() -> u64 {
    30_000
}

fn default_retry() -> u32 {
    2
}

fn default_retry_delay() -> u64 {
    500
}

fn default_max_retry_delay() -> u64 {
    10_000
}

fn default_download_dir() -> String {
    "./downloads".to_string()
}
