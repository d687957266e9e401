//! Per-run counters

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Live counters updated by the scheduler and the pipelines
#[derive(Debug, Default)]
pub struct CrawlStats {
    dispatched: AtomicU64,
    requests_succeeded: AtomicU64,
    downloads_succeeded: AtomicU64,
    failures: AtomicU64,
    provider_errors: AtomicU64,
    injected: AtomicU64,
    peak_in_flight: AtomicUsize,
}

impl CrawlStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_dispatch(&self, in_flight: usize) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.peak_in_flight.fetch_max(in_flight, Ordering::Relaxed);
    }

    pub(crate) fn record_request_success(&self) {
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_download_success(&self) {
        self.downloads_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_provider_error(&self) {
        self.provider_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_injected(&self) {
        self.injected.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the counters into a summary
    pub fn snapshot(&self, elapsed: Duration) -> CrawlSummary {
        CrawlSummary {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            downloads_succeeded: self.downloads_succeeded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
            injected: self.injected.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// Snapshot of a finished (or running) crawl
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlSummary {
    /// Tasks handed to a pipeline
    pub dispatched: u64,

    /// Requests whose response reached the extraction callback
    pub requests_succeeded: u64,

    /// Downloads fully written to disk
    pub downloads_succeeded: u64,

    /// Exhausted or cancelled tasks
    pub failures: u64,

    /// Errors raised by the extraction callback
    pub provider_errors: u64,

    /// Tasks enqueued by follow, retry, and queue-download
    pub injected: u64,

    /// Highest number of simultaneously in-flight tasks observed
    pub peak_in_flight: usize,

    pub elapsed: Duration,
}

impl fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Crawl Summary ===")?;
        writeln!(f, "  Dispatched:          {}", self.dispatched)?;
        writeln!(f, "  Pages fetched:       {}", self.requests_succeeded)?;
        writeln!(f, "  Downloads written:   {}", self.downloads_succeeded)?;
        writeln!(f, "  Failures:            {}", self.failures)?;
        writeln!(f, "  Extraction errors:   {}", self.provider_errors)?;
        writeln!(f, "  Tasks injected:      {}", self.injected)?;
        writeln!(f, "  Peak in flight:      {}", self.peak_in_flight)?;
        write!(f, "  Elapsed:             {:.2?}", self.elapsed)
    }
}
