//! Crawl engine
//!
//! This module contains the task scheduling and execution engine, including:
//! - The FIFO task queue and the run state (active, stopped, cancelled)
//! - The scheduler enforcing the concurrency ceiling and dispatch interval
//! - The request pipeline (resolvers, hook, timeout, retry)
//! - The download pipeline (stream-to-file with first-error aggregation)
//! - The response context handed to extraction callbacks
//! - Overall crawl coordination

mod context;
mod coordinator;
mod download;
mod fetcher;
mod parser;
mod queue;
mod resolver;
mod retry;
mod run_state;
mod scheduler;
mod stats;
mod task;

pub use context::ResponseContext;
pub use coordinator::{Crawler, CrawlerBuilder, ErrorEvent, Provider};
pub use download::{pipe_stream, DownloadPipeline, StreamSide};
pub use fetcher::{build_http_client, ClientPool, FetchedResponse, PreRequestHook, RequestConfig, RequestPipeline};
pub use parser::Document;
pub use queue::TaskQueue;
pub use resolver::{static_value, Auth, ResolveRequest, ResolveResult, Resolved, Resolver, ResolverKind, Resolvers};
pub use retry::{RetryNotice, RetryObserver, RetryPolicy};
pub use run_state::{RunPhase, RunState};
pub use scheduler::{Scheduler, TaskRunner};
pub use stats::{CrawlStats, CrawlSummary};
pub use task::{
    get_header, merge_headers, remove_header, set_header, DownloadOptions, DownloadTask, Headers, RequestTask,
    Task, REFERER,
};
