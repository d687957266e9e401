//! Crawler coordinator - wires configuration, pipelines and the scheduler
//!
//! This module contains the orchestrator that:
//! - Builds the request and download pipelines from configuration
//! - Seeds the task queue
//! - Runs the scheduler until quiescence, stop, or cancellation
//! - Hands each fetched response to the extraction callback
//! - Publishes every failure on the error channel

use crate::config::Config;
use crate::crawler::context::ResponseContext;
use crate::crawler::download::DownloadPipeline;
use crate::crawler::fetcher::{ClientPool, PreRequestHook, RequestConfig, RequestPipeline};
use crate::crawler::queue::TaskQueue;
use crate::crawler::resolver::{static_value, Auth, Resolver, Resolvers};
use crate::crawler::retry::{RetryNotice, RetryObserver, RetryPolicy};
use crate::crawler::run_state::RunState;
use crate::crawler::scheduler::{Scheduler, TaskRunner};
use crate::crawler::stats::{CrawlStats, CrawlSummary};
use crate::crawler::task::{DownloadTask, Headers, RequestTask, Task};
use crate::{HarvestError, SharedError};
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};

/// Error events buffered per subscriber before the oldest are dropped
const ERROR_CHANNEL_CAPACITY: usize = 1024;

/// Extraction callback invoked once per successfully fetched request
///
/// Any `Fn(ResponseContext) -> impl Future<Output = anyhow::Result<()>>`
/// closure is a provider. An `Err` or a panic is reported as a provider error
/// and never retried.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    async fn extract(&self, context: ResponseContext) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> Provider for F
where
    F: Fn(ResponseContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn extract(&self, context: ResponseContext) -> anyhow::Result<()> {
        (self)(context).await
    }
}

/// A failed task, as delivered to error subscribers
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: SharedError,

    /// The task whose execution failed
    pub task: Task,
}

/// Builds a [`Crawler`] from configuration plus the optional collaborators
pub struct CrawlerBuilder {
    config: Config,
    provider: Option<Arc<dyn Provider>>,
    resolvers: Resolvers,
    pre_request: Option<PreRequestHook>,
    retry_observer: Option<RetryObserver>,
}

impl CrawlerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            provider: None,
            resolvers: Resolvers::default(),
            pre_request: None,
            retry_observer: None,
        }
    }

    /// Sets the extraction callback; without one, responses are discarded
    pub fn provider(mut self, provider: impl Provider) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Overrides the static `proxy` from configuration
    pub fn proxy_resolver(mut self, resolver: impl Resolver<String> + 'static) -> Self {
        self.resolvers.proxy = Some(Arc::new(resolver));
        self
    }

    pub fn user_agent_resolver(mut self, resolver: impl Resolver<String> + 'static) -> Self {
        self.resolvers.user_agent = Some(Arc::new(resolver));
        self
    }

    pub fn headers_resolver(mut self, resolver: impl Resolver<Headers> + 'static) -> Self {
        self.resolvers.headers = Some(Arc::new(resolver));
        self
    }

    pub fn auth_resolver(mut self, resolver: impl Resolver<Auth> + 'static) -> Self {
        self.resolvers.auth = Some(Arc::new(resolver));
        self
    }

    /// Mutates each request config right before its network attempt
    pub fn pre_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut RequestConfig) + Send + Sync + 'static,
    {
        self.pre_request = Some(Arc::new(hook));
        self
    }

    /// Receives a notice before every re-attempt, from both pipelines
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&RetryNotice) + Send + Sync + 'static,
    {
        self.retry_observer = Some(Arc::new(observer));
        self
    }

    /// Builds the crawler and seeds it with the configured seed URLs
    pub fn build(self) -> Result<Crawler, HarvestError> {
        let CrawlerBuilder {
            config,
            provider,
            mut resolvers,
            pre_request,
            retry_observer,
        } = self;

        if resolvers.proxy.is_none() {
            if let Some(proxy) = &config.proxy {
                resolvers.proxy = Some(Arc::new(static_value(proxy.clone())));
            }
        }

        let provider: Arc<dyn Provider> = match provider {
            Some(provider) => provider,
            None => Arc::new(|_context: ResponseContext| async { Ok::<_, anyhow::Error>(()) }),
        };

        let queue = TaskQueue::new();
        let state = RunState::new();
        let stats = Arc::new(CrawlStats::new());
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        let clients = Arc::new(ClientPool::new(config.user_agent.clone())?);
        let retry = RetryPolicy::new(&config.crawler, retry_observer);
        let token = state.token().clone();

        let requests = RequestPipeline::new(
            clients.clone(),
            resolvers,
            config.headers.clone(),
            config.crawler.timeout(),
            retry.clone(),
            pre_request,
            token.clone(),
        );
        let downloads = Arc::new(DownloadPipeline::new(
            clients,
            config.crawler.timeout(),
            retry,
            token,
        ));

        let runner = Arc::new(CrawlRunner {
            requests,
            downloads,
            provider,
            queue: queue.clone(),
            state: state.clone(),
            stats: stats.clone(),
            errors: errors.clone(),
        });

        queue.extend(
            config
                .seeds
                .iter()
                .map(|seed| Task::Request(RequestTask::get(seed.as_str()))),
        );

        Ok(Crawler {
            config,
            queue,
            state,
            stats,
            errors,
            runner,
            running: Mutex::new(()),
        })
    }
}

/// Orchestrates one crawl run
pub struct Crawler {
    config: Config,
    queue: TaskQueue,
    state: RunState,
    stats: Arc<CrawlStats>,
    errors: broadcast::Sender<ErrorEvent>,
    runner: Arc<CrawlRunner>,

    /// Held for the whole of [`Crawler::run`]
    running: Mutex<()>,
}

impl Crawler {
    pub fn builder(config: Config) -> CrawlerBuilder {
        CrawlerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Shared run state; clone it to stop or cancel from another task
    pub fn run_state(&self) -> &RunState {
        &self.state
    }

    /// Appends a task to the queue
    pub fn push(&self, task: impl Into<Task>) {
        self.queue.push(task.into());
    }

    /// Appends a GET request for each URL
    pub fn seed<I, U>(&self, urls: I)
    where
        I: IntoIterator<Item = U>,
        U: Into<RequestTask>,
    {
        self.queue
            .extend(urls.into_iter().map(|url| Task::Request(url.into())));
    }

    /// Subscribes to failures reported from now on
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ErrorEvent> {
        self.errors.subscribe()
    }

    /// Stops injecting and dispatching new work; in-flight tasks finish
    pub fn stop(&self) {
        tracing::info!("Stopping crawl");
        self.state.stop();
    }

    /// Aborts every in-flight network operation; terminal for the run
    pub fn cancel(&self) {
        tracing::info!("Cancelling crawl");
        self.state.cancel();
    }

    /// Live counters of the run
    pub fn stats(&self) -> &CrawlStats {
        &self.stats
    }

    /// Runs until the queue is empty with nothing in flight, or until the run
    /// is stopped or cancelled
    ///
    /// Overlapping calls on one crawler are serialized, so a single scheduler
    /// ever drains the queue and the concurrency ceiling holds across them.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use sumi_harvest::config::load_config;
    /// use sumi_harvest::{Crawler, ResponseContext};
    /// use std::path::Path;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = load_config(Path::new("harvest.toml"))?;
    /// let crawler = Crawler::builder(config)
    ///     .provider(|context: ResponseContext| async move {
    ///         let links = context.document().links();
    ///         for link in links {
    ///             context.follow(link);
    ///         }
    ///         Ok::<_, anyhow::Error>(())
    ///     })
    ///     .build()?;
    ///
    /// let summary = crawler.run().await;
    /// println!("{}", summary);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run(&self) -> CrawlSummary {
        let _running = match self.running.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!("Crawl already running, waiting for it to finish");
                self.running.lock().await
            }
        };

        let started = Instant::now();
        tracing::info!(
            "Starting crawl: {} queued, concurrency {}, interval {}ms",
            self.queue.len(),
            self.config.crawler.concurrency,
            self.config.crawler.interval
        );

        let scheduler = Scheduler::new(
            self.queue.clone(),
            self.state.clone(),
            self.config.crawler.concurrency,
            self.config.crawler.interval(),
            self.stats.clone(),
        );
        scheduler.run(self.runner.clone()).await;

        let summary = self.stats.snapshot(started.elapsed());
        tracing::info!(
            "Crawl finished ({:?}): {} dispatched, {} failures, {} left in queue",
            self.state.phase(),
            summary.dispatched,
            summary.failures,
            self.queue.len()
        );
        summary
    }
}

/// Executes dispatched tasks on behalf of the scheduler
struct CrawlRunner {
    requests: RequestPipeline,
    downloads: Arc<DownloadPipeline>,
    provider: Arc<dyn Provider>,
    queue: TaskQueue,
    state: RunState,
    stats: Arc<CrawlStats>,
    errors: broadcast::Sender<ErrorEvent>,
}

impl CrawlRunner {
    async fn run_request(&self, request: RequestTask) {
        let response = match self.requests.execute(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                self.report(e, Task::Request(request));
                return;
            }
        };

        self.stats.record_request_success();
        tracing::debug!(
            "Fetched {} ({}) in {:?}",
            response.url,
            response.status,
            response.elapsed
        );

        let context = ResponseContext::new(
            response,
            request.clone(),
            self.queue.clone(),
            self.state.clone(),
            self.stats.clone(),
            self.downloads.clone(),
        );

        let source = match AssertUnwindSafe(self.provider.extract(context))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(source)) => source,
            Err(payload) => {
                anyhow::anyhow!("extraction callback panicked: {}", panic_message(&*payload))
            }
        };

        self.stats.record_provider_error();
        let error = HarvestError::Provider {
            url: request.url.clone(),
            source,
        };
        self.report(error, Task::Request(request));
    }

    async fn run_download(&self, download: DownloadTask) {
        match self.downloads.execute(&download).await {
            Ok(_) => self.stats.record_download_success(),
            Err(e) => {
                self.stats.record_failure();
                self.report(e, Task::Download(download));
            }
        }
    }

    fn report(&self, error: HarvestError, task: Task) {
        if error.is_cancelled() {
            tracing::debug!("Cancelled: {}", task);
        } else {
            tracing::error!("Task failed: {}: {}", task, error);
        }

        // No subscribers is not an error
        let _ = self.errors.send(ErrorEvent {
            error: Arc::new(error),
            task,
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[async_trait]
impl TaskRunner for CrawlRunner {
    async fn run(&self, task: Task) {
        match task {
            Task::Request(request) => self.run_request(request).await,
            Task::Download(download) => self.run_download(download).await,
        }
    }
}
