//! Response context handed to the extraction callback
//!
//! A [`ResponseContext`] bundles one completed fetch with the capabilities the
//! callback may use: document queries, and the task-injecting actions
//! (follow, retry, queue a download, download inline). Injection is gated on
//! the run being active; the inline download is not.

use crate::crawler::download::DownloadPipeline;
use crate::crawler::fetcher::FetchedResponse;
use crate::crawler::parser::Document;
use crate::crawler::queue::TaskQueue;
use crate::crawler::run_state::RunState;
use crate::crawler::stats::CrawlStats;
use crate::crawler::task::{merge_headers, remove_header, DownloadOptions, DownloadTask, RequestTask, Task};
use crate::HarvestError;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::StatusCode;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One successful fetch plus the actions available to the extraction callback
///
/// Cheap to clone; clones share the same response.
#[derive(Clone)]
pub struct ResponseContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    response: FetchedResponse,
    origin: RequestTask,
    queue: TaskQueue,
    state: RunState,
    stats: Arc<CrawlStats>,
    downloads: Arc<DownloadPipeline>,
}

impl ResponseContext {
    pub(crate) fn new(
        response: FetchedResponse,
        origin: RequestTask,
        queue: TaskQueue,
        state: RunState,
        stats: Arc<CrawlStats>,
        downloads: Arc<DownloadPipeline>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                response,
                origin,
                queue,
                state,
                stats,
                downloads,
            }),
        }
    }

    /// The raw fetch result
    pub fn response(&self) -> &FetchedResponse {
        &self.inner.response
    }

    /// The request task that produced this response
    pub fn request(&self) -> &RequestTask {
        &self.inner.origin
    }

    pub fn status(&self) -> StatusCode {
        self.inner.response.status
    }

    /// Final URL after redirects
    pub fn url(&self) -> &str {
        &self.inner.response.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.response.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.response.body
    }

    pub fn text(&self) -> String {
        self.inner.response.text()
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.response.elapsed
    }

    /// Parses the body as HTML
    ///
    /// The returned document is not `Send`; drop it before awaiting.
    pub fn document(&self) -> Document {
        Document::parse(&self.text(), self.url())
    }

    /// Enqueues a request for `request`, defaulting its Referer to the
    /// originating request's URL
    ///
    /// Accepts a bare URL or a full [`RequestTask`]. Returns false, leaving the
    /// queue untouched, when the run is no longer active or the URL is empty.
    pub fn follow(&self, request: impl Into<RequestTask>) -> bool {
        let mut request = request.into();
        if request.url.trim().is_empty() {
            return false;
        }
        if request.referer.is_none() {
            request.referer = Some(self.inner.origin.url.clone());
        }
        self.enqueue(Task::Request(request))
    }

    /// Enqueues an exact replay of the originating request
    ///
    /// The replay is a new, independent task: whatever the callback did for
    /// this response will happen again for the replayed one.
    pub fn retry(&self) -> bool {
        self.enqueue(Task::Request(self.inner.origin.clone()))
    }

    /// Enqueues a download of `url` into `filepath`
    ///
    /// Proxy and headers are inherited from this response's request config,
    /// minus `Accept`; `options` are layered on top.
    pub fn queue_download(
        &self,
        url: impl Into<String>,
        filepath: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> bool {
        let url = url.into();
        if url.trim().is_empty() {
            return false;
        }
        let task = self.download_task(url, filepath.into(), options);
        self.enqueue(Task::Download(task))
    }

    /// Downloads `url` into `filepath` before returning
    ///
    /// Bypasses the queue and the concurrency ceiling, and runs even once the
    /// run is stopped. Cancellation still aborts it.
    pub async fn download(
        &self,
        url: impl Into<String>,
        filepath: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Result<u64, HarvestError> {
        let task = self.download_task(url.into(), filepath.into(), options);
        self.inner.downloads.execute(&task).await
    }

    fn download_task(&self, url: String, filepath: PathBuf, options: DownloadOptions) -> DownloadTask {
        let inherited = &self.inner.response.request;

        let mut headers = inherited.headers.clone();
        remove_header(&mut headers, ACCEPT.as_str());
        merge_headers(&mut headers, &options.headers);

        DownloadTask::new(url, filepath).with_options(DownloadOptions {
            headers,
            proxy: options.proxy.or_else(|| inherited.proxy.clone()),
        })
    }

    fn enqueue(&self, task: Task) -> bool {
        if !self.inner.state.is_active() {
            tracing::debug!("Run inactive, dropping {}", task);
            return false;
        }
        tracing::trace!("Enqueueing {} from {}", task, self.inner.origin.url);
        self.inner.queue.push(task);
        self.inner.stats.record_injected();
        true
    }
}

impl std::fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseContext")
            .field("url", &self.inner.response.url)
            .field("status", &self.inner.response.status)
            .finish_non_exhaustive()
    }
}
