//! Download pipeline
//!
//! Streams a remote resource into a local file under the shared timeout and
//! cancellation token, with the same bounded retry as the request pipeline.
//! The source (network) and destination (file) halves of a transfer run
//! concurrently; the first error seen on either side is the one reported.

use crate::crawler::fetcher::{to_header_map, ClientPool};
use crate::crawler::retry::{guarded, RetryPolicy};
use crate::crawler::task::DownloadTask;
use crate::HarvestError;
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Chunks buffered between the source and destination halves
const PIPE_BUFFER: usize = 16;

/// Which half of a transfer failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSide {
    Source,
    Destination,
}

impl fmt::Display for StreamSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamSide::Source => write!(f, "source"),
            StreamSide::Destination => write!(f, "destination"),
        }
    }
}

/// Keeps the first failure of a transfer and drops the rest
#[derive(Debug, Default)]
struct FirstError {
    slot: Mutex<Option<(StreamSide, String)>>,
}

impl FirstError {
    fn record(&self, side: StreamSide, message: String) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            None => *slot = Some((side, message)),
            Some((first, _)) => {
                tracing::debug!("Suppressing {} error after {} error: {}", side, first, message);
            }
        }
    }

    fn take(&self) -> Option<(StreamSide, String)> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Pipes `source` into `sink`, returning the number of bytes written
///
/// Reading and writing proceed concurrently. Whichever side fails first
/// determines the returned [`HarvestError::Stream`]; a later failure on the
/// other side is logged and ignored.
pub async fn pipe_stream<S, B, E, W>(url: &str, source: S, sink: &mut W) -> Result<u64, HarvestError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: fmt::Display,
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel::<B>(PIPE_BUFFER);
    let errors = FirstError::default();
    let first_error = &errors;

    let read = async move {
        let mut source = std::pin::pin!(source);
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    // Destination half is gone; its error is already recorded
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    first_error.record(StreamSide::Source, e.to_string());
                    break;
                }
            }
        }
    };

    let write = async move {
        let mut written = 0u64;
        while let Some(chunk) = rx.recv().await {
            let bytes = chunk.as_ref();
            if let Err(e) = sink.write_all(bytes).await {
                first_error.record(StreamSide::Destination, e.to_string());
                return written;
            }
            written += bytes.len() as u64;
        }
        if let Err(e) = sink.flush().await {
            first_error.record(StreamSide::Destination, e.to_string());
        }
        written
    };

    let ((), written) = tokio::join!(read, write);

    match errors.take() {
        Some((side, message)) => Err(HarvestError::Stream {
            url: url.to_string(),
            side,
            message,
        }),
        None => Ok(written),
    }
}

/// Executes download tasks
pub struct DownloadPipeline {
    clients: Arc<ClientPool>,
    timeout: Duration,
    retry: RetryPolicy,
    token: CancellationToken,
}

impl DownloadPipeline {
    pub fn new(
        clients: Arc<ClientPool>,
        timeout: Duration,
        retry: RetryPolicy,
        token: CancellationToken,
    ) -> Self {
        Self {
            clients,
            timeout,
            retry,
            token,
        }
    }

    /// Downloads `task` to its destination, returning the bytes written
    pub async fn execute(&self, task: &DownloadTask) -> Result<u64, HarvestError> {
        let written = self
            .retry
            .run(&self.token, &task.url, |attempt| self.attempt(task, attempt))
            .await?;

        tracing::debug!(
            "Downloaded {} ({} bytes) to {}",
            task.url,
            written,
            task.filepath.display()
        );
        Ok(written)
    }

    async fn attempt(&self, task: &DownloadTask, attempt: u32) -> Result<u64, HarvestError> {
        if let Some(parent) = task.filepath.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        tracing::debug!("Download attempt {} for {}", attempt, task.url);
        let client = self.clients.client_for(task.options.proxy.as_deref())?;

        let mut created = false;
        let result = guarded(
            &self.token,
            self.timeout,
            &task.url,
            transfer(client, task, &mut created),
        )
        .await;

        // A failed transfer never leaves a truncated file behind
        if result.is_err() && created {
            discard_partial(task).await;
        }
        result
    }
}

async fn discard_partial(task: &DownloadTask) {
    match tokio::fs::remove_file(&task.filepath).await {
        Ok(()) => tracing::debug!("Removed partial download {}", task.filepath.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(
            "Failed to remove partial download {}: {}",
            task.filepath.display(),
            e
        ),
    }
}

async fn transfer(
    client: Client,
    task: &DownloadTask,
    created: &mut bool,
) -> Result<u64, HarvestError> {
    let response = client
        .get(&task.url)
        .headers(to_header_map(&task.options.headers)?)
        .send()
        .await
        .map_err(|source| HarvestError::Http {
            url: task.url.clone(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(HarvestError::Status {
            url: task.url.clone(),
            status: status.as_u16(),
        });
    }

    let mut file = tokio::fs::File::create(&task.filepath).await?;
    *created = true;
    pipe_stream(&task.url, response.bytes_stream(), &mut file).await
}
