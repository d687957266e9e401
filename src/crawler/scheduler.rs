//! Scheduler driving a crawl run to quiescence
//!
//! This module handles:
//! - Pulling tasks from the FIFO task queue in dispatch order
//! - Global concurrency limiting (a ceiling on in-flight tasks)
//! - A global interval floor between consecutive dispatch starts
//! - Quiescence detection: the queue is empty and nothing is in flight
//! - Halting new dispatches once the run is stopped or cancelled

use crate::crawler::queue::TaskQueue;
use crate::crawler::run_state::RunState;
use crate::crawler::stats::CrawlStats;
use crate::crawler::task::Task;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

/// Executes a single dispatched task to completion
///
/// Implementations own their failure handling; by the time `run` returns the
/// task has either succeeded or been reported.
#[async_trait]
pub trait TaskRunner: Send + Sync + 'static {
    async fn run(&self, task: Task);
}

/// Scheduler owns dispatch of one crawl run
///
/// The scheduler coordinates:
/// - The concurrency ceiling (max simultaneously running tasks)
/// - The dispatch interval (minimum time between two dispatch starts,
///   applied regardless of concurrency headroom)
/// - The stop condition (queue empty and nothing in flight; work pushed by a
///   still-running task resumes the crawl)
pub struct Scheduler {
    queue: TaskQueue,
    state: RunState,
    concurrency: usize,
    interval: Duration,
    in_flight: AtomicUsize,
    stats: Arc<CrawlStats>,
}

impl Scheduler {
    /// Creates a new scheduler
    ///
    /// A `concurrency` of zero is treated as one.
    pub fn new(
        queue: TaskQueue,
        state: RunState,
        concurrency: usize,
        interval: Duration,
        stats: Arc<CrawlStats>,
    ) -> Self {
        Self {
            queue,
            state,
            concurrency: concurrency.max(1),
            interval,
            in_flight: AtomicUsize::new(0),
            stats,
        }
    }

    /// Number of tasks currently running
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Runs until quiescence, stop, or cancellation
    ///
    /// Once the run is no longer active no further task is dispatched; tasks
    /// already in flight are awaited before returning. Queued tasks are left
    /// in the queue.
    pub async fn run<R: TaskRunner>(&self, runner: Arc<R>) {
        let mut running: JoinSet<()> = JoinSet::new();
        let mut last_dispatch: Option<Instant> = None;

        loop {
            if !self.state.is_active() {
                tracing::debug!(
                    "Run no longer active ({:?}), {} tasks left queued",
                    self.state.phase(),
                    self.queue.len()
                );
                break;
            }

            let has_headroom = running.len() < self.concurrency;

            if has_headroom && !self.queue.is_empty() {
                if let Some(wait) = self.interval_remaining(last_dispatch) {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.state.changed() => {}
                        _ = self.state.token().cancelled() => {}
                        Some(result) = running.join_next(), if !running.is_empty() => {
                            self.reap(result);
                        }
                    }
                    continue;
                }

                if let Some(task) = self.queue.pop() {
                    last_dispatch = Some(Instant::now());
                    self.dispatch(&mut running, &runner, task);
                }
                continue;
            }

            if running.is_empty() && self.queue.is_empty() {
                tracing::debug!("Queue empty and nothing in flight, crawl complete");
                break;
            }

            tokio::select! {
                Some(result) = running.join_next(), if !running.is_empty() => {
                    self.reap(result);
                }
                _ = self.queue.pushed() => {}
                _ = self.state.changed() => {}
                _ = self.state.token().cancelled() => {}
            }
        }

        while let Some(result) = running.join_next().await {
            self.reap(result);
        }
    }

    /// Time left before the interval floor allows another dispatch
    fn interval_remaining(&self, last_dispatch: Option<Instant>) -> Option<Duration> {
        let last = last_dispatch?;
        let ready_at = last + self.interval;
        let now = Instant::now();
        (ready_at > now).then(|| ready_at - now)
    }

    fn dispatch<R: TaskRunner>(&self, running: &mut JoinSet<()>, runner: &Arc<R>, task: Task) {
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.record_dispatch(in_flight);

        tracing::debug!(
            "Dispatching {} ({} in flight, {} queued)",
            task,
            in_flight,
            self.queue.len()
        );

        let runner = Arc::clone(runner);
        running.spawn(async move { runner.run(task).await });
    }

    fn reap(&self, result: Result<(), JoinError>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = result {
            tracing::error!("Task execution aborted: {}", e);
        }
    }
}
