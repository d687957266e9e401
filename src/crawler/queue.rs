//! FIFO task queue shared between the scheduler and running tasks

use crate::crawler::task::Task;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Thread-safe FIFO holder of pending tasks
///
/// Cloning yields another handle to the same queue. Every push wakes the
/// scheduler so work injected by in-flight tasks is picked up promptly.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    tasks: Mutex<VecDeque<Task>>,
    pushed: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the tail
    pub fn push(&self, task: Task) {
        self.lock().push_back(task);
        self.inner.pushed.notify_one();
    }

    /// Appends several tasks, preserving their order
    pub fn extend<I>(&self, tasks: I)
    where
        I: IntoIterator<Item = Task>,
    {
        self.lock().extend(tasks);
        self.inner.pushed.notify_one();
    }

    /// Removes and returns the head, or `None` when empty
    pub fn pop(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Resolves once a push happened after the last wake-up
    pub(crate) async fn pushed(&self) {
        self.inner.pushed.notified().await;
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        // A poisoned queue still holds consistent data: every mutation is a
        // single VecDeque call.
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
