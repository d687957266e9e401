//! Run lifecycle: active, stopped, or cancelled

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Phase of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    /// Accepting injected work and dispatching
    Active,

    /// No new enqueues or dispatches; in-flight tasks finish normally
    Stopped,

    /// Terminal: in-flight network operations abort
    Cancelled,
}

impl RunPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunPhase::Active,
            1 => RunPhase::Stopped,
            _ => RunPhase::Cancelled,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            RunPhase::Active => 0,
            RunPhase::Stopped => 1,
            RunPhase::Cancelled => 2,
        }
    }
}

/// Shared run state consulted by the scheduler and every injection call
///
/// Transitions only move forward: Active -> Stopped -> Cancelled, or
/// Active -> Cancelled. Cancellation also trips the shared token.
#[derive(Debug, Clone)]
pub struct RunState {
    phase: Arc<AtomicU8>,
    changed: Arc<Notify>,
    token: CancellationToken,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(AtomicU8::new(RunPhase::Active.as_u8())),
            changed: Arc::new(Notify::new()),
            token: CancellationToken::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.phase() == RunPhase::Active
    }

    pub fn is_cancelled(&self) -> bool {
        self.phase() == RunPhase::Cancelled
    }

    /// Stops accepting new work; a no-op once stopped or cancelled
    pub fn stop(&self) {
        let stopped = self
            .phase
            .compare_exchange(
                RunPhase::Active.as_u8(),
                RunPhase::Stopped.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if stopped {
            self.changed.notify_waiters();
        }
    }

    /// Cancels the run and trips the shared token
    pub fn cancel(&self) {
        self.phase
            .store(RunPhase::Cancelled.as_u8(), Ordering::SeqCst);
        self.token.cancel();
        self.changed.notify_waiters();
    }

    /// Resolves on the next stop or cancel transition
    pub(crate) async fn changed(&self) {
        self.changed.notified().await;
    }

    /// The token every in-flight network operation races against
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
