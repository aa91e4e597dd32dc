//! Shutdown coordination.
//!
//! A stop flag, a one-shot cancellation broadcast and a counting barrier.
//! Every loop the client spawns holds a [`LoopGuard`]; `wait_all` returns once
//! every guard has been dropped. `finish` marks the connection released, which
//! `finished` waits for.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Default)]
pub struct Shutdown {
    stopped: AtomicBool,
    token: CancellationToken,
    loops: TaskTracker,
    done: CancellationToken,
}

/// Registration of one running loop. Dropping it signals the loop is done.
#[derive(Debug)]
pub struct LoopGuard {
    _token: TaskTrackerToken,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Set the stop flag. Returns `true` only for the caller that set it.
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    /// Register a loop with the barrier.
    pub fn register(&self) -> LoopGuard {
        LoopGuard {
            _token: self.loops.token(),
        }
    }

    /// Wake every loop waiting on cancellation. Safe to call more than once.
    pub fn broadcast(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Resolves once cancellation has been broadcast.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Wait until every registered loop has finished.
    pub async fn wait_all(&self) {
        self.loops.close();
        self.loops.wait().await;
    }

    /// Mark shutdown complete, releasing every `finished` waiter.
    pub fn finish(&self) {
        self.done.cancel();
    }

    /// Resolves once [`Shutdown::finish`] has been called.
    pub async fn finished(&self) {
        self.done.cancelled().await
    }

    /// Number of loops still registered.
    pub fn active(&self) -> usize {
        self.loops.len()
    }
}
