//! First-party cancellation token.
//!
//! The teacher crate has no `tokio-util` dependency, so cancellation is
//! expressed with the same primitives the teacher already reaches for
//! elsewhere (an `AtomicBool` flag plus a `tokio::sync` wakeup), rather than
//! pulling in `CancellationToken` from a new crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A cooperative cancellation signal shared across clones.
///
/// Every public operation in the orchestrator, queue, and worker core
/// accepts one of these as an explicit parameter, per the concurrency
/// model's "no thread-local context" rule.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A token that is never cancelled, for call sites with no deadline.
    pub fn none() -> Self {
        Self::new()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`CancelToken::cancel`] is called. Intended for use in
    /// `tokio::select!` alongside the operation being cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
