//! Run-wide cancellation handle 
//!
//! A single `CancelHandle` is threaded from the Scheduler down through
//! `TableRunner`, `Extractor`, and `Loader`. It is checked between
//! batches and during retry/rate-limit sleeps, never mid-batch — the
//! spec's "next safe boundary" guarantee.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled; otherwise resolves the
    /// moment `cancel` is called. Intended for use inside `tokio::select!`
    /// alongside a sleep or an I/O future.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed_by_waiters() {
        let handle = CancelHandle::new();
        assert!(!handle.is_cancelled());

        let waiter = handle.clone();
        let task = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        handle.cancel();
        task.await.unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(50), handle.cancelled())
            .await
            .expect("should resolve immediately");
    }
}
