//! Single-assignment completion settled by code other than its creator.

use std::{
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::Notify;

/// Reason attached to a rejected completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("completion rejected: {0}")]
pub struct CompletionError(pub String);

struct Inner<T, E> {
    slot: Mutex<Option<Result<T, E>>>,
    notify: Notify,
}

/// A future-like value that is fulfilled or rejected exactly once.
///
/// Clones share the same slot, so an event handler can hold one clone and
/// settle it while any number of tasks wait on the others. Only the first
/// `fulfill`/`reject` takes effect.
pub struct DeferredCompletion<T, E = CompletionError> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for DeferredCompletion<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone, E: Clone> Default for DeferredCompletion<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, E: Clone> DeferredCompletion<T, E> {
    /// Create an unsettled completion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Fulfill with `value`. Returns false if already settled.
    pub fn fulfill(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject with `error`. Returns false if already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Settle with a result. Returns false if already settled.
    pub fn settle(&self, result: Result<T, E>) -> bool {
        {
            let mut slot = self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// Whether the completion has been settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.peek().is_some()
    }

    /// The settled result, without waiting.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, E>> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until settled and return the result.
    pub async fn wait(&self) -> Result<T, E> {
        loop {
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.peek() {
                return result;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_waiter_released_by_other_task() {
        let deferred = DeferredCompletion::<u32>::new();
        let handler = deferred.clone();

        let waiter = tokio::spawn({
            let deferred = deferred.clone();
            async move { deferred.wait().await }
        });
        tokio::task::yield_now().await;

        assert!(handler.fulfill(7));
        assert_eq!(waiter.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_only_first_settle_wins() {
        let deferred = DeferredCompletion::<u32>::new();
        assert!(deferred.fulfill(1));
        assert!(!deferred.fulfill(2));
        assert!(!deferred.reject(CompletionError("late".into())));
        assert_eq!(deferred.wait().await, Ok(1));
    }

    #[tokio::test]
    async fn test_reject_reaches_every_waiter() {
        let deferred = DeferredCompletion::<()>::new();
        let a = tokio::spawn({
            let d = deferred.clone();
            async move { d.wait().await }
        });
        let b = tokio::spawn({
            let d = deferred.clone();
            async move { d.wait().await }
        });
        tokio::task::yield_now().await;

        deferred.reject(CompletionError("gone".into()));
        assert_eq!(a.await.unwrap(), Err(CompletionError("gone".into())));
        assert_eq!(b.await.unwrap(), Err(CompletionError("gone".into())));
    }

    #[test]
    fn test_wait_woken_on_settle() {
        let deferred = DeferredCompletion::<u32>::new();
        let mut wait = tokio_test::task::spawn(deferred.wait());
        tokio_test::assert_pending!(wait.poll());

        deferred.fulfill(3);
        assert!(wait.is_woken());
        assert_eq!(tokio_test::assert_ready!(wait.poll()), Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_stays_pending() {
        let deferred = DeferredCompletion::<()>::new();
        let waited = tokio::time::timeout(Duration::from_secs(5), deferred.wait()).await;
        assert!(waited.is_err());
        assert!(!deferred.is_settled());
    }
}
