//! Resolve-once completion sources and their shareable read side.
//!
//! Cross-boundary replies are modeled as two separate constructs:
//! - [`CompletionSource`] settles exactly once, by value, so double
//!   resolution is unrepresentable;
//! - [`SharedOutcome`] is the clonable read-only future it produces; every
//!   clone observes the single settled value.
//!
//! Dropping a source without settling it surfaces to all waiters as
//! [`FetchError::LaneClosed`].

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::oneshot;

use crate::error::{FetchError, FetchResult};

/// Write side of a pending outcome. Settling consumes it.
pub(crate) struct CompletionSource<T> {
    tx: oneshot::Sender<FetchResult<T>>,
}

impl<T> CompletionSource<T> {
    pub(crate) fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub(crate) fn reject(self, err: FetchError) {
        let _ = self.tx.send(Err(err));
    }

    pub(crate) fn settle(self, res: FetchResult<T>) {
        let _ = self.tx.send(res);
    }
}

/// Read side of a pending outcome. Clonable; all clones observe the same
/// settled value (or the same rejection).
pub(crate) struct SharedOutcome<T: Clone> {
    inner: Shared<BoxFuture<'static, FetchResult<T>>>,
}

impl<T: Clone> Clone for SharedOutcome<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> SharedOutcome<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Eagerly run `fut` on the runtime; the returned outcome settles with
    /// its result even if every waiter is dropped.
    pub(crate) fn spawn<F>(fut: F) -> Self
    where
        F: std::future::Future<Output = FetchResult<T>> + Send + 'static,
    {
        let (source, outcome) = completion();
        tokio::spawn(async move {
            source.settle(fut.await);
        });
        outcome
    }

    pub(crate) async fn wait(&self) -> FetchResult<T> {
        self.inner.clone().await
    }
}

/// Create a linked source/outcome pair.
pub(crate) fn completion<T>() -> (CompletionSource<T>, SharedOutcome<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = oneshot::channel();
    let fut = async move { rx.await.unwrap_or(Err(FetchError::LaneClosed)) }.boxed();
    (
        CompletionSource { tx },
        SharedOutcome {
            inner: fut.shared(),
        },
    )
}
