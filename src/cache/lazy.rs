use crate::error::Result;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::future::Future;

/// One-shot asynchronous value.
///
/// The first caller to await [`LazyFuture::value`] runs the producer;
/// concurrent and later callers observe the same outcome. A failed producer
/// stays failed; the enclosing [`VolatileMap`](super::VolatileMap) entry is
/// expected to be invalidated so a retry installs a fresh future.
#[derive(Clone)]
pub struct LazyFuture<T: Clone> {
    shared: Shared<BoxFuture<'static, Result<T>>>,
}

impl<T: Clone + Send + Sync + 'static> LazyFuture<T> {
    pub fn new<F>(producer: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            shared: producer.boxed().shared(),
        }
    }

    /// Awaits the producer outcome, running the producer if nobody has yet.
    pub async fn value(&self) -> Result<T> {
        self.shared.clone().await
    }

    /// The outcome, if the producer already completed.
    pub fn peek(&self) -> Option<Result<T>> {
        self.shared.peek().cloned()
    }
}
