//! Cancellation utilities
//!
//! First-class cancellation handles for calls and streams. The adaptive
//! timeout watchdog cancels through the same handle as the caller, so the
//! two are indistinguishable downstream.

use tokio_util::sync::CancellationToken;

/// A handle that can be used to request cancellation.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request cancellation. Wrapped streams and in-flight requests
    /// observing this handle stop as soon as possible; dropping a cancelled
    /// stream closes the underlying HTTP connection.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A future that resolves when cancellation is requested.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

/// Wrap an event stream so it ends promptly once `handle` is cancelled.
/// No terminal event is emitted on cancellation; the caller already knows.
pub fn cancellable_stream(
    stream: crate::stream::EventStream,
    handle: CancelHandle,
) -> crate::stream::EventStream {
    let mut inner = stream;
    let s = async_stream::stream! {
        use futures::StreamExt;
        loop {
            tokio::select! {
                _ = handle.cancelled() => break,
                item = inner.next() => {
                    let Some(item) = item else { break };
                    yield item;
                }
            }
        }
    };
    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn cancel_wakes_pending_next_immediately() {
        let pending: crate::stream::EventStream = Box::pin(futures_util::stream::pending());
        let handle = CancelHandle::new();
        let mut s = cancellable_stream(pending, handle.clone());

        let waiter = tokio::spawn(async move { s.next().await });
        tokio::task::yield_now().await;

        handle.cancel();

        let out = tokio::time::timeout(std::time::Duration::from_millis(200), waiter)
            .await
            .expect("cancel should wake the waiting task")
            .expect("task ok");

        assert!(out.is_none());
    }
}
