//! Closable channel: a bounded queue with a sentinel-based close protocol
//! and completion tracking.
//!
//! Each call to [`ClosableChannel::close`] enqueues exactly one sentinel,
//! and each sentinel terminates exactly one consumer loop ([`recv`] returns
//! `None`). A pool of N workers sharing one input channel therefore needs N
//! sentinels; the pipeline driver uses [`close_workers`] for that. Sentinels
//! are never forwarded downstream.
//!
//! Completion tracking mirrors a task queue: every `put` (and every
//! sentinel) raises a pending count, the consumer acknowledges a normal item
//! with [`task_done`] once it has been fully handed off, and [`join`]
//! suspends until the count reaches zero. Sentinels are acknowledged
//! internally when consumed.
//!
//! [`recv`]: ClosableChannel::recv
//! [`close_workers`]: ClosableChannel::close_workers
//! [`task_done`]: ClosableChannel::task_done
//! [`join`]: ClosableChannel::join

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{PipelineError, Result};
use crate::queue::BoundedQueue;

enum Envelope<T> {
    Item(T),
    Sentinel,
}

/// An ordered, bounded mailbox between two pipeline stages.
pub struct ClosableChannel<T> {
    queue: BoundedQueue<Envelope<T>>,
    closed: AtomicBool,
    pending: Mutex<u64>,
    drained: Notify,
}

impl<T> ClosableChannel<T> {
    /// Create a channel bounded to `capacity` envelopes (capacity >= 1).
    pub fn bounded(capacity: usize) -> Self {
        Self::from_queue(BoundedQueue::bounded(capacity))
    }

    /// Create a channel with no capacity bound.
    pub fn unbounded() -> Self {
        Self::from_queue(BoundedQueue::unbounded())
    }

    /// Create a channel from a numeric capacity where 0 means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::from_queue(BoundedQueue::with_capacity(capacity))
    }

    fn from_queue(queue: BoundedQueue<Envelope<T>>) -> Self {
        Self {
            queue,
            closed: AtomicBool::new(false),
            pending: Mutex::new(0),
            drained: Notify::new(),
        }
    }

    /// Enqueue an item, suspending under backpressure.
    ///
    /// Fails with [`PipelineError::ChannelClosed`] once `close` has been
    /// called; items enqueued before the close remain retrievable.
    pub async fn put(&self, item: T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PipelineError::ChannelClosed);
        }
        self.track_put();
        self.queue.put(Envelope::Item(item)).await;
        Ok(())
    }

    /// Enqueue one sentinel, subject to normal backpressure. Each sentinel
    /// ends exactly one consumer's loop.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.track_put();
        self.queue.put(Envelope::Sentinel).await;
    }

    /// Enqueue one sentinel per expected consumer.
    pub async fn close_workers(&self, workers: usize) {
        for _ in 0..workers {
            self.close().await;
        }
    }

    /// Receive the next item in FIFO order, suspending while the channel is
    /// empty. Returns `None` exactly when this consumer's sentinel is
    /// consumed; the consumer's loop must not call `recv` again after that.
    pub async fn recv(&self) -> Option<T> {
        match self.queue.get().await {
            Envelope::Item(item) => Some(item),
            Envelope::Sentinel => {
                self.task_done();
                None
            }
        }
    }

    /// Receive with a deadline. Returns `Err(Timeout)` on expiry without
    /// consuming anything.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        match self.queue.get_timeout(timeout).await {
            Some(Envelope::Item(item)) => Ok(Some(item)),
            Some(Envelope::Sentinel) => {
                self.task_done();
                Ok(None)
            }
            None => Err(PipelineError::Timeout(timeout)),
        }
    }

    /// Acknowledge that a previously received item has been fully processed
    /// and handed off downstream. Every `recv` of a normal item must be
    /// matched by exactly one `task_done`.
    pub fn task_done(&self) {
        let mut pending = self.pending.lock().unwrap();
        debug_assert!(*pending > 0, "task_done without a matching put");
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Suspend until every envelope enqueued so far has been acknowledged.
    pub async fn join(&self) {
        loop {
            let notified = self.drained.notified();
            if *self.pending.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Whether `close` has been called at least once.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current envelope count. Best-effort snapshot for observability only.
    pub fn len(&self) -> usize {
        self.queue.size()
    }

    /// Whether the channel currently holds no envelopes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn track_put(&self) {
        *self.pending.lock().unwrap() += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_items_survive_close_until_drained() {
        let channel = ClosableChannel::unbounded();
        for i in 0..3 {
            channel.put(i).await.unwrap();
        }
        channel.close().await;

        // All three items come out before closure is observed.
        for i in 0..3 {
            assert_eq!(channel.recv().await, Some(i));
            channel.task_done();
        }
        assert_eq!(channel.recv().await, None);
    }

    #[tokio::test]
    async fn test_put_after_close_fails() {
        let channel = ClosableChannel::unbounded();
        channel.close().await;
        let err = channel.put(1).await.unwrap_err();
        assert!(matches!(err, PipelineError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_one_sentinel_per_consumer() {
        let channel = Arc::new(ClosableChannel::<u32>::unbounded());
        channel.close_workers(2).await;

        // Two consumer loops, each terminated by its own sentinel.
        assert_eq!(channel.recv().await, None);
        assert_eq!(channel.recv().await, None);
        assert_eq!(channel.len(), 0);
    }

    #[tokio::test]
    async fn test_join_waits_for_acknowledgment() {
        let channel = Arc::new(ClosableChannel::unbounded());
        channel.put(1u32).await.unwrap();
        channel.close().await;

        let consumer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                while let Some(_item) = channel.recv().await {
                    tokio::task::yield_now().await;
                    channel.task_done();
                }
            })
        };

        channel.join().await;
        assert_eq!(channel.len(), 0);
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_returns_immediately_when_never_used() {
        let channel = ClosableChannel::<u32>::unbounded();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_recv_timeout_on_empty() {
        let channel = ClosableChannel::<u32>::unbounded();
        let err = channel
            .recv_timeout(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_sentinel_subject_to_backpressure() {
        let channel = Arc::new(ClosableChannel::bounded(1));
        channel.put(1u32).await.unwrap();

        // close() must suspend until the item is consumed.
        let closer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.close().await })
        };

        tokio::task::yield_now().await;
        assert_eq!(channel.len(), 1);

        assert_eq!(channel.recv().await, Some(1));
        channel.task_done();
        closer.await.unwrap();
        assert_eq!(channel.recv().await, None);
    }
}
