//! Bounded FIFO queue with suspending put/get.
//!
//! The queue is the backpressure primitive for the pipeline: `put` suspends
//! the producer while the queue is at capacity and `get` suspends the
//! consumer while it is empty. Suspension is permit-based (no sleep polling).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Returned by [`BoundedQueue::put_timeout`] when the deadline expires.
/// Carries the item back to the caller; the queue state is unchanged.
#[derive(Debug)]
pub struct TimedOut<T>(pub T);

/// Thread-safe FIFO queue with an optional capacity bound.
///
/// Capacity, once set, is never exceeded: producers that would overflow
/// suspend until a consumer makes space. Items are never dropped.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    /// One permit per enqueued item.
    ready: Semaphore,
    /// One permit per free slot. `None` for unbounded queues.
    space: Option<Semaphore>,
    capacity: Option<usize>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue bounded to `capacity` items. Capacity must be >= 1;
    /// use [`BoundedQueue::unbounded`] for no bound.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0. A zero-capacity queue could never accept
    /// an item; [`BoundedQueue::with_capacity`] treats 0 as unbounded.
    pub fn bounded(capacity: usize) -> Self {
        assert!(capacity >= 1, "bounded queue capacity must be >= 1");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Semaphore::new(0),
            space: Some(Semaphore::new(capacity)),
            capacity: Some(capacity),
        }
    }

    /// Create a queue with no capacity bound.
    pub fn unbounded() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Semaphore::new(0),
            space: None,
            capacity: None,
        }
    }

    /// Create a queue from a numeric capacity where 0 means unbounded.
    pub fn with_capacity(capacity: usize) -> Self {
        if capacity == 0 {
            Self::unbounded()
        } else {
            Self::bounded(capacity)
        }
    }

    /// The configured capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Enqueue `item` at the tail, suspending while the queue is at capacity.
    pub async fn put(&self, item: T) {
        if let Some(space) = &self.space {
            // The semaphore is never closed, so acquire cannot fail.
            space.acquire().await.unwrap().forget();
        }
        self.push(item);
    }

    /// Enqueue `item`, giving up after `timeout`. On expiry the item is
    /// handed back untouched and no queue state has changed.
    pub async fn put_timeout(&self, item: T, timeout: Duration) -> Result<(), TimedOut<T>> {
        if let Some(space) = &self.space {
            match tokio::time::timeout(timeout, space.acquire()).await {
                Ok(permit) => permit.unwrap().forget(),
                Err(_) => return Err(TimedOut(item)),
            }
        }
        self.push(item);
        Ok(())
    }

    /// Remove and return the head item, suspending while the queue is empty.
    pub async fn get(&self) -> T {
        self.ready.acquire().await.unwrap().forget();
        self.pop()
    }

    /// Remove and return the head item, giving up after `timeout`.
    /// Returns `None` on expiry; no queue state has changed.
    pub async fn get_timeout(&self, timeout: Duration) -> Option<T> {
        match tokio::time::timeout(timeout, self.ready.acquire()).await {
            Ok(permit) => {
                permit.unwrap().forget();
                Some(self.pop())
            }
            Err(_) => None,
        }
    }

    /// Current item count. Best-effort snapshot for observability only.
    pub fn size(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.ready.add_permits(1);
    }

    fn pop(&self) -> T {
        let item = {
            let mut items = self.items.lock().unwrap();
            // A ready permit was consumed, so an item must be present.
            items.pop_front().unwrap()
        };
        if let Some(space) = &self.space {
            space.add_permits(1);
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BoundedQueue::unbounded();
        for i in 0..5 {
            queue.put(i).await;
        }
        for i in 0..5 {
            assert_eq!(queue.get().await, i);
        }
    }

    #[tokio::test]
    async fn test_put_blocks_at_capacity() {
        let queue = Arc::new(BoundedQueue::bounded(1));
        queue.put(1u32).await;
        assert_eq!(queue.size(), 1);

        // Second put must suspend until the consumer below makes space.
        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(2).await })
        };

        tokio::task::yield_now().await;
        assert_eq!(queue.size(), 1);

        assert_eq!(queue.get().await, 1);
        producer.await.unwrap();
        assert_eq!(queue.get().await, 2);
    }

    #[tokio::test]
    async fn test_get_blocks_until_item_available() {
        let queue = Arc::new(BoundedQueue::<u32>::unbounded());

        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.put(42).await;
        assert_eq!(consumer.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_get_timeout_on_empty() {
        let queue = BoundedQueue::<u32>::unbounded();
        let got = queue.get_timeout(Duration::from_millis(10)).await;
        assert!(got.is_none());

        // The timed-out get must not have consumed anything.
        queue.put(7).await;
        assert_eq!(queue.get().await, 7);
    }

    #[tokio::test]
    async fn test_put_timeout_returns_item() {
        let queue = BoundedQueue::bounded(1);
        queue.put("a").await;

        let err = queue
            .put_timeout("b", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.0, "b");

        // Queue state is intact: the original item is still first out.
        assert_eq!(queue.get().await, "a");
    }

    #[test]
    #[should_panic(expected = "capacity must be >= 1")]
    fn test_bounded_zero_capacity_rejected() {
        let _ = BoundedQueue::<u8>::bounded(0);
    }

    #[test]
    fn test_capacity_accessor() {
        assert_eq!(BoundedQueue::<u8>::bounded(4).capacity(), Some(4));
        assert_eq!(BoundedQueue::<u8>::unbounded().capacity(), None);
        assert_eq!(BoundedQueue::<u8>::with_capacity(0).capacity(), None);
    }
}
