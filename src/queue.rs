//! Bounded FIFO hand-off between pipeline stages.
//!
//! Each queue carries a three-state [`Signal`] published through a
//! [`tokio::sync::watch`] channel. The producer moves it from `Open` to
//! `Draining` when it will enqueue nothing more; the consumer moves it to
//! `Closed` once it has drained the last item. Signal changes and item changes
//! happen under the same lock, so "empty" and "producer finished" are never
//! observed out of order.
//!
//! A flush discards every queued item and starts a new *epoch*. Pushes and
//! closes tagged with an older epoch are rejected, which lets a superseded
//! producer wind down without polluting the rebuilt pipeline.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use strum::Display;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Signal {
    /// The producer may still enqueue items
    Open,
    /// The producer is finished; remaining items are being consumed
    Draining,
    /// Empty, and nothing more will arrive
    Closed,
}

/// A push or close issued under an epoch that a flush has since retired.
///
/// Carries the rejected item back to the caller.
#[derive(Debug)]
pub struct Stale<T>(pub T);

struct Inner<T> {
    items: VecDeque<T>,
    epoch: u64,
}

pub struct TransferQueue<T> {
    name: &'static str,
    capacity: usize,
    poll_interval: Duration,
    inner: Mutex<Inner<T>>,
    signal: watch::Sender<Signal>,
    item_ready: Notify,
    space_ready: Notify,
}

impl<T> TransferQueue<T> {
    pub fn new(name: &'static str, capacity: usize, poll_interval: Duration) -> Self {
        let (signal, _) = watch::channel(Signal::Open);

        Self {
            name,
            capacity: capacity.max(1),
            poll_interval,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                epoch: 0,
            }),
            signal,
            item_ready: Notify::new(),
            space_ready: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn signal(&self) -> Signal {
        *self.signal.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Signal> {
        self.signal.subscribe()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `item`, waiting for space while the queue is full.
    ///
    /// Fails with [`Stale`] if `epoch` was retired by a flush, either before
    /// the call or while it was waiting.
    pub async fn push(&self, item: T, epoch: u64) -> Result<(), Stale<T>> {
        loop {
            {
                let mut inner = self.lock();
                if inner.epoch != epoch {
                    return Err(Stale(item));
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(item);
                    self.item_ready.notify_one();
                    return Ok(());
                }
            }

            tracing::trace!(queue = self.name, "Queue full, waiting for space");
            let _ = tokio::time::timeout(self.poll_interval, self.space_ready.notified()).await;
        }
    }

    /// Takes the next item.
    ///
    /// Waits while the queue is empty and open, re-checking at least once per
    /// poll interval. Returns `None` once the producer has closed the queue and
    /// every item has been taken. Cancel-safe: an item is only removed when it
    /// is returned.
    pub async fn dequeue(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    self.space_ready.notify_one();
                    return Some(item);
                }

                match self.signal() {
                    Signal::Open => {}
                    Signal::Draining => {
                        self.signal.send_replace(Signal::Closed);
                        tracing::debug!(queue = self.name, "Queue drained");
                        return None;
                    }
                    Signal::Closed => return None,
                }
            }

            let _ = tokio::time::timeout(self.poll_interval, self.item_ready.notified()).await;
        }
    }

    /// Marks the producer of `epoch` as finished.
    ///
    /// Has no effect if a flush has retired `epoch` in the meantime.
    pub fn close(&self, epoch: u64) -> Result<(), Stale<()>> {
        let inner = self.lock();
        if inner.epoch != epoch {
            return Err(Stale(()));
        }

        let next = if inner.items.is_empty() {
            Signal::Closed
        } else {
            Signal::Draining
        };
        if self.signal() == Signal::Open {
            self.signal.send_replace(next);
        }
        drop(inner);

        self.item_ready.notify_one();
        Ok(())
    }

    /// Discards every queued item, starts a new epoch and reopens the queue.
    ///
    /// The discarded items are handed back; dropping them releases whatever
    /// they own.
    pub fn flush(&self) -> Vec<T> {
        let mut inner = self.lock();
        inner.epoch += 1;
        let discarded: Vec<T> = inner.items.drain(..).collect();
        self.signal.send_replace(Signal::Open);
        drop(inner);

        tracing::debug!(
            queue = self.name,
            discarded = discarded.len(),
            "Queue flushed"
        );

        // Wake producers blocked on a full queue so they notice the new epoch
        self.space_ready.notify_waiters();
        discarded
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn queue(capacity: usize) -> TransferQueue<i32> {
        TransferQueue::new("test", capacity, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let queue = queue(10);

        for i in 0..5 {
            queue.push(i, 0).await.unwrap();
        }
        queue.close(0).unwrap();

        let mut out = Vec::new();
        while let Some(i) = queue.dequeue().await {
            out.push(i);
        }
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.signal(), Signal::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_moves_through_draining() {
        let queue = queue(10);

        queue.push(1, 0).await.unwrap();
        queue.close(0).unwrap();
        assert_eq!(queue.signal(), Signal::Draining);

        assert_eq!(queue.dequeue().await, Some(1));
        assert_eq!(queue.signal(), Signal::Draining);
        assert_eq!(queue.dequeue().await, None);
        assert_eq!(queue.signal(), Signal::Closed);
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_waits_for_producer() {
        let queue = Arc::new(queue(10));

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(12)).await;
                queue.push(7, 0).await.unwrap();
                queue.close(0).unwrap();
            })
        };

        assert_eq!(queue.dequeue().await, Some(7));
        assert_eq!(queue.dequeue().await, None);
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(queue(1));
        queue.push(1, 0).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2, 0).await.is_ok() })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.dequeue().await, Some(1));
        assert!(producer.await.unwrap());
        assert_eq!(queue.dequeue().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_rejects_stale_producers() {
        let queue = queue(10);
        queue.push(1, 0).await.unwrap();
        queue.push(2, 0).await.unwrap();
        queue.close(0).unwrap();

        let discarded = queue.flush();
        assert_eq!(discarded, vec![1, 2]);
        assert_eq!(queue.epoch(), 1);
        assert_eq!(queue.signal(), Signal::Open);

        assert!(matches!(queue.push(3, 0).await, Err(Stale(3))));
        assert!(queue.close(0).is_err());
        assert_eq!(queue.signal(), Signal::Open);

        queue.push(4, 1).await.unwrap();
        queue.close(1).unwrap();
        assert_eq!(queue.dequeue().await, Some(4));
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_releases_blocked_producer() {
        let queue = Arc::new(queue(1));
        queue.push(1, 0).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(2, 0).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        queue.flush();

        assert!(matches!(producer.await.unwrap(), Err(Stale(2))));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribers_see_signal_changes() {
        let queue = queue(4);
        let mut rx = queue.subscribe();

        queue.close(0).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Signal::Closed);
    }
}
