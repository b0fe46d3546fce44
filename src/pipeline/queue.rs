//! Bounded FIFO work queue between the ingest listener and the drain worker.
//!
//! `work_queue` returns a cloneable sender and a single receiver. The
//! receiver cannot be cloned, so at most one drain loop can ever consume the
//! queue. When a push finds the queue at capacity the configured
//! [`OverflowPolicy`] decides: evict the oldest item, or park the producer
//! until the consumer frees a slot.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::config::OverflowPolicy;
use crate::types::TelemetryMessage;

/// One accepted telemetry report awaiting persistence.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub message: TelemetryMessage,
    pub received_at: DateTime<Utc>,
}

/// Result of a push.
#[derive(Debug)]
pub struct PushOutcome<T> {
    /// Queue length right after the push
    pub queue_len: usize,
    /// Item evicted to make room (`DropOldest` only)
    pub evicted: Option<T>,
}

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    item_ready: Notify,
    space_freed: Notify,
    senders: AtomicUsize,
    closed: AtomicBool,
}

impl<T> Shared<T> {
    // Critical sections never panic, so a poisoned lock still holds a valid deque.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bounded queue. A zero capacity is treated as one.
pub fn work_queue<T>(capacity: usize, policy: OverflowPolicy) -> (WorkQueueSender<T>, WorkQueueReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        items: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
        capacity,
        policy,
        item_ready: Notify::new(),
        space_freed: Notify::new(),
        senders: AtomicUsize::new(1),
        closed: AtomicBool::new(false),
    });
    (
        WorkQueueSender {
            shared: Arc::clone(&shared),
        },
        WorkQueueReceiver { shared },
    )
}

/// Producer half
pub struct WorkQueueSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> WorkQueueSender<T> {
    /// Append to the back of the queue.
    ///
    /// Only awaits under `BlockProducer` with a full queue.
    pub async fn push(&self, item: T) -> PushOutcome<T> {
        match self.shared.policy {
            OverflowPolicy::DropOldest => {
                let outcome = {
                    let mut items = self.shared.lock();
                    let evicted = if items.len() >= self.shared.capacity {
                        items.pop_front()
                    } else {
                        None
                    };
                    items.push_back(item);
                    PushOutcome {
                        queue_len: items.len(),
                        evicted,
                    }
                };
                self.shared.item_ready.notify_one();
                outcome
            }
            OverflowPolicy::BlockProducer => loop {
                let space = self.shared.space_freed.notified();
                {
                    let mut items = self.shared.lock();
                    if items.len() < self.shared.capacity {
                        items.push_back(item);
                        let queue_len = items.len();
                        drop(items);
                        self.shared.item_ready.notify_one();
                        return PushOutcome {
                            queue_len,
                            evicted: None,
                        };
                    }
                }
                space.await;
            },
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl<T> Clone for WorkQueueSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for WorkQueueSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.closed.store(true, Ordering::Release);
            self.shared.item_ready.notify_one();
        }
    }
}

/// Consumer half. Deliberately not `Clone`.
pub struct WorkQueueReceiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> WorkQueueReceiver<T> {
    /// Take the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` once every sender is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let shared = Arc::clone(&self.shared);
        loop {
            let ready = shared.item_ready.notified();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            if shared.closed.load(Ordering::Acquire) {
                // A final push may have landed before the close flag.
                return self.try_recv();
            }
            ready.await;
        }
    }

    /// Take the oldest item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.shared.lock().pop_front();
        if item.is_some() {
            self.shared.space_freed.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = work_queue(8, OverflowPolicy::DropOldest);
        for i in 0..5 {
            let outcome = tx.push(i).await;
            assert_eq!(outcome.queue_len, i + 1);
            assert!(outcome.evicted.is_none());
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_front() {
        let (tx, mut rx) = work_queue(3, OverflowPolicy::DropOldest);
        tx.push(1).await;
        tx.push(2).await;
        tx.push(3).await;

        let outcome = tx.push(4).await;
        assert_eq!(outcome.evicted, Some(1));
        assert_eq!(outcome.queue_len, 3);

        assert_eq!(rx.try_recv(), Some(2));
        assert_eq!(rx.try_recv(), Some(3));
        assert_eq!(rx.try_recv(), Some(4));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_block_producer_waits_for_space() {
        let (tx, mut rx) = work_queue(1, OverflowPolicy::BlockProducer);
        tx.push(1).await;

        let mut push = task::spawn(tx.push(2));
        assert_pending!(push.poll());
        assert_eq!(rx.len(), 1);

        assert_eq!(rx.try_recv(), Some(1));
        assert!(push.is_woken());
        let outcome = assert_ready!(push.poll());
        assert_eq!(outcome.queue_len, 1);
        assert!(outcome.evicted.is_none());
        assert_eq!(rx.try_recv(), Some(2));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (tx, mut rx) = work_queue(4, OverflowPolicy::DropOldest);
        let consumer = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.push("hello").await;

        assert_eq!(consumer.await.unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn test_closes_after_last_sender_drops() {
        let (tx, mut rx) = work_queue(4, OverflowPolicy::DropOldest);
        let tx2 = tx.clone();
        tx.push(7).await;
        drop(tx);
        drop(tx2);

        assert_eq!(rx.recv().await, Some(7));
        assert_eq!(rx.recv().await, None);
    }
}
