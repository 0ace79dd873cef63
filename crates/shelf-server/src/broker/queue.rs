//! Bounded per-session delivery queue.
//!
//! The broker worker pushes into the queue without ever waiting; the session
//! pump is the single reader. When the queue is full the configured
//! [`OverflowPolicy`] decides what is lost.

use std::collections::VecDeque;
use std::sync::Arc;

use clap::ValueEnum;
use parking_lot::Mutex;
use tokio::sync::Notify;

use shelf_proto::Product;

/// What to do when a session's queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OverflowPolicy {
    /// Discard the oldest queued update to make room for the new one.
    #[default]
    DropOldest,
    /// Discard the incoming update.
    DropNewest,
    /// Tear the session down.
    Disconnect,
}

/// Outcome of offering an update to a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Queued.
    Delivered,
    /// Queued after evicting the oldest pending update.
    DisplacedOldest,
    /// Not queued; the queue was full.
    Rejected,
    /// Not queued; the queue is full and the session must be disconnected.
    Overflow,
    /// Not queued; the reader is gone.
    Closed,
}

impl Offer {
    /// Whether the offered update was queued.
    pub fn accepted(self) -> bool {
        matches!(self, Offer::Delivered | Offer::DisplacedOldest)
    }

    /// Whether an update was lost, either the offered one or an evicted one.
    pub fn lost_update(self) -> bool {
        !matches!(self, Offer::Delivered | Offer::Closed)
    }
}

struct Inner {
    items: VecDeque<Arc<Product>>,
    closed: bool,
}

/// Bounded hand-off queue between the broker worker and one session.
pub struct DeliveryQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    policy: OverflowPolicy,
    ready: Notify,
    shutdown: Notify,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` pending updates.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            capacity,
            policy,
            ready: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    /// Offer an update without blocking.
    pub fn offer(&self, product: Arc<Product>) -> Offer {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Offer::Closed;
            }

            if inner.items.len() < self.capacity {
                inner.items.push_back(product);
                Offer::Delivered
            } else {
                match self.policy {
                    OverflowPolicy::DropNewest => return Offer::Rejected,
                    OverflowPolicy::Disconnect => return Offer::Overflow,
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(product);
                        Offer::DisplacedOldest
                    }
                }
            }
        };

        self.ready.notify_one();
        outcome
    }

    /// Wait for the next update.
    ///
    /// Pending updates are still handed out after [`close`](Self::close);
    /// `None` means the queue is closed and empty. Only one task may read.
    pub async fn recv(&self) -> Option<Arc<Product>> {
        loop {
            let notified = self.ready.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(product) = inner.items.pop_front() {
                    return Some(product);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            inner.closed = true;
        }
        self.ready.notify_one();
        self.shutdown.notify_waiters();
        true
    }

    /// Resolve once the queue has been closed, whether or not updates are
    /// still pending. Any number of tasks may wait.
    pub async fn closed(&self) {
        // Registered on creation, so a close between the check and the await
        // is not missed.
        let notified = self.shutdown.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of pending updates.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no updates are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overflow policy of this queue.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn product(id: i64) -> Arc<Product> {
        Arc::new(Product::new("MacBook Pro", "Apple", "500EUR", 1).with_id(id))
    }

    fn ids(queue: &DeliveryQueue) -> Vec<i64> {
        queue
            .inner
            .lock()
            .items
            .iter()
            .map(|p| p.product_id)
            .collect()
    }

    #[test]
    fn test_drop_oldest_keeps_latest() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.offer(product(1)), Offer::Delivered);
        assert_eq!(queue.offer(product(2)), Offer::Delivered);
        assert_eq!(queue.offer(product(3)), Offer::DisplacedOldest);
        assert_eq!(ids(&queue), vec![2, 3]);
    }

    #[test]
    fn test_drop_newest_keeps_earliest() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropNewest);
        queue.offer(product(1));
        queue.offer(product(2));
        assert_eq!(queue.offer(product(3)), Offer::Rejected);
        assert_eq!(ids(&queue), vec![1, 2]);
    }

    #[test]
    fn test_disconnect_policy_reports_overflow() {
        let queue = DeliveryQueue::new(1, OverflowPolicy::Disconnect);
        queue.offer(product(1));
        assert_eq!(queue.offer(product(2)), Offer::Overflow);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let queue = DeliveryQueue::new(0, OverflowPolicy::DropNewest);
        assert_eq!(queue.capacity, 1);
        assert!(queue.offer(product(1)).accepted());
    }

    #[test]
    fn test_close_is_idempotent() {
        let queue = DeliveryQueue::new(4, OverflowPolicy::default());
        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());
        assert_eq!(queue.offer(product(1)), Offer::Closed);
    }

    #[test]
    fn test_offer_outcome_accounting() {
        assert!(Offer::Delivered.accepted());
        assert!(!Offer::Delivered.lost_update());
        assert!(Offer::DisplacedOldest.accepted());
        assert!(Offer::DisplacedOldest.lost_update());
        assert!(Offer::Rejected.lost_update());
        assert!(!Offer::Closed.lost_update());
    }

    #[tokio::test]
    async fn test_recv_drains_then_reports_closed() {
        let queue = DeliveryQueue::new(4, OverflowPolicy::default());
        queue.offer(product(1));
        queue.offer(product(2));
        queue.close();

        assert_eq!(queue.recv().await.unwrap().product_id, 1);
        assert_eq!(queue.recv().await.unwrap().product_id, 2);
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_offer() {
        let queue = Arc::new(DeliveryQueue::new(4, OverflowPolicy::default()));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.offer(product(5));

        let received = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.unwrap().product_id, 5);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_close() {
        let queue = Arc::new(DeliveryQueue::new(4, OverflowPolicy::default()));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.close();

        let received = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_closed_resolves_with_updates_pending() {
        let queue = Arc::new(DeliveryQueue::new(4, OverflowPolicy::Disconnect));
        queue.offer(product(1));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.closed().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        queue.close();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.len(), 1);

        // Already closed: resolves at once.
        tokio::time::timeout(Duration::from_millis(10), queue.closed())
            .await
            .unwrap();
    }
}
