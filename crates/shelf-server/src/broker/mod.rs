//! Change-notification broker.
//!
//! One worker task owns the [`Registry`] and processes every subscribe,
//! unsubscribe, teardown and dispatch command in arrival order. Callers talk
//! to it through a cloneable [`Broker`] handle; nothing else touches the
//! registry.
//!
//! Dispatch never waits on a session: each delivery is a non-blocking offer to
//! the session's bounded [`DeliveryQueue`], and a full queue is resolved by the
//! configured [`OverflowPolicy`]. Updates for different products carry no
//! relative ordering guarantee.

mod queue;
mod registry;

pub use queue::{DeliveryQueue, Offer, OverflowPolicy};
pub use registry::{Registry, SessionHandle, SessionId};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use shelf_proto::{ChangeEvent, ProductId};

use crate::error::Error;

/// Default capacity of each session's delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default capacity of the broker command channel.
pub const DEFAULT_COMMAND_BUFFER: usize = 1024;

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Pending updates each session may hold.
    pub queue_capacity: usize,
    /// What to do when a session's queue is full.
    pub overflow: OverflowPolicy,
    /// Commands that may wait for the worker before senders are suspended.
    pub command_buffer: usize,
}

impl BrokerConfig {
    /// Set the per-session queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Set the overflow policy.
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the command channel capacity.
    pub fn with_command_buffer(mut self, buffer: usize) -> Self {
        self.command_buffer = buffer.max(1);
        self
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
        }
    }
}

/// Counters reported by the broker worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Sessions with at least one subscription.
    pub sessions: usize,
    /// Products with at least one watcher.
    pub tracked_products: usize,
    /// Total (product, session) subscriptions.
    pub subscriptions: usize,
    /// Change events processed.
    pub events: u64,
    /// Updates queued for delivery.
    pub delivered: u64,
    /// Updates lost to full queues.
    pub dropped: u64,
    /// Sessions torn down because their queue overflowed.
    pub evicted: u64,
}

enum Command {
    Subscribe {
        session: SessionHandle,
        ids: Vec<ProductId>,
    },
    Unsubscribe {
        session: SessionId,
        ids: Vec<ProductId>,
    },
    Teardown {
        session: SessionHandle,
    },
    Dispatch {
        event: ChangeEvent,
    },
    Stats {
        reply: oneshot::Sender<BrokerStats>,
    },
    Snapshot {
        reply: oneshot::Sender<BTreeMap<ProductId, BTreeSet<SessionId>>>,
    },
}

/// Handle to a running broker.
///
/// Cloning is cheap. The worker stops once every handle has been dropped,
/// closing all endpoints still registered.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::Sender<Command>,
    next_session: Arc<AtomicU64>,
    config: BrokerConfig,
}

impl Broker {
    /// Spawn the broker worker on the current runtime.
    pub fn start(config: BrokerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let worker = BrokerWorker::new(rx);

        tokio::spawn(async move {
            worker.run().await;
        });

        Self {
            tx,
            next_session: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// A handle whose worker has already stopped.
    #[cfg(test)]
    pub(crate) fn stopped(config: BrokerConfig) -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            next_session: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Broker configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Allocate a delivery endpoint for a new session.
    ///
    /// The session is unknown to the registry until it subscribes.
    pub fn open_session(&self) -> SessionHandle {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        let queue = DeliveryQueue::new(self.config.queue_capacity, self.config.overflow);
        SessionHandle::new(id, queue)
    }

    /// Replace the session's interest set with exactly `ids`.
    pub async fn subscribe(
        &self,
        session: &SessionHandle,
        ids: impl Into<Vec<ProductId>>,
    ) -> Result<(), Error> {
        self.send(Command::Subscribe {
            session: session.clone(),
            ids: ids.into(),
        })
        .await
    }

    /// Stop delivering the listed products to the session.
    pub async fn unsubscribe(
        &self,
        session: &SessionHandle,
        ids: impl Into<Vec<ProductId>>,
    ) -> Result<(), Error> {
        self.send(Command::Unsubscribe {
            session: session.id(),
            ids: ids.into(),
        })
        .await
    }

    /// Remove the session from the registry and close its endpoint.
    pub async fn teardown(&self, session: &SessionHandle) -> Result<(), Error> {
        self.send(Command::Teardown {
            session: session.clone(),
        })
        .await
    }

    /// Fan a change event out to every session watching its product.
    pub async fn dispatch(&self, event: ChangeEvent) -> Result<(), Error> {
        self.send(Command::Dispatch { event }).await
    }

    /// Current counters.
    pub async fn stats(&self) -> Result<BrokerStats, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats { reply }).await?;
        rx.await.map_err(|_| Error::BrokerClosed)
    }

    /// Ordered copy of the product to session mapping.
    pub async fn snapshot(&self) -> Result<BTreeMap<ProductId, BTreeSet<SessionId>>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| Error::BrokerClosed)
    }

    async fn send(&self, command: Command) -> Result<(), Error> {
        self.tx.send(command).await.map_err(|_| Error::BrokerClosed)
    }
}

/// The single writer of the registry.
struct BrokerWorker {
    rx: mpsc::Receiver<Command>,
    registry: Registry,
    stats: BrokerStats,
}

impl BrokerWorker {
    fn new(rx: mpsc::Receiver<Command>) -> Self {
        Self {
            rx,
            registry: Registry::new(),
            stats: BrokerStats::default(),
        }
    }

    async fn run(mut self) {
        info!("broker started");

        while let Some(command) = self.rx.recv().await {
            self.handle(command);
        }

        let closed = self.registry.close_all();
        info!(closed_sessions = closed, "broker stopped (all handles dropped)");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe { session, ids } => {
                if self.registry.subscribe(&session, &ids) {
                    debug!(session_id = %session.id(), products = ?ids, "subscribed");
                } else {
                    debug!(session_id = %session.id(), "ignoring subscribe for closed session");
                }
            }
            Command::Unsubscribe { session, ids } => {
                let removed = self.registry.unsubscribe(session, &ids);
                debug!(session_id = %session, products = ?ids, removed, "unsubscribed");
            }
            Command::Teardown { session } => {
                let removed = self.registry.teardown(&session);
                debug!(session_id = %session.id(), removed, "session torn down");
            }
            Command::Dispatch { event } => self.dispatch(event),
            Command::Stats { reply } => {
                let _ = reply.send(self.current_stats());
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    fn dispatch(&mut self, event: ChangeEvent) {
        self.stats.events += 1;
        let product_id = event.product_id();
        let watchers = self.registry.watchers(product_id);
        if watchers.is_empty() {
            trace!(product_id, action = %event.action, "no subscribers");
            return;
        }

        let product = Arc::new(event.product);
        for session in watchers {
            let outcome = session.queue().offer(product.clone());
            if outcome.accepted() {
                self.stats.delivered += 1;
            }
            if outcome.lost_update() {
                self.stats.dropped += 1;
            }

            match outcome {
                Offer::Delivered => {
                    trace!(product_id, session_id = %session.id(), "update queued");
                }
                Offer::DisplacedOldest | Offer::Rejected => {
                    warn!(
                        product_id,
                        session_id = %session.id(),
                        policy = ?session.queue().policy(),
                        "delivery queue full, update dropped"
                    );
                }
                Offer::Overflow => {
                    warn!(
                        product_id,
                        session_id = %session.id(),
                        "delivery queue full, disconnecting session"
                    );
                    self.registry.teardown(&session);
                    self.stats.evicted += 1;
                }
                Offer::Closed => {
                    // The pump is already tearing down; its teardown command is queued.
                    trace!(product_id, session_id = %session.id(), "endpoint closed");
                }
            }
        }

        trace!(product_id, action = %event.action, "dispatched change event");
    }

    fn current_stats(&self) -> BrokerStats {
        BrokerStats {
            sessions: self.registry.session_count(),
            tracked_products: self.registry.tracked_products(),
            subscriptions: self.registry.subscription_count(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use shelf_proto::Product;

    fn event(id: ProductId, units: i32) -> ChangeEvent {
        ChangeEvent::new(
            "update",
            Product::new("MacBook Pro", "Apple", "900EUR", units).with_id(id),
        )
    }

    /// Wait until every command sent so far has been processed.
    async fn settle(broker: &Broker) -> BrokerStats {
        broker.stats().await.unwrap()
    }

    async fn try_recv(session: &SessionHandle) -> Option<Arc<Product>> {
        tokio::time::timeout(Duration::from_millis(20), session.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_dispatch_reaches_only_subscribers() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();
        let b = broker.open_session();

        broker.subscribe(&a, vec![1, 2]).await.unwrap();
        broker.dispatch(event(1, 5)).await.unwrap();
        settle(&broker).await;

        let received = try_recv(&a).await.unwrap();
        assert_eq!(received.product_id, 1);
        assert_eq!(received.units_available, 5);
        assert!(a.queue().is_empty());
        assert!(b.queue().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers_is_noop() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();
        broker.subscribe(&a, vec![2]).await.unwrap();
        let before = broker.snapshot().await.unwrap();

        broker.dispatch(event(1, 5)).await.unwrap();

        let stats = settle(&broker).await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.dropped, 0);
        assert_eq!(broker.snapshot().await.unwrap(), before);
        assert!(a.queue().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_then_dispatch_delivers_nowhere() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();

        broker.subscribe(&a, vec![1]).await.unwrap();
        broker.teardown(&a).await.unwrap();
        broker.dispatch(event(1, 5)).await.unwrap();

        let stats = settle(&broker).await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.sessions, 0);
        assert!(a.is_closed());
        assert!(a.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_twice() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();
        broker.subscribe(&a, vec![1, 2]).await.unwrap();

        broker.teardown(&a).await.unwrap();
        let once = broker.snapshot().await.unwrap();
        broker.teardown(&a).await.unwrap();

        assert_eq!(broker.snapshot().await.unwrap(), once);
        assert!(once.is_empty());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();

        broker.subscribe(&a, vec![1, 2, 3]).await.unwrap();
        broker.subscribe(&a, vec![2]).await.unwrap();
        broker.dispatch(event(1, 5)).await.unwrap();

        let stats = settle(&broker).await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.subscriptions, 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_teardown_does_not_resurrect() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();

        broker.teardown(&a).await.unwrap();
        broker.subscribe(&a, vec![1]).await.unwrap();

        assert!(broker.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stalled_session_does_not_block_others() {
        let broker = Broker::start(BrokerConfig::default().with_queue_capacity(2));
        let stalled = broker.open_session();
        let reader = broker.open_session();

        broker.subscribe(&stalled, vec![1]).await.unwrap();
        broker.subscribe(&reader, vec![2]).await.unwrap();

        for units in 0..100 {
            broker.dispatch(event(1, units)).await.unwrap();
        }

        let delivered = tokio::time::timeout(Duration::from_secs(1), async {
            broker.dispatch(event(2, 7)).await.unwrap();
            reader.recv().await
        })
        .await
        .expect("dispatch to an unrelated session must not wait on a stalled one");
        assert_eq!(delivered.unwrap().product_id, 2);

        let stats = settle(&broker).await;
        assert_eq!(stats.dropped, 98);
        assert_eq!(stalled.queue().len(), 2);
    }

    #[tokio::test]
    async fn test_stalled_session_keeps_latest_updates() {
        // Overflow trades completeness for liveness: a slow reader sees the
        // most recent state, not every intermediate update.
        let broker = Broker::start(
            BrokerConfig::default()
                .with_queue_capacity(3)
                .with_overflow(OverflowPolicy::DropOldest),
        );
        let a = broker.open_session();
        broker.subscribe(&a, vec![1]).await.unwrap();

        for units in 0..10 {
            broker.dispatch(event(1, units)).await.unwrap();
        }
        settle(&broker).await;

        let mut seen = Vec::new();
        while let Some(product) = try_recv(&a).await {
            seen.push(product.units_available);
        }
        assert_eq!(seen, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_earliest_updates() {
        let broker = Broker::start(
            BrokerConfig::default()
                .with_queue_capacity(2)
                .with_overflow(OverflowPolicy::DropNewest),
        );
        let a = broker.open_session();
        broker.subscribe(&a, vec![1]).await.unwrap();

        for units in 0..5 {
            broker.dispatch(event(1, units)).await.unwrap();
        }
        let stats = settle(&broker).await;
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 3);

        assert_eq!(try_recv(&a).await.unwrap().units_available, 0);
        assert_eq!(try_recv(&a).await.unwrap().units_available, 1);
    }

    #[tokio::test]
    async fn test_disconnect_policy_evicts_session() {
        let broker = Broker::start(
            BrokerConfig::default()
                .with_queue_capacity(1)
                .with_overflow(OverflowPolicy::Disconnect),
        );
        let slow = broker.open_session();
        let other = broker.open_session();
        broker.subscribe(&slow, vec![1]).await.unwrap();
        broker.subscribe(&other, vec![1]).await.unwrap();

        broker.dispatch(event(1, 1)).await.unwrap();
        broker.dispatch(event(1, 2)).await.unwrap();

        let stats = settle(&broker).await;
        assert_eq!(stats.evicted, 2);
        assert!(slow.is_closed());

        // Pending updates are still readable before the endpoint reports closed.
        assert_eq!(slow.recv().await.unwrap().units_available, 1);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_teardown_racing_dispatch() {
        let broker = Broker::start(BrokerConfig::default());
        let sessions: Vec<SessionHandle> = (0..16).map(|_| broker.open_session()).collect();
        for session in &sessions {
            broker.subscribe(session, vec![1]).await.unwrap();
        }

        let dispatcher = {
            let broker = broker.clone();
            tokio::spawn(async move {
                for units in 0..200 {
                    broker.dispatch(event(1, units)).await.unwrap();
                }
            })
        };
        let teardowns = {
            let broker = broker.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                for session in &sessions {
                    broker.teardown(session).await.unwrap();
                    broker.teardown(session).await.unwrap();
                }
            })
        };

        dispatcher.await.unwrap();
        teardowns.await.unwrap();

        assert!(broker.snapshot().await.unwrap().is_empty());
        assert!(sessions.iter().all(SessionHandle::is_closed));
    }

    #[tokio::test]
    async fn test_dropping_last_handle_closes_endpoints() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();
        broker.subscribe(&a, vec![1]).await.unwrap();
        settle(&broker).await;

        drop(broker);

        let closed = tokio::time::timeout(Duration::from_secs(1), a.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }

    #[tokio::test]
    async fn test_session_ids_are_unique() {
        let broker = Broker::start(BrokerConfig::default());
        let a = broker.open_session();
        let b = broker.clone().open_session();
        assert_ne!(a.id(), b.id());
    }
}
