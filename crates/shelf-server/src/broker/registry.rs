//! Subscription registry.
//!
//! Maps product ids to the sessions watching them, plus the reverse index
//! needed for replace-on-subscribe and teardown. The registry is plain data:
//! it is owned and mutated by the broker worker only.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use shelf_proto::{Product, ProductId};

use super::queue::DeliveryQueue;

/// Identifier of a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// A session's delivery endpoint.
///
/// Cloning shares the underlying queue: the registry keeps one clone per
/// watched product while the session pump reads from its own.
#[derive(Clone)]
pub struct SessionHandle {
    id: SessionId,
    queue: Arc<DeliveryQueue>,
}

impl SessionHandle {
    /// Wrap a queue as the endpoint of session `id`.
    pub fn new(id: SessionId, queue: DeliveryQueue) -> Self {
        Self {
            id,
            queue: Arc::new(queue),
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The delivery queue.
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Wait for the next delivered product. `None` once closed and drained.
    pub async fn recv(&self) -> Option<Arc<Product>> {
        self.queue.recv().await
    }

    /// Close the endpoint. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.queue.close()
    }

    /// Whether the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("pending", &self.queue.len())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}

/// Product id to watching sessions, with the reverse index.
#[derive(Default)]
pub struct Registry {
    /// Sessions watching each product. Never holds an empty map.
    watchers: HashMap<ProductId, HashMap<SessionId, SessionHandle>>,
    /// Products each session watches. Never holds an empty set.
    interests: HashMap<SessionId, HashSet<ProductId>>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the session's interest set with exactly `ids`.
    ///
    /// Returns `false` without touching state if the session's endpoint is
    /// already closed, so a late subscribe cannot resurrect a torn-down
    /// session.
    pub fn subscribe(&mut self, session: &SessionHandle, ids: &[ProductId]) -> bool {
        if session.is_closed() {
            return false;
        }

        let wanted: HashSet<ProductId> = ids.iter().copied().collect();
        let previous = self.interests.remove(&session.id).unwrap_or_default();

        for product in previous.difference(&wanted) {
            self.detach(session.id, *product);
        }
        for product in &wanted {
            self.watchers
                .entry(*product)
                .or_default()
                .insert(session.id, session.clone());
        }

        if !wanted.is_empty() {
            self.interests.insert(session.id, wanted);
        }
        true
    }

    /// Remove the session from each listed product. Unknown ids are ignored.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe(&mut self, session: SessionId, ids: &[ProductId]) -> usize {
        let Some(interest) = self.interests.get_mut(&session) else {
            return 0;
        };

        let mut removed = Vec::new();
        for product in ids {
            if interest.remove(product) {
                removed.push(*product);
            }
        }
        if interest.is_empty() {
            self.interests.remove(&session);
        }

        for product in &removed {
            self.detach(session, *product);
        }
        removed.len()
    }

    /// Remove the session everywhere and close its endpoint.
    ///
    /// Safe to call any number of times. Returns the number of subscriptions
    /// removed.
    pub fn teardown(&mut self, session: &SessionHandle) -> usize {
        let interest = self.interests.remove(&session.id).unwrap_or_default();
        for product in &interest {
            self.detach(session.id, *product);
        }
        session.close();
        interest.len()
    }

    /// Sessions currently watching `product`.
    pub fn watchers(&self, product: ProductId) -> Vec<SessionHandle> {
        self.watchers
            .get(&product)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Products the session currently watches.
    #[cfg(test)]
    pub(crate) fn interests(&self, session: SessionId) -> BTreeSet<ProductId> {
        self.interests
            .get(&session)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of sessions with at least one subscription.
    pub fn session_count(&self) -> usize {
        self.interests.len()
    }

    /// Number of products with at least one watcher.
    pub fn tracked_products(&self) -> usize {
        self.watchers.len()
    }

    /// Total number of (product, session) pairs.
    pub fn subscription_count(&self) -> usize {
        self.interests.values().map(HashSet::len).sum()
    }

    /// Ordered copy of the product to session mapping.
    pub fn snapshot(&self) -> BTreeMap<ProductId, BTreeSet<SessionId>> {
        self.watchers
            .iter()
            .map(|(product, sessions)| (*product, sessions.keys().copied().collect()))
            .collect()
    }

    /// Close every registered endpoint and forget all subscriptions.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (_, sessions) in self.watchers.drain() {
            for (_, handle) in sessions {
                if handle.close() {
                    closed += 1;
                }
            }
        }
        self.interests.clear();
        closed
    }

    fn detach(&mut self, session: SessionId, product: ProductId) {
        if let Some(sessions) = self.watchers.get_mut(&product) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.watchers.remove(&product);
            }
        }
    }

    /// Whether both indexes agree and neither holds an empty entry.
    pub fn is_consistent(&self) -> bool {
        let no_empty = self.watchers.values().all(|s| !s.is_empty())
            && self.interests.values().all(|s| !s.is_empty());

        let forward_matches = self.watchers.iter().all(|(product, sessions)| {
            sessions.keys().all(|session| {
                self.interests
                    .get(session)
                    .is_some_and(|set| set.contains(product))
            })
        });

        let reverse_matches = self.interests.iter().all(|(session, products)| {
            products.iter().all(|product| {
                self.watchers
                    .get(product)
                    .is_some_and(|sessions| sessions.contains_key(session))
            })
        });

        no_empty && forward_matches && reverse_matches
    }
}
