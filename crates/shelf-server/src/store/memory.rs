//! In-process product store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use shelf_proto::{encode_change, ChangeEvent, Product, ProductId};

use super::ProductStore;
use crate::error::Error;

/// Product store held in memory.
///
/// When built with [`with_changes`](Self::with_changes) every mutation
/// publishes a change payload, mirroring what the PostgreSQL trigger sends.
/// Publishing never blocks; if the channel is full the change is dropped.
/// Changes are published under the write lock, so payloads leave in the
/// order the mutations were applied.
pub struct MemoryStore {
    products: RwLock<BTreeMap<ProductId, Product>>,
    next_id: AtomicI64,
    changes: Option<mpsc::Sender<Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store that publishes nothing.
    pub fn new() -> Self {
        Self {
            products: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(1),
            changes: None,
        }
    }

    /// Create an empty store publishing change payloads on `changes`.
    pub fn with_changes(changes: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            changes: Some(changes),
            ..Self::new()
        }
    }

    /// Number of stored products.
    pub fn len(&self) -> usize {
        self.products.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.products.read().is_empty()
    }

    fn publish(&self, action: &str, product: &Product) {
        let Some(changes) = &self.changes else {
            return;
        };

        let event = ChangeEvent::new(action, product.clone());
        match encode_change(&event) {
            Ok(payload) => {
                if let Err(e) = changes.try_send(payload) {
                    warn!(product_id = product.product_id, action, error = %e, "change not published");
                }
            }
            Err(e) => warn!(product_id = product.product_id, error = %e, "change not encoded"),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProductStore for MemoryStore {
    async fn all(&self) -> Result<Vec<Product>, Error> {
        Ok(self.products.read().values().cloned().collect())
    }

    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, Error> {
        Ok(self.products.read().get(&id).cloned())
    }

    async fn create(&self, product: Product) -> Result<Product, Error> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let product = product.with_id(id);
        let mut products = self.products.write();
        products.insert(id, product.clone());
        self.publish("insert", &product);
        Ok(product)
    }

    async fn update_by_id(&self, id: ProductId, product: Product) -> Result<bool, Error> {
        let product = product.with_id(id);
        let mut products = self.products.write();
        match products.get_mut(&id) {
            Some(existing) => *existing = product.clone(),
            None => return Ok(false),
        }
        self.publish("update", &product);
        Ok(true)
    }

    async fn delete_by_id(&self, id: ProductId) -> Result<bool, Error> {
        let mut products = self.products.write();
        match products.remove(&id) {
            Some(product) => {
                self.publish("delete", &product);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
