//! Product storage.
//!
//! The broker never reads the store; changes reach subscribers only through
//! the change feed. Two implementations exist: [`PgProductStore`], whose
//! trigger publishes changes via `pg_notify`, and [`MemoryStore`], which
//! publishes the same payloads on an in-process channel.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgProductStore;
pub(crate) use postgres::postgres_identifier;

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::info;

use shelf_proto::{Product, ProductId};

use crate::error::Error;

/// Number of products created by catalog seeding.
pub const SEED_PRODUCT_COUNT: usize = 10;

/// Key-based product CRUD.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// All products ordered by id.
    async fn all(&self) -> Result<Vec<Product>, Error>;

    /// Look up one product.
    async fn find_by_id(&self, id: ProductId) -> Result<Option<Product>, Error>;

    /// Insert a product and return it with its assigned id.
    async fn create(&self, product: Product) -> Result<Product, Error>;

    /// Overwrite a product's attributes. Returns `false` if it does not exist.
    async fn update_by_id(&self, id: ProductId, product: Product) -> Result<bool, Error>;

    /// Delete a product. Returns `false` if it did not exist.
    async fn delete_by_id(&self, id: ProductId) -> Result<bool, Error>;
}

/// Shared store handle.
pub type SharedStore = Arc<dyn ProductStore>;

/// Generate `count` demo products.
pub fn sample_products(count: usize) -> Vec<Product> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let price = rng.gen_range(0..10) * 100 + 500;
            Product::new(
                "MacBook Pro",
                "Apple",
                format!("{price}EUR"),
                rng.gen_range(0..15),
            )
        })
        .collect()
}

/// Fill the store with demo products.
pub async fn seed(store: &dyn ProductStore, count: usize) -> Result<Vec<Product>, Error> {
    info!(count, "seeding products");

    let mut created = Vec::with_capacity(count);
    for product in sample_products(count) {
        let product = store.create(product).await?;
        info!(product_id = product.product_id, "product created");
        created.push(product);
    }
    Ok(created)
}
