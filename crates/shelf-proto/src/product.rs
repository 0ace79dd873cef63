//! Catalog product entity.

use serde::{Deserialize, Serialize};

/// Stable product identifier.
pub type ProductId = i64;

/// A catalog item.
///
/// Identity is the `product_id`; two values with the same id refer to the same
/// product even when their attributes differ.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    /// Unique identifier. Zero means "not yet assigned".
    #[serde(default)]
    pub product_id: ProductId,
    pub manufacturer: String,
    /// Price with its currency suffix, e.g. `"900EUR"`.
    pub price_per_unit: String,
    pub units_available: i32,
    pub product_name: String,
}

impl Product {
    /// Create a product without an identifier.
    pub fn new(
        product_name: impl Into<String>,
        manufacturer: impl Into<String>,
        price_per_unit: impl Into<String>,
        units_available: i32,
    ) -> Self {
        Self {
            product_id: 0,
            manufacturer: manufacturer.into(),
            price_per_unit: price_per_unit.into(),
            units_available,
            product_name: product_name.into(),
        }
    }

    /// Return a copy carrying the given identifier.
    pub fn with_id(mut self, product_id: ProductId) -> Self {
        self.product_id = product_id;
        self
    }
}
