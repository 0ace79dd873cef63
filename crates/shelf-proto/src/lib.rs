//! Shelf wire types.
//!
//! This crate defines the JSON shapes exchanged by the shelf service:
//!
//! - [`product`] - The catalog entity served over HTTP and pushed to subscribers
//! - [`message`] - Client subscription commands and upstream change events
//! - [`error`] - Encoding and decoding errors
//!
//! All types serialize with serde using the camelCase field names the
//! catalog clients expect.

pub mod error;
pub mod message;
pub mod product;

pub use error::Error;
pub use message::{
    decode_change, decode_command, encode_change, encode_product, ChangeEvent, ClientCommand,
    CommandKind,
};
pub use product::{Product, ProductId};

/// Default notification channel the relational store publishes changes on.
pub const PRODUCT_CHANGE_CHANNEL: &str = "product_change";
