//! HTTP route handlers.

pub mod health;
pub mod products;
pub mod ws;
