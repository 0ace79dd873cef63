//! Product catalog service with live change notifications.
//!
//! Clients manage products over HTTP and open a WebSocket to follow changes to
//! the products they care about. Store changes arrive through a change feed
//! (PostgreSQL `LISTEN/NOTIFY`, or an in-process channel for the memory store)
//! and are fanned out by a single broker task to every subscribed session:
//!
//! ```text
//! store ──notify──▶ ChangeFeed ──dispatch──▶ Broker ──queue──▶ SessionPump ──▶ WebSocket
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod feed;
pub mod routes;
pub mod session;
pub mod store;

pub use broker::{Broker, BrokerConfig, BrokerStats, OverflowPolicy, SessionHandle, SessionId};
pub use config::{Args, ServerConfig};
pub use error::{ApiError, Error};
pub use feed::{ChangeFeed, ChangeSource, ChannelSource, PgChangeSource};
pub use session::{CloseReason, SessionPump, SessionState};
pub use store::{MemoryStore, PgProductStore, ProductStore, SharedStore};

use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    /// Product store.
    pub store: SharedStore,
    /// Subscription broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Create new application state.
    pub fn new(store: impl ProductStore + 'static, broker: Broker, config: ServerConfig) -> Self {
        Self {
            store: Arc::new(store),
            broker,
            config: Arc::new(config),
        }
    }
}

/// Create the router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([header::ACCEPT, header::CONTENT_TYPE, header::CONTENT_LENGTH]);

    Router::new()
        .merge(routes::health::routes())
        .merge(routes::products::routes())
        .route("/ws/products", get(routes::ws::ws_products))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}
