//! Shelf server - product catalog with live change notifications.

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shelf_server::feed::{self, ChangeFeed, ChangeSource};
use shelf_server::store::{self, SEED_PRODUCT_COUNT};
use shelf_server::{
    create_router, AppState, Args, Broker, Error, MemoryStore, PgChangeSource, PgProductStore,
    ServerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting shelf server");

    let config = args.into_config()?;
    info!(
        listen = %config.listen_addr,
        store = if config.uses_database() { "postgres" } else { "memory" },
        channel = %config.channel,
        queue_capacity = config.broker.queue_capacity,
        overflow = ?config.broker.overflow,
        "configuration loaded"
    );

    let broker = Broker::start(config.broker.clone());
    let (state, mut change_feed) = match config.database_url.clone() {
        Some(url) => {
            let store = PgProductStore::connect(&url, config.query_timeout).await?;
            // Listen before seeding so the seed inserts flow through the feed.
            let source = PgChangeSource::connect(&url, &config.channel).await?;

            if config.init_database {
                info!("initializing database");
                store.init_schema(&config.channel).await?;
                store::seed(&store, SEED_PRODUCT_COUNT).await?;
            }

            let change_feed = spawn_feed(source, broker.clone(), &config);
            (AppState::new(store, broker, config.clone()), change_feed)
        }
        None => {
            let (changes, source) = feed::channel(config.broker.command_buffer);
            let store = MemoryStore::with_changes(changes);
            store::seed(&store, SEED_PRODUCT_COUNT).await?;

            let change_feed = spawn_feed(source, broker.clone(), &config);
            (AppState::new(store, broker, config.clone()), change_feed)
        }
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(listen = %config.listen_addr, "server ready, accepting connections");

    let app = create_router(state);
    let server = async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
    };

    tokio::select! {
        result = server => {
            result?;
            info!("server shutdown complete");
        }
        result = &mut change_feed => {
            match result? {
                Ok(()) => warn!("change feed stopped"),
                Err(e) => {
                    error!(error = %e, "change feed failed, shutting down");
                    return Err(e.into());
                }
            }
        }
    }

    change_feed.abort();
    Ok(())
}

fn spawn_feed<S>(source: S, broker: Broker, config: &ServerConfig) -> JoinHandle<Result<(), Error>>
where
    S: ChangeSource + 'static,
{
    tokio::spawn(ChangeFeed::new(source, broker, config.feed_idle_probe).run())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl+c");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}
