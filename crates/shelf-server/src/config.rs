//! Server configuration.

use std::time::Duration;

use clap::Parser;

use crate::broker::{BrokerConfig, OverflowPolicy, DEFAULT_COMMAND_BUFFER, DEFAULT_QUEUE_CAPACITY};
use crate::error::Error;
use crate::feed::DEFAULT_IDLE_PROBE;
use crate::store::postgres_identifier;

/// Default HTTP listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// Default notification channel.
pub const DEFAULT_CHANNEL: &str = shelf_proto::PRODUCT_CHANGE_CHANNEL;

/// Default store query timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 15;

/// Default maximum WebSocket message size (256 KB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Maximum accepted product request body (1 KB).
pub const MAX_BODY_SIZE: usize = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen_addr: String,

    /// PostgreSQL connection string. `None` runs against an in-memory store.
    pub database_url: Option<String>,

    /// Create the schema and seed demo products at startup.
    pub init_database: bool,

    /// Notification channel carrying product changes.
    pub channel: String,

    /// Idle period after which the change feed is probed.
    pub feed_idle_probe: Duration,

    /// Deadline for a single store query.
    pub query_timeout: Duration,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,

    /// Broker and delivery queue settings.
    pub broker: BrokerConfig,
}

impl ServerConfig {
    /// Create a configuration with defaults and the in-memory store.
    pub fn new() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            database_url: None,
            init_database: false,
            channel: DEFAULT_CHANNEL.to_string(),
            feed_idle_probe: DEFAULT_IDLE_PROBE,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            broker: BrokerConfig::default(),
        }
    }

    /// Set the listen address.
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    /// Use PostgreSQL at `url`.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Create the schema and seed products at startup.
    pub fn with_init_database(mut self, init: bool) -> Self {
        self.init_database = init;
        self
    }

    /// Set the notification channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set the change feed idle probe period.
    pub fn with_feed_idle_probe(mut self, period: Duration) -> Self {
        self.feed_idle_probe = period;
        self
    }

    /// Set the store query timeout.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the maximum WebSocket message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the broker configuration.
    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    /// Check if the server runs against PostgreSQL.
    pub fn uses_database(&self) -> bool {
        self.database_url.is_some()
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if !postgres_identifier(&self.channel) {
            return Err(Error::Config(format!(
                "channel must be a lowercase identifier, got {:?}",
                self.channel
            )));
        }
        if self.feed_idle_probe.is_zero() {
            return Err(Error::Config("feed idle probe must be positive".to_string()));
        }
        if self.query_timeout.is_zero() {
            return Err(Error::Config("query timeout must be positive".to_string()));
        }
        if self.init_database && !self.uses_database() {
            return Err(Error::Config(
                "--db-init requires --database-url".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "shelf-server")]
#[command(version, about = "Product catalog with live change notifications", long_about = None)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value = DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// PostgreSQL connection string. Without it products live in memory.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Create the schema and seed demo products (destroys existing rows).
    #[arg(long)]
    pub db_init: bool,

    /// Notification channel carrying product changes.
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Pending updates buffered per session.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// What to do when a session's buffer is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::default())]
    pub overflow: OverflowPolicy,

    /// Broker command channel size.
    #[arg(long, default_value_t = DEFAULT_COMMAND_BUFFER)]
    pub command_buffer: usize,

    /// Seconds without change events before the feed is probed.
    #[arg(long, default_value_t = DEFAULT_IDLE_PROBE.as_secs())]
    pub feed_idle_secs: u64,

    /// Store query timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS)]
    pub query_timeout_secs: u64,

    /// Maximum WebSocket message size in kilobytes.
    #[arg(long, default_value_t = 256)]
    pub max_message_kb: usize,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "shelf_server=info,tower_http=info")]
    pub log_level: String,
}

impl Args {
    /// Convert command-line arguments to a validated server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let broker = BrokerConfig::default()
            .with_queue_capacity(self.queue_capacity)
            .with_overflow(self.overflow)
            .with_command_buffer(self.command_buffer);

        let config = ServerConfig {
            listen_addr: self.listen,
            database_url: self.database_url.filter(|url| !url.is_empty()),
            init_database: self.db_init,
            channel: self.channel,
            feed_idle_probe: Duration::from_secs(self.feed_idle_secs),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            max_message_size: self.max_message_kb * 1024,
            broker,
        };

        config.validate()?;
        Ok(config)
    }
}
