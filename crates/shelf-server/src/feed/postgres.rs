//! PostgreSQL LISTEN/NOTIFY change source.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use tracing::info;

use super::ChangeSource;
use crate::error::Error;

/// Change source listening on a PostgreSQL notification channel.
pub struct PgChangeSource {
    listener: PgListener,
}

impl PgChangeSource {
    /// Connect and start listening on `channel`.
    pub async fn connect(database_url: &str, channel: &str) -> Result<Self, Error> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(channel).await?;
        info!(channel, "listening for change notifications");

        Ok(Self { listener })
    }
}

#[async_trait]
impl ChangeSource for PgChangeSource {
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, Error> {
        // `try_recv` yields `None` when the connection drops; reconnecting is
        // left to the process owner.
        let notification = self.listener.try_recv().await?;
        Ok(notification.map(|n| n.payload().as_bytes().to_vec()))
    }

    async fn ping(&mut self) -> Result<(), Error> {
        sqlx::query("SELECT 1").execute(&mut self.listener).await?;
        Ok(())
    }
}
