//! Upstream change feed.
//!
//! A [`ChangeSource`] yields raw change payloads; [`ChangeFeed`] decodes each
//! one and hands it to the broker. Payloads that fail to decode are logged and
//! dropped. When the source stays idle for the configured period the feed
//! probes it, and a failed probe or a lost connection ends the feed with
//! [`Error::FeedLost`] for the process owner to act on.

mod postgres;

pub use postgres::PgChangeSource;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use shelf_proto::decode_change;

use crate::broker::Broker;
use crate::error::Error;

/// Default idle period before the source is probed.
pub const DEFAULT_IDLE_PROBE: Duration = Duration::from_secs(90);

/// A producer of raw change payloads.
#[async_trait]
pub trait ChangeSource: Send {
    /// Wait for the next payload. `Ok(None)` means the upstream connection is gone.
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, Error>;

    /// Check that the upstream connection is still alive.
    async fn ping(&mut self) -> Result<(), Error>;
}

/// In-process change source fed through a channel.
pub struct ChannelSource {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelSource {
    /// Wrap a channel receiver.
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }
}

/// Create a channel-backed source and its sender.
pub fn channel(buffer_size: usize) -> (mpsc::Sender<Vec<u8>>, ChannelSource) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    (tx, ChannelSource::new(rx))
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.rx.recv().await)
    }

    async fn ping(&mut self) -> Result<(), Error> {
        if self.rx.is_closed() && self.rx.is_empty() {
            return Err(Error::FeedLost("all change senders dropped".to_string()));
        }
        Ok(())
    }
}

/// Bridges a change source to the broker.
pub struct ChangeFeed<S> {
    source: S,
    broker: Broker,
    idle_probe: Duration,
}

impl<S: ChangeSource> ChangeFeed<S> {
    /// Create a feed probing the source after `idle_probe` without payloads.
    pub fn new(source: S, broker: Broker, idle_probe: Duration) -> Self {
        Self {
            source,
            broker,
            idle_probe,
        }
    }

    /// Run until the source is lost or the broker stops.
    ///
    /// Returns `Ok(())` only when the broker has shut down.
    pub async fn run(mut self) -> Result<(), Error> {
        info!(idle_probe_secs = self.idle_probe.as_secs(), "change feed started");

        loop {
            let payload = match tokio::time::timeout(self.idle_probe, self.source.next_payload()).await {
                Ok(Ok(Some(payload))) => payload,
                Ok(Ok(None)) => {
                    error!("change feed connection lost");
                    return Err(Error::FeedLost("upstream connection closed".to_string()));
                }
                Ok(Err(e)) => {
                    error!(error = %e, "change feed receive failed");
                    return Err(lost(e));
                }
                Err(_) => {
                    debug!("no change events, pinging the feed");
                    if let Err(e) = self.source.ping().await {
                        error!(error = %e, "change feed ping failed");
                        return Err(lost(e));
                    }
                    continue;
                }
            };

            match forward_payload(&self.broker, &payload).await {
                Ok(()) => {}
                Err(Error::BrokerClosed) => {
                    info!("change feed stopped (broker closed)");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Decode one payload and dispatch it. Undecodable payloads are dropped.
///
/// Takes the broker rather than the feed so the source is never borrowed
/// across the dispatch await.
async fn forward_payload(broker: &Broker, payload: &[u8]) -> Result<(), Error> {
    let event = match decode_change(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "dropping undecodable change payload"
            );
            return Ok(());
        }
    };

    debug!(
        product_id = event.product_id(),
        action = %event.action,
        "product changed"
    );
    broker.dispatch(event).await
}

fn lost(error: Error) -> Error {
    match error {
        Error::FeedLost(_) => error,
        other => Error::FeedLost(other.to_string()),
    }
}
