//! Per-connection session pump.
//!
//! A pump bridges one client connection and the broker. Once active it runs
//! two flows side by side:
//!
//! - inbound: text frames are decoded into [`ClientCommand`]s and forwarded to
//!   the broker
//! - outbound: products delivered to the session's endpoint are encoded and
//!   sent to the client
//!
//! Whichever flow ends first moves the session to `Closing`. Closing tears the
//! session down exactly once, drains its endpoint until the broker closes it,
//! and releases the connection.
//!
//! The pump is transport agnostic: it consumes any stream of text frames and
//! any sink accepting text frames. The websocket route adapts axum's socket.

use std::fmt;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use shelf_proto::{decode_command, encode_product, ClientCommand, CommandKind};

use crate::broker::{Broker, SessionHandle, SessionId};

/// How long a closing session waits for the connection to shut down.
const CONNECTION_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, handshake not yet complete.
    Open,
    /// Exchanging commands and updates.
    Active,
    /// Teardown in progress.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    fn can_enter(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Open, SessionState::Active)
                | (SessionState::Open, SessionState::Closing)
                | (SessionState::Active, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }
}

/// Why a session left the `Active` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client ended the inbound stream.
    ClientClosed,
    /// Receiving from the client failed.
    ReceiveFailed,
    /// A client frame was not a valid command.
    InvalidCommand,
    /// Sending to the client failed.
    SendFailed,
    /// The broker closed the session's endpoint.
    Evicted,
    /// The broker is no longer running.
    BrokerStopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::ReceiveFailed => "receive failed",
            CloseReason::InvalidCommand => "invalid command",
            CloseReason::SendFailed => "send failed",
            CloseReason::Evicted => "evicted by broker",
            CloseReason::BrokerStopped => "broker stopped",
        };
        f.write_str(reason)
    }
}

/// Drives one client connection.
pub struct SessionPump {
    broker: Broker,
    session: SessionHandle,
    state: SessionState,
}

impl SessionPump {
    /// Create a pump with a fresh endpoint from `broker`.
    pub fn new(broker: Broker) -> Self {
        let session = broker.open_session();
        Self {
            broker,
            session,
            state: SessionState::Open,
        }
    }

    /// Session identifier.
    pub fn id(&self) -> SessionId {
        self.session.id()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Mark the handshake as complete.
    pub fn activate(&mut self) -> bool {
        self.transition(SessionState::Active)
    }

    /// Run the session until either flow ends, then close it.
    ///
    /// Returns the reason the session left `Active`.
    pub async fn run<St, Si, E>(mut self, mut inbound: St, mut outbound: Si) -> CloseReason
    where
        St: Stream<Item = Result<String, E>> + Unpin,
        Si: Sink<String> + Unpin,
        Si::Error: fmt::Display,
        E: fmt::Display,
    {
        if self.state == SessionState::Open {
            self.activate();
        }
        info!(session_id = %self.id(), "session active");

        let reason = {
            let inbound_flow = pump_inbound(&self.broker, &self.session, &mut inbound);
            let outbound_flow = pump_outbound(&self.session, &mut outbound);
            tokio::select! {
                reason = inbound_flow => reason,
                reason = outbound_flow => reason,
            }
        };

        self.close(reason).await;

        // A stalled client may never let the close through.
        match tokio::time::timeout(CONNECTION_CLOSE_TIMEOUT, outbound.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(session_id = %self.id(), error = %e, "closing connection failed");
            }
            Err(_) => {
                debug!(session_id = %self.id(), "closing connection timed out");
            }
        }
        reason
    }

    /// Tear the session down and drain its endpoint.
    ///
    /// Only the first call has any effect.
    pub async fn close(&mut self, reason: CloseReason) {
        if !self.transition(SessionState::Closing) {
            return;
        }
        info!(session_id = %self.id(), %reason, "session closing");

        if self.broker.teardown(&self.session).await.is_err() {
            // Without a worker nobody else will close the endpoint.
            self.session.close();
        }

        let mut discarded = 0usize;
        while self.session.recv().await.is_some() {
            discarded += 1;
        }

        self.transition(SessionState::Closed);
        info!(session_id = %self.id(), discarded, "session closed");
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_enter(next) {
            return false;
        }
        debug!(session_id = %self.id(), from = ?self.state, to = ?next, "session state change");
        self.state = next;
        true
    }
}

async fn pump_inbound<St, E>(broker: &Broker, session: &SessionHandle, inbound: &mut St) -> CloseReason
where
    St: Stream<Item = Result<String, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "receive failed");
                return CloseReason::ReceiveFailed;
            }
        };

        let command = match decode_command(&text) {
            Ok(command) => command,
            Err(e) => {
                warn!(session_id = %session.id(), error = %e, "invalid client command");
                return CloseReason::InvalidCommand;
            }
        };

        if forward(broker, session, command).await.is_err() {
            return CloseReason::BrokerStopped;
        }
    }
    CloseReason::ClientClosed
}

async fn forward(
    broker: &Broker,
    session: &SessionHandle,
    command: ClientCommand,
) -> Result<(), crate::Error> {
    debug!(
        session_id = %session.id(),
        command = ?command.command,
        products = ?command.entity_ids,
        "client command"
    );
    match command.command {
        CommandKind::Subscribe => broker.subscribe(session, command.entity_ids).await,
        CommandKind::Unsubscribe => broker.unsubscribe(session, command.entity_ids).await,
    }
}

async fn pump_outbound<Si>(session: &SessionHandle, outbound: &mut Si) -> CloseReason
where
    Si: Sink<String> + Unpin,
    Si::Error: fmt::Display,
{
    while let Some(product) = session.recv().await {
        let frame = match encode_product(&product) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %session.id(), product_id = product.product_id, error = %e, "encode failed");
                continue;
            }
        };

        let sent = tokio::select! {
            biased;
            sent = outbound.send(frame) => sent,
            _ = session.queue().closed() => {
                debug!(session_id = %session.id(), "endpoint closed during a pending send");
                return CloseReason::Evicted;
            }
        };
        if let Err(e) = sent {
            warn!(session_id = %session.id(), error = %e, "send failed");
            return CloseReason::SendFailed;
        }
    }
    CloseReason::Evicted
}
