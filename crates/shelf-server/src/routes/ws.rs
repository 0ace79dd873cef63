//! WebSocket endpoint for live product updates.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{future, SinkExt, StreamExt, TryStreamExt};
use tracing::info;

use crate::broker::Broker;
use crate::session::SessionPump;
use crate::AppState;

/// WebSocket upgrade handler for product update subscriptions.
pub async fn ws_products(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let broker = state.broker.clone();
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, broker))
}

/// Run a session pump over the socket until either side ends it.
async fn handle_socket(socket: WebSocket, broker: Broker) {
    let (sink, stream) = socket.split();

    let outbound = sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))));
    // Control and binary frames carry no commands.
    let inbound = stream.try_filter_map(|message| {
        future::ready(Ok(match message {
            Message::Text(text) => Some(text),
            _ => None,
        }))
    });

    let pump = SessionPump::new(broker);
    let session_id = pump.id();
    info!(%session_id, "websocket connected");

    let reason = pump.run(inbound, outbound).await;
    info!(%session_id, %reason, "websocket closed");
}
