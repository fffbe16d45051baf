//! WebSocket Handler
//!
//! One task per socket. It forwards inbound frames to the hub actor and
//! drains the connection's outbound channel onto the socket. It holds no
//! relay state of its own.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::actor::RelayHandle;
use crate::registry::{Outbound, outbound_channel};

/// Handle a relay WebSocket connection
pub async fn handle_relay_ws(socket: WebSocket, hub: RelayHandle) {
    let conn_id = Uuid::new_v4();
    info!(conn_id = %conn_id, "New relay WebSocket connection");

    let (tx, mut rx) = outbound_channel();
    if hub.opened(conn_id, tx).await.is_err() {
        warn!(conn_id = %conn_id, "Relay hub is gone, dropping connection");
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to send hub output to the WebSocket
    let sender_task = async move {
        while let Some(frame) = rx.recv().await {
            let msg = match frame {
                Outbound::Text(json) => Message::Text(json.into()),
                Outbound::Binary(bytes) => Message::Binary(bytes),
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                Outbound::Terminate => break,
            };
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    };

    // Task to forward incoming frames to the hub
    let hub_input = hub.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            let forwarded = match msg {
                Ok(Message::Text(text)) => hub_input.text(conn_id, text.to_string()).await,
                Ok(Message::Binary(data)) => hub_input.binary(conn_id, data).await,
                Ok(Message::Pong(_)) => hub_input.pong(conn_id).await,
                // axum answers pings itself
                Ok(Message::Ping(_)) => Ok(()),
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %conn_id, "Client closed connection");
                    break;
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, "WebSocket error: {}", e);
                    break;
                }
            };
            if forwarded.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %conn_id, "Sender task ended"),
        _ = input_task => debug!(conn_id = %conn_id, "Input task ended"),
    }

    let _ = hub.closed(conn_id).await;
    info!(conn_id = %conn_id, "Relay WebSocket connection closed");
}
