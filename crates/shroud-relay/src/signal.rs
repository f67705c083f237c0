//! WebSocket transport for the relay namespace.

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::relay::Relay;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Relay>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let max_bytes = relay.config().max_message_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(socket, relay, addr))
}

async fn handle_socket(socket: WebSocket, relay: Relay, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbox) = relay.connect().await;
    info!("connection {} opened from {}", conn, addr);

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let text = match shroud_common::encode(&message) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode {}: {}", message.event(), e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = receiver.next() => {
                let Some(Ok(incoming)) = incoming else { break; };
                let result = match incoming {
                    Message::Text(text) => relay.handle_text(conn, &text).await,
                    Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                        Ok(text) => relay.handle_text(conn, text).await,
                        Err(_) => {
                            debug!("connection {} sent non-UTF-8 binary frame", conn);
                            continue;
                        }
                    },
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if let Err(e) = result {
                    debug!("message from connection {} dropped: {}", conn, e);
                }
            }
        }
    }

    relay.disconnect(conn).await;
    send_task.abort();
    info!("connection {} from {} closed", conn, addr);
}
