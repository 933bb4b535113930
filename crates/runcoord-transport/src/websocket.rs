//! WebSocket live event stream.
//!
//! Clients send `subscribe` / `unsubscribe` messages naming a session (or no
//! session, for every session) and receive `event` and `lagged` messages for
//! each active subscription.

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt, stream::BoxStream};
use runcoord_coordinator::Coordinator;
use runcoord_core::{Delivery, RunStore, StreamScope};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::protocol::{ClientMessage, ServerMessage};

/// Outbound messages queued per connection before forwarders wait.
const OUTBOUND_BUFFER: usize = 64;

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<S>(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator<S>>>,
) -> impl IntoResponse
where
    S: RunStore + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

async fn handle_socket<S>(socket: WebSocket, coordinator: Arc<Coordinator<S>>)
where
    S: RunStore + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    // Spawn task to forward messages to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<Option<String>, JoinHandle<()>> = HashMap::new();

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                let _ = tx
                    .send(ServerMessage::Error {
                        message: format!("Invalid message: {e}"),
                    })
                    .await;
                continue;
            }
        };

        let reply = match client_msg {
            ClientMessage::Ping => ServerMessage::Pong,
            ClientMessage::Subscribe { session_id } => {
                if let Some(id) = &session_id {
                    if let Err(e) = coordinator.get_session(id).await {
                        let _ = tx
                            .send(ServerMessage::Error {
                                message: e.to_string(),
                            })
                            .await;
                        continue;
                    }
                }
                if !subscriptions.contains_key(&session_id) {
                    let scope = session_id
                        .clone()
                        .map_or(StreamScope::All, StreamScope::Session);
                    let stream = coordinator.broadcaster().stream(&scope);
                    let task = tokio::spawn(forward(stream, session_id.clone(), tx.clone()));
                    subscriptions.insert(session_id.clone(), task);
                    tracing::debug!(?scope, "WebSocket subscribed");
                }
                ServerMessage::Subscribed { session_id }
            }
            ClientMessage::Unsubscribe { session_id } => {
                if let Some(task) = subscriptions.remove(&session_id) {
                    task.abort();
                }
                ServerMessage::Unsubscribed { session_id }
            }
        };

        if tx.send(reply).await.is_err() {
            break;
        }
    }

    for task in subscriptions.into_values() {
        task.abort();
    }
    send_task.abort();
}

async fn forward(
    mut stream: BoxStream<'static, Delivery>,
    session_id: Option<String>,
    tx: mpsc::Sender<ServerMessage>,
) {
    while let Some(delivery) = stream.next().await {
        let msg = match delivery {
            Delivery::Event(event) => ServerMessage::Event { event },
            Delivery::Lagged(skipped) => {
                tracing::warn!(?session_id, skipped, "WebSocket subscriber lagged");
                ServerMessage::Lagged {
                    session_id: session_id.clone(),
                    skipped,
                }
            }
        };
        if tx.send(msg).await.is_err() {
            break;
        }
    }
}
