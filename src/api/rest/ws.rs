use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::gateway::protocol::{InboundEvent, OutboundEvent};
use crate::gateway::{CourierEventHandler, Session};
use crate::registry::ConnectionHandle;
use crate::state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel(state.config.session.outbound_buffer_size);
    let mut session = Session::new(handle);
    let heartbeat_every = state.config.session.heartbeat_interval;

    info!(connection_id = %session.connection_id(), "websocket client connected");

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_every);
        loop {
            let message = tokio::select! {
                event = outbound.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_string(&event) {
                        Ok(json) => Message::Text(json.into()),
                        Err(err) => {
                            warn!(error = %err, "failed to serialize outbound event for ws");
                            continue;
                        }
                    }
                }
                _ = heartbeat.tick() => Message::Ping(Vec::new().into()),
            };

            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => {
                let Some(Ok(frame)) = frame else { break };
                match frame {
                    Message::Text(text) => match serde_json::from_str::<InboundEvent>(&text) {
                        Ok(event) => {
                            debug!(
                                connection_id = %session.connection_id(),
                                user_id = %event.user_id(),
                                "courier frame"
                            );
                            state.gateway.handle(&mut session, event).await
                        }
                        Err(err) => {
                            debug!(error = %err, "malformed courier frame");
                            session.reply(OutboundEvent::Error {
                                message: format!("malformed frame: {err}"),
                            });
                        }
                    },
                    Message::Pong(_) | Message::Ping(_) => state.gateway.on_heartbeat(&session),
                    Message::Close(_) => break,
                    Message::Binary(_) => session.reply(OutboundEvent::Error {
                        message: "binary frames are not supported".to_string(),
                    }),
                }
            }
        }
    }

    state.gateway.on_disconnect(&session).await;
    send_task.abort();

    info!(
        connection_id = %session.connection_id(),
        courier_id = ?session.courier_id(),
        "websocket client disconnected"
    );
}
