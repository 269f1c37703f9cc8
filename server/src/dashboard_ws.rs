//! Dashboard fan-out (C15)
//!
//! Accepts an operator dashboard's WebSocket subscription, assigns it a
//! session id, registers it in the connection registry so C14/C9/C11/C12
//! can broadcast to it, and pings it every 30 s. The subscriber is
//! read-only from the dashboard's point of view: anything it sends is
//! ignored (control of devices goes through the REST surface, out of scope
//! here), it exists only to receive broadcasts and close cleanly.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn handle_dashboard_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    state.registry.register_dashboard(session_id, tx);
    info!(%session_id, "Dashboard subscribed");

    let mut ticker = tokio::time::interval(PING_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(payload) => {
                        if sink.send(Message::Text(payload.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%session_id, error = %e, "Dashboard read error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.deregister_dashboard(session_id);
    info!(%session_id, "Dashboard disconnected");
}
