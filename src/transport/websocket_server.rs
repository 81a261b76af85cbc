use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use tracing::{debug, error, info, warn};

use crate::{
    realtime::frames::{ClientFrame, ServerFrame},
    server::AppState,
};

/// `GET /realtime`: upgrades to the frame relay.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let conn = state.registry.next_conn_id();
    let (tx, rx) = flume::unbounded::<ServerFrame>();
    info!("Relay connection opened: {}", conn);

    loop {
        tokio::select! {
            Ok(frame) = rx.recv_async() => {
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode frame for {}: {}", conn, e);
                        continue;
                    }
                };
                if let Err(e) = socket.send(Message::Text(json.into())).await {
                    error!("Socket send error: {} err={}", conn, e);
                    break;
                }
            }
            msg = socket.recv() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket error: {} err={}", conn, e);
                        break;
                    }
                    None => break,
                };

                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(frame) => state.registry.handle(conn, frame, &tx),
                        Err(e) => debug!("Ignoring malformed frame from {}: {}", conn, e),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.registry.disconnect(conn);
    info!("Relay connection closed: {}", conn);
}
