use std::{sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use super::{
    connection::RealtimeConnection,
    frames::{ClientFrame, ServerFrame},
};
use crate::common::errors::{PartyError, PartyResult, with_timeout};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Opens a realtime connection to a relay over WebSocket.
pub async fn connect(
    url: &str,
    connect_timeout: Duration,
    subscribe_timeout: Duration,
) -> PartyResult<Arc<RealtimeConnection>> {
    debug!("Connecting to realtime relay: {}", url);

    let (ws_stream, _) = with_timeout("realtime connect", connect_timeout, async {
        tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| PartyError::Channel(format!("connect failed: {}", e)))
    })
    .await?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, out_rx) = flume::unbounded::<ClientFrame>();
    let (in_tx, in_rx) = flume::unbounded::<ServerFrame>();
    let connection = RealtimeConnection::new(out_tx, in_rx, subscribe_timeout);

    let cancel = connection.closed_token();
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => ClientFrame::Heartbeat,
                frame = out_rx.recv_async() => match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };

            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to encode frame: {}", e);
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json.into())).await {
                warn!("WS write error: {}", e);
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
        cancel.cancel();
    });

    let cancel = connection.closed_token();
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring malformed server frame: {}", e),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Relay closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WS read error: {}", e);
                    break;
                }
                None => break,
            }
        }
        // Dropping `in_tx` lets the router fail every channel.
        cancel.cancel();
    });

    Ok(connection)
}
