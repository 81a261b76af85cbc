use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    connection::RealtimeConnection,
    frames::{ClientFrame, ServerFrame},
    room::RoomRegistry,
};

/// In-process relay: clients talk to a [`RoomRegistry`] through frame queues
/// instead of sockets. Carries a few fault hooks for exercising recovery.
#[derive(Clone, Default)]
pub struct LocalHub {
    registry: Arc<RoomRegistry>,
    subscribes: Arc<DashMap<String, u32>>,
    rejections: Arc<DashMap<String, u32>>,
    subscribe_delay: Arc<Mutex<Option<Duration>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Arc<RoomRegistry>) -> Self {
        Self {
            registry,
            ..Self::default()
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Opens a new client connection. Dropping (or closing) the returned
    /// connection disconnects it from every room.
    pub fn connect(&self, subscribe_timeout: Duration) -> Arc<RealtimeConnection> {
        let (out_tx, out_rx) = flume::unbounded::<ClientFrame>();
        let (in_tx, in_rx) = flume::unbounded::<ServerFrame>();
        let connection = RealtimeConnection::new(out_tx, in_rx, subscribe_timeout);

        let hub = self.clone();
        let closed = connection.closed_token();
        let conn = self.registry.next_conn_id();
        debug!("{} connected to local hub", conn);

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = closed.cancelled() => break,
                    frame = out_rx.recv_async() => match frame {
                        Ok(frame) => frame,
                        Err(_) => break,
                    },
                };

                if let ClientFrame::Subscribe { topic, .. } = &frame {
                    *hub.subscribes.entry(topic.clone()).or_default() += 1;

                    if hub.take_rejection(topic) {
                        let _ = in_tx.send(ServerFrame::Error {
                            topic: topic.clone(),
                            message: "subscribe rejected".into(),
                        });
                        continue;
                    }

                    let delay = *hub.subscribe_delay.lock();
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                }

                hub.registry.handle(conn, frame, &in_tx);
            }
            hub.registry.disconnect(conn);
        });

        connection
    }

    fn take_rejection(&self, topic: &str) -> bool {
        let Some(mut remaining) = self.rejections.get_mut(topic) else {
            return false;
        };
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    /// Number of subscribe frames seen for `topic`, rejected ones included.
    pub fn subscribe_count(&self, topic: &str) -> u32 {
        self.subscribes.get(topic).map(|c| *c).unwrap_or(0)
    }

    /// Rejects the next `times` subscribes to `topic`.
    pub fn reject_subscribes(&self, topic: &str, times: u32) {
        self.rejections.insert(topic.to_string(), times);
    }

    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        *self.subscribe_delay.lock() = delay;
    }

    /// Fails every live subscription on `topic`.
    pub fn kick(&self, topic: &str) {
        self.registry.kick(topic, "channel reset by server");
    }
}
