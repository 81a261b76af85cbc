use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{
    ChannelConfig, RealtimeChannel, RealtimeClient,
    channel::{ChannelHandle, Routes},
    frames::{ClientFrame, ServerFrame},
};
use crate::common::errors::{PartyError, PartyResult};

/// One multiplexed link to the relay. Server frames are routed to the
/// [`ChannelHandle`] subscribed to their topic.
///
/// The link itself is two frame queues, so the same runtime works over a
/// WebSocket or an in-process hub.
pub struct RealtimeConnection {
    outbound: flume::Sender<ClientFrame>,
    routes: Arc<Routes>,
    subscribe_timeout: Duration,
    cancel_token: CancellationToken,
}

impl Drop for RealtimeConnection {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl RealtimeConnection {
    pub fn new(
        outbound: flume::Sender<ClientFrame>,
        inbound: flume::Receiver<ServerFrame>,
        subscribe_timeout: Duration,
    ) -> Arc<Self> {
        let routes = Arc::new(Routes::new());
        let cancel_token = CancellationToken::new();

        tokio::spawn(Self::route(inbound, routes.clone(), cancel_token.clone()));

        Arc::new(Self {
            outbound,
            routes,
            subscribe_timeout,
            cancel_token,
        })
    }

    async fn route(
        inbound: flume::Receiver<ServerFrame>,
        routes: Arc<Routes>,
        cancel: CancellationToken,
    ) {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbound.recv_async() => match frame {
                    Ok(frame) => frame,
                    Err(_) => break,
                },
            };

            let Some(topic) = frame.topic() else {
                trace!("heartbeat ack");
                continue;
            };
            let handle = routes.get(topic).map(|r| r.value().clone());
            match handle {
                Some(handle) => handle.handle_frame(frame),
                None => trace!("[{}] frame for unrouted topic dropped", topic),
            }
        }

        debug!("realtime connection closed, failing {} channels", routes.len());
        let handles: Vec<Arc<ChannelHandle>> = routes.iter().map(|r| r.value().clone()).collect();
        for handle in handles {
            handle.fail("connection lost");
        }
    }

    /// Fires when the connection shuts down, whether dropped or closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn close(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

#[async_trait]
impl RealtimeClient for RealtimeConnection {
    async fn subscribe(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> PartyResult<Arc<dyn RealtimeChannel>> {
        if self.is_closed() {
            return Err(PartyError::Channel("connection closed".into()));
        }

        let (handle, ack) = ChannelHandle::new(
            topic.to_string(),
            config,
            self.outbound.clone(),
            Arc::downgrade(&self.routes),
        );
        if let Some(previous) = self.routes.insert(topic.to_string(), handle.clone()) {
            debug!("[{}] replacing previous subscription", topic);
            previous.fail("superseded");
        }

        self.outbound
            .send(handle.subscribe_frame())
            .map_err(|_| PartyError::Channel("connection closed".into()))?;

        match tokio::time::timeout(self.subscribe_timeout, ack).await {
            Ok(Ok(Ok(()))) => Ok(handle as Arc<dyn RealtimeChannel>),
            Ok(Ok(Err(err))) => {
                self.routes
                    .remove_if(topic, |_, current| Arc::ptr_eq(current, &handle));
                Err(err)
            }
            Ok(Err(_)) => {
                self.routes
                    .remove_if(topic, |_, current| Arc::ptr_eq(current, &handle));
                Err(PartyError::Channel("subscription abandoned".into()))
            }
            Err(_) => {
                warn!("[{}] subscribe timed out after {:?}", topic, self.subscribe_timeout);
                handle.timed_out();
                Err(PartyError::Timeout {
                    operation: "channel subscribe",
                    after: self.subscribe_timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::realtime::{ChannelEvent, ChannelStatus};

    fn pair() -> (Arc<RealtimeConnection>, flume::Receiver<ClientFrame>, flume::Sender<ServerFrame>) {
        let (out_tx, out_rx) = flume::unbounded();
        let (in_tx, in_rx) = flume::unbounded();
        let conn = RealtimeConnection::new(out_tx, in_rx, Duration::from_secs(10));
        (conn, out_rx, in_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_waits_for_confirmation() {
        let (conn, out, inbound) = pair();
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.subscribe("voice:party", ChannelConfig::broadcast("me")).await }
        });

        let frame = out.recv_async().await.unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { broadcast_self: true, .. }));
        inbound
            .send(ServerFrame::Subscribed { topic: "voice:party".into() })
            .unwrap();

        let channel = task.await.unwrap().unwrap();
        assert_eq!(channel.status(), ChannelStatus::Subscribed);

        inbound
            .send(ServerFrame::Broadcast {
                topic: "voice:party".into(),
                event: "voice_state".into(),
                payload: json!({"x": 1}),
            })
            .unwrap();
        let events = channel.events();
        loop {
            if let ChannelEvent::Broadcast { event, .. } = events.recv_async().await.unwrap() {
                assert_eq!(event, "voice_state");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_times_out() {
        let (conn, _out, _inbound) = pair();
        let result = conn.subscribe("presence:party", ChannelConfig::presence("me")).await;
        assert!(matches!(result, Err(PartyError::Timeout { operation: "channel subscribe", .. })));
        assert!(conn.routes.is_empty());
    }

    #[tokio::test]
    async fn server_error_rejects_subscribe() {
        let (conn, out, inbound) = pair();
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.subscribe("presence:party", ChannelConfig::presence("me")).await }
        });
        out.recv_async().await.unwrap();
        inbound
            .send(ServerFrame::Error {
                topic: "presence:party".into(),
                message: "nope".into(),
            })
            .unwrap();
        assert_eq!(task.await.unwrap().err(), Some(PartyError::Channel("nope".into())));
    }

    #[tokio::test]
    async fn lost_connection_fails_channels() {
        let (conn, out, inbound) = pair();
        let task = tokio::spawn({
            let conn = conn.clone();
            async move { conn.subscribe("presence:party", ChannelConfig::presence("me")).await }
        });
        out.recv_async().await.unwrap();
        inbound
            .send(ServerFrame::Subscribed { topic: "presence:party".into() })
            .unwrap();
        let channel = task.await.unwrap().unwrap();

        drop(inbound);
        let events = channel.events();
        loop {
            if let ChannelEvent::Status(status) = events.recv_async().await.unwrap() {
                if status.is_failure() {
                    break;
                }
            }
        }
        assert!(channel.status().is_failure());
    }
}
