use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{
    ChannelConfig, ChannelEvent, ChannelStatus, RealtimeChannel,
    frames::{ClientFrame, PresenceMap, ServerFrame},
};
use crate::common::errors::{PartyError, PartyResult};

pub(crate) type Routes = DashMap<String, Arc<ChannelHandle>>;

/// Client-side view of one subscribed topic.
pub struct ChannelHandle {
    topic: String,
    config: ChannelConfig,
    outbound: flume::Sender<ClientFrame>,
    presence: RwLock<PresenceMap>,
    status: RwLock<ChannelStatus>,
    events_tx: flume::Sender<ChannelEvent>,
    events_rx: flume::Receiver<ChannelEvent>,
    subscribed: Mutex<Option<oneshot::Sender<PartyResult<()>>>>,
    routes: Weak<Routes>,
}

impl ChannelHandle {
    pub(crate) fn new(
        topic: String,
        config: ChannelConfig,
        outbound: flume::Sender<ClientFrame>,
        routes: Weak<Routes>,
    ) -> (Arc<Self>, oneshot::Receiver<PartyResult<()>>) {
        let (events_tx, events_rx) = flume::unbounded();
        let (ack_tx, ack_rx) = oneshot::channel();
        let handle = Arc::new(Self {
            topic,
            config,
            outbound,
            presence: RwLock::new(PresenceMap::new()),
            status: RwLock::new(ChannelStatus::Subscribing),
            events_tx,
            events_rx,
            subscribed: Mutex::new(Some(ack_tx)),
            routes,
        });
        (handle, ack_rx)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub(crate) fn subscribe_frame(&self) -> ClientFrame {
        ClientFrame::Subscribe {
            topic: self.topic.clone(),
            presence_key: self.config.presence_key.clone(),
            broadcast_self: self.config.broadcast_self,
            ack: self.config.ack,
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event);
    }

    fn set_status(&self, status: ChannelStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        self.emit(ChannelEvent::Status(status));
    }

    fn resolve_subscribe(&self, result: PartyResult<()>) {
        if let Some(tx) = self.subscribed.lock().take() {
            let _ = tx.send(result);
        }
    }

    /// Marks the channel failed, e.g. when its connection went away.
    pub(crate) fn fail(&self, reason: &str) {
        if matches!(*self.status.read(), ChannelStatus::Closed) {
            return;
        }
        warn!("[{}] channel failed: {}", self.topic, reason);
        self.resolve_subscribe(Err(PartyError::Channel(reason.to_string())));
        self.set_status(ChannelStatus::ChannelError(reason.to_string()));
    }

    pub(crate) fn timed_out(&self) {
        self.subscribed.lock().take();
        self.set_status(ChannelStatus::TimedOut);
        self.detach();
    }

    pub(crate) fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Subscribed { .. } => {
                debug!("[{}] subscribed", self.topic);
                self.resolve_subscribe(Ok(()));
                self.set_status(ChannelStatus::Subscribed);
            }
            ServerFrame::Error { message, .. } => self.fail(&message),
            ServerFrame::PresenceState { state, .. } => self.apply_state(state),
            ServerFrame::PresenceDiff { joins, leaves, .. } => self.apply_diff(joins, leaves),
            ServerFrame::Broadcast { event, payload, .. } => {
                self.emit(ChannelEvent::Broadcast { event, payload });
            }
            ServerFrame::Ack { event, .. } => trace!("[{}] ack {}", self.topic, event),
            ServerFrame::Closed { .. } => {
                self.set_status(ChannelStatus::Closed);
            }
            ServerFrame::HeartbeatAck => {}
        }
    }

    /// Replaces the snapshot and reports what changed relative to it.
    fn apply_state(&self, state: PresenceMap) {
        let (joins, leaves) = {
            let mut presence = self.presence.write();
            let mut joins = Vec::new();
            let mut leaves = Vec::new();

            for (key, metas) in &state {
                let old = presence.get(key);
                let fresh: Vec<Value> = metas
                    .iter()
                    .filter(|m| old.is_none_or(|old| !old.contains(m)))
                    .cloned()
                    .collect();
                if !fresh.is_empty() {
                    joins.push((key.clone(), fresh));
                }
            }
            for (key, metas) in presence.iter() {
                let new = state.get(key);
                let gone: Vec<Value> = metas
                    .iter()
                    .filter(|m| new.is_none_or(|new| !new.contains(m)))
                    .cloned()
                    .collect();
                if !gone.is_empty() {
                    leaves.push((key.clone(), gone));
                }
            }

            *presence = state;
            (joins, leaves)
        };

        self.emit_changes(joins, leaves);
    }

    fn apply_diff(&self, joins: PresenceMap, leaves: PresenceMap) {
        {
            let mut presence = self.presence.write();
            for (key, metas) in &leaves {
                if let Some(current) = presence.get_mut(key) {
                    current.retain(|m| !metas.contains(m));
                    if current.is_empty() {
                        presence.remove(key);
                    }
                }
            }
            for (key, metas) in &joins {
                presence
                    .entry(key.clone())
                    .or_default()
                    .extend(metas.iter().cloned());
            }
        }

        self.emit_changes(joins.into_iter().collect(), leaves.into_iter().collect());
    }

    fn emit_changes(&self, joins: Vec<(String, Vec<Value>)>, leaves: Vec<(String, Vec<Value>)>) {
        for (key, metas) in joins {
            self.emit(ChannelEvent::Join { key, metas });
        }
        for (key, metas) in leaves {
            self.emit(ChannelEvent::Leave { key, metas });
        }
        self.emit(ChannelEvent::Sync);
    }

    fn ensure_open(&self) -> PartyResult<()> {
        match &*self.status.read() {
            ChannelStatus::Subscribed | ChannelStatus::Subscribing => Ok(()),
            ChannelStatus::ChannelError(reason) => Err(PartyError::Channel(reason.clone())),
            ChannelStatus::Closed => Err(PartyError::Channel("channel closed".into())),
            ChannelStatus::TimedOut => Err(PartyError::Channel("channel timed out".into())),
        }
    }

    fn push(&self, frame: ClientFrame) -> PartyResult<()> {
        self.outbound
            .send(frame)
            .map_err(|_| PartyError::Channel("connection closed".into()))
    }

    fn is_routed(&self) -> bool {
        self.routes
            .upgrade()
            .and_then(|routes| {
                routes
                    .get(&self.topic)
                    .map(|r| std::ptr::eq(Arc::as_ptr(r.value()), self))
            })
            .unwrap_or(false)
    }

    fn detach(&self) {
        if let Some(routes) = self.routes.upgrade() {
            routes.remove_if(&self.topic, |_, current| std::ptr::eq(Arc::as_ptr(current), self));
        }
    }
}

#[async_trait]
impl RealtimeChannel for ChannelHandle {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn status(&self) -> ChannelStatus {
        self.status.read().clone()
    }

    fn presence_state(&self) -> PresenceMap {
        self.presence.read().clone()
    }

    fn events(&self) -> flume::Receiver<ChannelEvent> {
        self.events_rx.clone()
    }

    async fn track(&self, payload: Value) -> PartyResult<()> {
        self.ensure_open()?;
        self.push(ClientFrame::Track {
            topic: self.topic.clone(),
            payload,
        })
    }

    async fn untrack(&self) -> PartyResult<()> {
        self.ensure_open()?;
        self.push(ClientFrame::Untrack {
            topic: self.topic.clone(),
        })
    }

    async fn send(&self, event: &str, payload: Value) -> PartyResult<()> {
        self.ensure_open()?;
        self.push(ClientFrame::Broadcast {
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
        })
    }

    async fn unsubscribe(&self) -> PartyResult<()> {
        let was_open = self.ensure_open().is_ok();
        let routed = self.is_routed();

        self.detach();
        self.set_status(ChannelStatus::Closed);
        self.presence.write().clear();

        // A replaced handle must not close the subscription that superseded it.
        if was_open && routed {
            self.push(ClientFrame::Unsubscribe {
                topic: self.topic.clone(),
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("topic", &self.topic)
            .field("status", &*self.status.read())
            .finish()
    }
}
