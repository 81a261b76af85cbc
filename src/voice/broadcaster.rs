use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::debounce::Coalescer;
use crate::{
    backoff::{BackoffController, BackoffPolicy},
    common::{errors::PartyResult, types::MemberId},
    protocol::{VOICE_STATE_EVENT, VoiceBroadcast, VoiceState, VoiceUpdate},
    realtime::{ChannelConfig, ChannelEvent, RealtimeChannel, RealtimeClient},
};

/// Publishes the local member's voice state on the broadcast topic and
/// mirrors everyone else's into the update queue.
pub struct VoiceBroadcaster {
    self_id: MemberId,
    topic: String,
    client: Arc<dyn RealtimeClient>,
    policy: BackoffPolicy,
    channel: RwLock<Option<Arc<dyn RealtimeChannel>>>,
    local: RwLock<Option<VoiceState>>,
    outbound: Coalescer<MemberId, VoiceBroadcast>,
    inbound: Coalescer<MemberId, VoiceUpdate>,
    /// Mute and deafen flags last delivered per remote member.
    delivered: Mutex<HashMap<MemberId, (bool, bool)>>,
    debounce: Duration,
    last_override: Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl VoiceBroadcaster {
    /// Subscribes to `topic` (retrying per `policy`) and starts the send and
    /// receive loops. Remote updates are delivered on `updates`.
    pub async fn start(
        client: Arc<dyn RealtimeClient>,
        topic: impl Into<String>,
        self_id: MemberId,
        debounce: Duration,
        policy: BackoffPolicy,
        updates: flume::Sender<VoiceUpdate>,
    ) -> PartyResult<Arc<Self>> {
        let topic = topic.into();
        let cancel = CancellationToken::new();

        let ctl = BackoffController::new(format!("{} voice", self_id), policy, cancel.clone());
        let channel = ctl
            .attempt(
                |_| Self::subscribe(client.clone(), topic.clone(), self_id.clone()),
                |e| error!("[{}] voice channel unavailable: {}", topic, e),
            )
            .await?;

        let (out_tx, out_rx) = flume::unbounded();
        let broadcaster = Arc::new(Self {
            outbound: Coalescer::new(debounce, out_tx, cancel.clone()),
            inbound: Coalescer::new(debounce, updates, cancel.clone()),
            self_id,
            topic,
            client,
            policy,
            channel: RwLock::new(Some(channel.clone())),
            local: RwLock::new(None),
            delivered: Mutex::new(HashMap::new()),
            debounce,
            last_override: Mutex::new(None),
            cancel,
        });

        tokio::spawn(broadcaster.clone().send_loop(out_rx));
        tokio::spawn(broadcaster.clone().receive_loop(channel));

        debug!("[{}] voice broadcaster started", broadcaster.self_id);
        Ok(broadcaster)
    }

    async fn subscribe(
        client: Arc<dyn RealtimeClient>,
        topic: String,
        self_id: MemberId,
    ) -> PartyResult<Arc<dyn RealtimeChannel>> {
        client
            .subscribe(&topic, ChannelConfig::broadcast(self_id.0))
            .await
    }

    pub fn self_id(&self) -> &MemberId {
        &self.self_id
    }

    /// Last state this client published for itself.
    pub fn local_state(&self) -> Option<VoiceState> {
        self.local.read().clone()
    }

    /// Debounced publish for level and speaking updates.
    pub fn publish(&self, state: VoiceState) {
        let msg = VoiceBroadcast::from_state(self.self_id.clone(), &state);
        *self.local.write() = Some(state);
        self.outbound.push(self.self_id.clone(), msg);
    }

    /// Publishes without waiting for the debounce window. Used for mute,
    /// deafen and connection changes, which peers must see at once.
    pub fn publish_immediate(&self, state: VoiceState) {
        let msg = VoiceBroadcast::from_state(self.self_id.clone(), &state);
        *self.local.write() = Some(state);
        self.outbound.bypass(&self.self_id, msg);
    }

    /// Drops per-member bookkeeping for everyone not in `present`.
    pub fn retain_members(&self, present: &HashSet<MemberId>) {
        self.delivered.lock().retain(|id, _| present.contains(id));
    }

    pub fn tracked_members(&self) -> usize {
        self.delivered.lock().len()
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.unsubscribe().await {
                debug!("[{}] voice unsubscribe failed: {}", self.topic, e);
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send_loop(self: Arc<Self>, out: flume::Receiver<VoiceBroadcast>) {
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = out.recv_async() => match msg {
                    Ok(msg) => msg,
                    Err(_) => break,
                },
            };

            let channel = self.channel.read().clone();
            let Some(channel) = channel else {
                debug!("[{}] voice channel down, dropping update", self.topic);
                continue;
            };
            let payload = match serde_json::to_value(&msg) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("[{}] failed to encode voice update: {}", self.topic, e);
                    continue;
                }
            };
            if let Err(e) = channel.send(VOICE_STATE_EVENT, payload).await {
                debug!("[{}] voice broadcast failed: {}", self.topic, e);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, mut channel: Arc<dyn RealtimeChannel>) {
        loop {
            let events = channel.events();
            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    event = events.recv_async() => event,
                };
                match event {
                    Ok(ChannelEvent::Broadcast { event, payload }) if event == VOICE_STATE_EVENT => {
                        self.handle_broadcast(payload);
                    }
                    Ok(ChannelEvent::Status(status)) if status.is_failure() => {
                        warn!("[{}] voice channel failed: {:?}", self.topic, status);
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }

            if self.cancel.is_cancelled() {
                return;
            }
            *self.channel.write() = None;

            let ctl = BackoffController::new(
                format!("{} voice", self.self_id),
                self.policy,
                self.cancel.clone(),
            );
            let resubscribed = ctl
                .reattempt(
                    |_| Self::subscribe(self.client.clone(), self.topic.clone(), self.self_id.clone()),
                    |e| error!("[{}] voice channel lost for good: {}", self.topic, e),
                )
                .await;

            match resubscribed {
                Ok(fresh) => {
                    debug!("[{}] voice channel recovered", self.topic);
                    *self.channel.write() = Some(fresh.clone());
                    channel = fresh;
                    if let Some(local) = self.local_state() {
                        self.publish_immediate(local);
                    }
                }
                Err(_) => return,
            }
        }
    }

    fn handle_broadcast(&self, payload: Value) {
        let msg: VoiceBroadcast = match serde_json::from_value(payload) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("[{}] ignoring malformed voice update: {}", self.topic, e);
                return;
            }
        };

        if msg.id == self.self_id {
            self.check_echo(&msg);
            return;
        }

        let state = msg.state();
        let flags = (state.muted, state.is_deafened);
        let flags_changed = self
            .delivered
            .lock()
            .insert(msg.id.clone(), flags)
            .is_some_and(|previous| previous != flags);

        let update = VoiceUpdate {
            id: msg.id.clone(),
            state,
            local: false,
        };
        if flags_changed {
            self.inbound.bypass(&msg.id, update);
        } else {
            self.inbound.push(msg.id, update);
        }
    }

    /// Our own broadcasts come back on this topic. One carrying a transport
    /// uid other than ours and an older timestamp is stale and gets
    /// overridden with the real state, at most once per debounce window.
    ///
    /// A newer one comes from another live session with our id. Overriding
    /// that would make both sessions answer each other forever.
    fn check_echo(&self, msg: &VoiceBroadcast) {
        let Some(local) = self.local_state() else {
            return;
        };
        if local.transport_uid == msg.transport_uid {
            return;
        }
        if msg.timestamp >= local.timestamp {
            debug!(
                "[{}] another session is live with uid {:?}, ours is {:?}",
                self.self_id, msg.transport_uid, local.transport_uid
            );
            return;
        }
        {
            let now = Instant::now();
            let mut last = self.last_override.lock();
            if last.is_some_and(|at| now.duration_since(at) < self.debounce) {
                return;
            }
            *last = Some(now);
        }
        warn!(
            "[{}] rejecting self broadcast with uid {:?}, ours is {:?}",
            self.self_id, msg.transport_uid, local.transport_uid
        );
        self.publish_immediate(local);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        common::types::TransportUid,
        protocol::VoiceStatus,
        realtime::{LocalHub, RealtimeConnection},
    };

    const DEBOUNCE: Duration = Duration::from_millis(150);

    async fn start(
        hub: &LocalHub,
        id: &str,
    ) -> (Arc<VoiceBroadcaster>, flume::Receiver<VoiceUpdate>, Arc<RealtimeConnection>) {
        let conn = hub.connect(Duration::from_secs(5));
        let (tx, rx) = flume::unbounded();
        let b = VoiceBroadcaster::start(
            conn.clone(),
            "voice:party",
            MemberId::from(id),
            DEBOUNCE,
            BackoffPolicy::CHANNEL,
            tx,
        )
        .await
        .unwrap();
        (b, rx, conn)
    }

    fn speaking(uid: u32, level: f32) -> VoiceState {
        VoiceState {
            voice_status: VoiceStatus::Speaking,
            level,
            transport_uid: Some(TransportUid(uid)),
            ..VoiceState::default()
        }
    }

    #[tokio::test]
    async fn remote_updates_are_coalesced() {
        let hub = LocalHub::new();
        let (ann, _ann_rx, _c1) = start(&hub, "ann").await;
        let (_bob, bob_rx, _c2) = start(&hub, "bob").await;

        ann.publish(speaking(1, 0.5));
        ann.publish(speaking(1, 0.6));
        ann.publish(speaking(1, 0.7));

        let update = bob_rx.recv_async().await.unwrap();
        assert_eq!(update.id, MemberId::from("ann"));
        assert!(!update.local);
        assert_eq!(update.state.level, 0.7);
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn mute_changes_skip_the_window() {
        let hub = LocalHub::new();
        let (ann, _ann_rx, _c1) = start(&hub, "ann").await;
        let (_bob, bob_rx, _c2) = start(&hub, "bob").await;

        ann.publish_immediate(speaking(1, 0.5));
        bob_rx.recv_async().await.unwrap();

        let started = tokio::time::Instant::now();
        ann.publish_immediate(VoiceState {
            voice_status: VoiceStatus::Muted,
            muted: true,
            ..speaking(1, 0.0)
        });
        let update = bob_rx.recv_async().await.unwrap();
        assert!(update.state.muted);
        assert!(started.elapsed() < DEBOUNCE);
    }

    #[tokio::test]
    async fn stale_self_echo_is_overridden() {
        let hub = LocalHub::new();
        let (ann, _ann_rx, _c1) = start(&hub, "ann").await;
        let (_bob, bob_rx, _c2) = start(&hub, "bob").await;
        ann.publish_immediate(VoiceState {
            timestamp: 5_000,
            ..speaking(7, 0.5)
        });
        bob_rx.recv_async().await.unwrap();

        // A ghost of an older session of ann with another uid.
        ann.handle_broadcast(json!({
            "id": "ann",
            "level": 0.0,
            "voice_status": "silent",
            "muted": false,
            "is_deafened": false,
            "transport_uid": 3,
            "timestamp": 1
        }));

        let update = bob_rx.recv_async().await.unwrap();
        assert_eq!(update.state.transport_uid, Some(TransportUid(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_sessions_do_not_answer_each_other() {
        let hub = LocalHub::new();
        let (first, _rx1, _c1) = start(&hub, "ann").await;
        let (second, _rx2, _c2) = start(&hub, "ann").await;
        let watcher = hub.connect(Duration::from_secs(5));
        let channel = watcher
            .subscribe("voice:party", ChannelConfig::broadcast("eve"))
            .await
            .unwrap();
        let events = channel.events();

        first.publish_immediate(VoiceState {
            timestamp: 1_000,
            ..speaking(1, 0.5)
        });
        second.publish_immediate(VoiceState {
            timestamp: 2_000,
            ..speaking(2, 0.5)
        });

        let mut broadcasts = 0;
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv_async() => match event {
                    Ok(ChannelEvent::Broadcast { .. }) => broadcasts += 1,
                    Ok(_) => {}
                    Err(_) => break,
                },
            }
        }
        // Both publishes plus at most one correction of the older one.
        assert!((2..=3).contains(&broadcasts), "saw {} broadcasts", broadcasts);
    }

    #[tokio::test]
    async fn departed_members_are_forgotten() {
        let hub = LocalHub::new();
        let (ann, _ann_rx, _c1) = start(&hub, "ann").await;
        let (bob, _bob_rx, _c2) = start(&hub, "bob").await;
        let (cat, cat_rx, _c3) = start(&hub, "cat").await;

        ann.publish_immediate(speaking(1, 0.5));
        bob.publish_immediate(speaking(2, 0.5));
        cat_rx.recv_async().await.unwrap();
        cat_rx.recv_async().await.unwrap();
        assert_eq!(cat.tracked_members(), 2);

        cat.retain_members(&HashSet::from([MemberId::from("ann")]));
        assert_eq!(cat.tracked_members(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_the_topic_is_reset() {
        let hub = LocalHub::new();
        let (ann, _ann_rx, _c1) = start(&hub, "ann").await;
        let (_bob, bob_rx, _c2) = start(&hub, "bob").await;

        hub.kick("voice:party");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ann.channel.read().is_none());

        loop {
            if ann.channel.read().is_some() && hub.registry().subscriber_count("voice:party") == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        ann.publish_immediate(speaking(1, 0.9));
        assert_eq!(bob_rx.recv_async().await.unwrap().state.level, 0.9);
    }
}
