use std::{collections::HashMap, sync::Arc};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    merge::{merge_snapshot, ordered, snapshot_contains},
    sweep::stale_members,
};
use crate::{
    backoff::BackoffController,
    common::{
        errors::{PartyError, PartyResult, with_timeout},
        types::{MemberId, now_ms},
    },
    configs::PresenceConfig,
    protocol::{PartyMember, PresenceEntry, PresenceStatus, Profile, VoiceState},
    realtime::{ChannelConfig, ChannelEvent, RealtimeChannel, RealtimeClient},
};

type InitFuture = Shared<BoxFuture<'static, PartyResult<()>>>;

#[derive(Default)]
struct DirectoryState {
    me: Option<PresenceEntry>,
    channel: Option<Arc<dyn RealtimeChannel>>,
    members: HashMap<MemberId, PresenceEntry>,
    /// Latest voice state per member, which can be newer than what the
    /// presence record carries.
    voices: HashMap<MemberId, VoiceState>,
    /// Local time each member was last confirmed by a snapshot.
    observed: HashMap<MemberId, Instant>,
}

/// Health of the presence channel as the owner should see it.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PresenceLink {
    #[default]
    Offline,
    Online,
    Reconnecting,
    /// Recovery ran out of attempts. The directory has been reset and needs
    /// a fresh `initialize`.
    Lost(PartyError),
}

/// Outcome of one stale sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<MemberId>,
    /// Our own record is missing from the snapshot and must be re-tracked.
    pub self_missing: bool,
}

/// Membership view of the party, derived from the shared presence channel.
///
/// `initialize` and `cleanup` are serialized by the lifecycle lock. Inbound
/// channel events, the stale sweep and `cleanup` additionally share the event
/// gate, so at most one of them mutates the directory at a time.
pub struct PresenceDirectory {
    client: Arc<dyn RealtimeClient>,
    topic: String,
    config: PresenceConfig,
    state: Mutex<DirectoryState>,
    lifecycle: tokio::sync::Mutex<()>,
    gate: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<(u64, InitFuture)>>,
    generation: Mutex<u64>,
    /// Cancels the event pump, sweep, heartbeat and any backoff wait of the
    /// current session.
    session: Mutex<CancellationToken>,
    members_tx: watch::Sender<Vec<PresenceEntry>>,
    link_tx: watch::Sender<PresenceLink>,
}

impl PresenceDirectory {
    pub fn new(
        client: Arc<dyn RealtimeClient>,
        topic: impl Into<String>,
        config: PresenceConfig,
    ) -> Arc<Self> {
        let session = CancellationToken::new();
        session.cancel();
        Arc::new(Self {
            client,
            topic: topic.into(),
            config,
            state: Mutex::new(DirectoryState::default()),
            lifecycle: tokio::sync::Mutex::new(()),
            gate: tokio::sync::Mutex::new(()),
            inflight: Mutex::new(None),
            generation: Mutex::new(0),
            session: Mutex::new(session),
            members_tx: watch::channel(Vec::new()).0,
            link_tx: watch::channel(PresenceLink::Offline).0,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Visible members, oldest first. Updated on every change.
    pub fn members(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.members_tx.subscribe()
    }

    pub fn link(&self) -> watch::Receiver<PresenceLink> {
        self.link_tx.subscribe()
    }

    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.members_tx.borrow().clone()
    }

    pub fn get(&self, id: &MemberId) -> Option<PresenceEntry> {
        self.state.lock().members.get(id).cloned()
    }

    pub fn self_entry(&self) -> Option<PresenceEntry> {
        self.state.lock().me.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    fn is_active(&self) -> bool {
        if self.session.lock().is_cancelled() {
            return false;
        }
        let state = self.state.lock();
        state.me.is_some() && state.channel.is_some()
    }

    fn publish(&self, members: &HashMap<MemberId, PresenceEntry>) {
        self.members_tx.send_replace(ordered(members));
    }

    /// Subscribes to the presence topic, tracks `me` and loads the initial
    /// snapshot. A no-op when already initialized; concurrent callers share
    /// one attempt and its result.
    pub async fn initialize(self: &Arc<Self>, me: PartyMember) -> PartyResult<()> {
        let (generation, init) = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some(current) => current.clone(),
                None => {
                    if self.is_active() {
                        return Ok(());
                    }

                    // A session still trying to reconnect is superseded.
                    let session = CancellationToken::new();
                    std::mem::replace(&mut *self.session.lock(), session.clone()).cancel();

                    let generation = {
                        let mut counter = self.generation.lock();
                        *counter += 1;
                        *counter
                    };

                    // The task clears its own slot so an abandoned attempt is
                    // never handed to a later caller.
                    let this = self.clone();
                    let task = tokio::spawn(async move {
                        let result = this.clone().initialize_locked(me, session).await;
                        this.clear_inflight(generation);
                        result
                    });
                    let init: InitFuture = async move {
                        match task.await {
                            Ok(result) => result,
                            Err(e) => Err(PartyError::Channel(format!(
                                "presence initialize aborted: {}",
                                e
                            ))),
                        }
                    }
                    .boxed()
                    .shared();

                    *inflight = Some((generation, init.clone()));
                    (generation, init)
                }
            }
        };

        let result = init.await;
        self.clear_inflight(generation);
        result
    }

    fn clear_inflight(&self, generation: u64) {
        let mut inflight = self.inflight.lock();
        if inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
            *inflight = None;
        }
    }

    async fn initialize_locked(
        self: Arc<Self>,
        me: PartyMember,
        session: CancellationToken,
    ) -> PartyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if session.is_cancelled() {
            return Err(PartyError::Cancelled);
        }

        let id = me.id.clone();
        {
            let mut state = self.state.lock();
            state.me = Some(PresenceEntry::new(me, VoiceState::default()));
            state.observed.clear();
        }

        let ctl = BackoffController::new(
            format!("{} presence", id),
            self.config.backoff.policy(),
            session.clone(),
        );
        let opened = ctl
            .attempt(
                |_| self.clone().open_channel(),
                |e| error!("[{}] presence channel unavailable: {}", self.topic, e),
            )
            .await;

        let channel = match opened {
            Ok(channel) => channel,
            Err(e) => {
                session.cancel();
                let mut state = self.state.lock();
                state.me = None;
                state.members.clear();
                self.publish(&state.members);
                return Err(e);
            }
        };

        if !self.install(channel.clone(), &session) {
            let _ = channel.unsubscribe().await;
            return Err(PartyError::Cancelled);
        }
        {
            let _gate = self.gate.lock().await;
            self.refresh(&*channel);
        }

        tokio::spawn(self.clone().pump(channel, session.clone()));
        tokio::spawn(self.clone().sweep_loop(session.clone()));
        tokio::spawn(self.clone().heartbeat_loop(session));

        info!("[{}] {} joined presence", self.topic, id);
        Ok(())
    }

    async fn open_channel(self: Arc<Self>) -> PartyResult<Arc<dyn RealtimeChannel>> {
        let me = self.state.lock().me.clone().ok_or(PartyError::Cancelled)?;
        let channel = self
            .client
            .subscribe(&self.topic, ChannelConfig::presence(me.id().0.clone()))
            .await?;

        let tracked = with_timeout(
            "presence track",
            self.config.subscribe_timeout(),
            channel.track(me.to_meta()),
        )
        .await;
        if let Err(e) = tracked {
            let _ = channel.unsubscribe().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Stores `channel` as the live one unless the session ended meanwhile.
    fn install(&self, channel: Arc<dyn RealtimeChannel>, session: &CancellationToken) -> bool {
        let mut state = self.state.lock();
        if session.is_cancelled() {
            return false;
        }
        state.channel = Some(channel);
        self.link_tx.send_replace(PresenceLink::Online);
        true
    }

    /// Rebuilds the member list from the channel's snapshot.
    fn refresh(&self, channel: &dyn RealtimeChannel) {
        let snapshot = channel.presence_state();
        let mut state = self.state.lock();
        let DirectoryState {
            me,
            members,
            voices,
            observed,
            ..
        } = &mut *state;
        *members = merge_snapshot(&snapshot, me.as_ref(), voices);
        let now = Instant::now();
        for id in members.keys() {
            observed.insert(id.clone(), now);
        }
        observed.retain(|id, _| members.contains_key(id));
        self.publish(members);
    }

    fn on_leave(&self, channel: &dyn RealtimeChannel, key: &str, metas: &[serde_json::Value]) {
        let id = MemberId::from(key);
        let departed = metas
            .iter()
            .filter_map(PresenceEntry::from_meta)
            .any(|e| e.status == PresenceStatus::Left);
        if snapshot_contains(&channel.presence_state(), &id) {
            return;
        }

        let mut state = self.state.lock();
        if state.me.as_ref().is_some_and(|me| me.id() == &id) {
            return;
        }
        if departed {
            if state.members.remove(&id).is_some() {
                debug!("[{}] {} left", self.topic, id);
            }
            state.voices.remove(&id);
            state.observed.remove(&id);
        } else if let Some(entry) = state.members.get_mut(&id) {
            entry.status = PresenceStatus::Idle;
        }
        self.publish(&state.members);
    }

    /// Processes channel events in order, one at a time, reopening the
    /// channel with backoff whenever it fails.
    async fn pump(self: Arc<Self>, mut channel: Arc<dyn RealtimeChannel>, session: CancellationToken) {
        loop {
            self.drain_events(&*channel, &session).await;
            if session.is_cancelled() {
                return;
            }
            match self.reopen(channel, &session).await {
                Ok(fresh) => channel = fresh,
                Err(PartyError::Cancelled) => return,
                Err(e) => {
                    self.abandon(&session, e).await;
                    return;
                }
            }
        }
    }

    /// Resets the directory after recovery gave up, so the owner sees the
    /// loss and a later `initialize` starts over.
    async fn abandon(&self, session: &CancellationToken, err: PartyError) {
        let _gate = self.gate.lock().await;
        if session.is_cancelled() {
            return;
        }
        session.cancel();
        {
            let mut state = self.state.lock();
            state.channel = None;
            state.me = None;
            state.members.clear();
            state.voices.clear();
            state.observed.clear();
            self.publish(&state.members);
        }
        error!("[{}] presence lost: {}", self.topic, err);
        self.link_tx.send_replace(PresenceLink::Lost(err));
    }

    /// Returns once the channel failed or the session ended.
    async fn drain_events(&self, channel: &dyn RealtimeChannel, session: &CancellationToken) {
        let events = channel.events();
        loop {
            let event = tokio::select! {
                _ = session.cancelled() => return,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };

            let _gate = self.gate.lock().await;
            if session.is_cancelled() {
                return;
            }
            match event {
                ChannelEvent::Sync => self.refresh(channel),
                ChannelEvent::Join { key, .. } => {
                    trace!("[{}] join {}", self.topic, key);
                    self.refresh(channel);
                }
                ChannelEvent::Leave { key, metas } => {
                    trace!("[{}] leave {}", self.topic, key);
                    self.on_leave(channel, &key, &metas);
                }
                ChannelEvent::Status(status) if status.is_failure() => {
                    warn!("[{}] presence channel failed: {:?}", self.topic, status);
                    return;
                }
                ChannelEvent::Status(status) => {
                    debug!("[{}] presence channel {:?}", self.topic, status);
                }
                ChannelEvent::Broadcast { .. } => {}
            }
        }
    }

    async fn reopen(
        self: &Arc<Self>,
        failed: Arc<dyn RealtimeChannel>,
        session: &CancellationToken,
    ) -> PartyResult<Arc<dyn RealtimeChannel>> {
        {
            let mut state = self.state.lock();
            if state.channel.as_ref().is_some_and(|c| Arc::ptr_eq(c, &failed)) {
                state.channel = None;
                self.link_tx.send_replace(PresenceLink::Reconnecting);
            }
        }
        let _ = failed.unsubscribe().await;

        let ctl = BackoffController::new(
            format!("{} presence", self.topic),
            self.config.backoff.policy(),
            session.clone(),
        );
        let fresh = ctl
            .reattempt(
                |_| self.clone().open_channel(),
                |e| error!("[{}] presence channel lost for good: {}", self.topic, e),
            )
            .await?;

        if !self.install(fresh.clone(), session) {
            let _ = fresh.unsubscribe().await;
            return Err(PartyError::Cancelled);
        }
        {
            let _gate = self.gate.lock().await;
            self.refresh(&*fresh);
        }
        info!("[{}] presence channel recovered", self.topic);
        Ok(fresh)
    }

    /// Removes non-self members that have had no live presence record for
    /// `stale_after`, and reports whether our own record went missing from
    /// the snapshot.
    pub fn sweep_stale(&self, now: Instant) -> SweepReport {
        let mut state = self.state.lock();
        let snapshot = state.channel.as_ref().map(|c| c.presence_state());
        let self_id = state.me.as_ref().map(|me| me.id().clone());

        let DirectoryState {
            members,
            voices,
            observed,
            ..
        } = &mut *state;
        let removed = stale_members(
            members,
            observed,
            |id| snapshot.as_ref().is_some_and(|s| snapshot_contains(s, id)),
            self_id.as_ref(),
            now,
            self.config.stale_after(),
        );
        for id in &removed {
            members.remove(id);
        }
        voices.retain(|id, _| members.contains_key(id));

        if !removed.is_empty() {
            info!("[{}] swept stale members: {:?}", self.topic, removed);
            self.publish(&state.members);
        }

        let self_missing = match (&self_id, &snapshot) {
            (Some(id), Some(snapshot)) => !snapshot_contains(snapshot, id),
            _ => false,
        };
        SweepReport {
            removed,
            self_missing,
        }
    }

    async fn sweep_loop(self: Arc<Self>, session: CancellationToken) {
        let period = self.config.sweep_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = interval.tick() => {}
            }

            let report = {
                let _gate = self.gate.lock().await;
                if session.is_cancelled() {
                    return;
                }
                self.sweep_stale(Instant::now())
            };
            if report.self_missing {
                warn!("[{}] own presence record missing, re-announcing", self.topic);
                if let Err(e) = self.retrack().await {
                    warn!("[{}] re-announce failed: {}", self.topic, e);
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, session: CancellationToken) {
        let period = self.config.heartbeat_interval();
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.retrack().await {
                debug!("[{}] presence heartbeat failed: {}", self.topic, e);
            }
        }
    }

    /// Re-tracks our own record with a fresh `last_seen`.
    async fn retrack(&self) -> PartyResult<()> {
        let (channel, meta) = {
            let mut state = self.state.lock();
            let Some(me) = state.me.as_mut() else {
                return Ok(());
            };
            me.member.last_seen = now_ms();
            let meta = me.to_meta();
            (state.channel.clone(), meta)
        };
        let Some(channel) = channel else {
            return Ok(());
        };
        with_timeout(
            "presence track",
            self.config.subscribe_timeout(),
            channel.track(meta),
        )
        .await
    }

    /// Records a voice update for `id`. Our own updates also refresh the
    /// record we track.
    pub fn apply_voice(&self, id: &MemberId, voice: VoiceState) {
        let mut state = self.state.lock();
        if let Some(me) = state.me.as_mut() {
            if me.id() == id {
                me.voice = voice.clone();
            }
        }
        if let Some(entry) = state.members.get_mut(id) {
            entry.voice = voice.clone();
        }
        state.voices.insert(id.clone(), voice);
        self.publish(&state.members);
    }

    /// Applies a profile edit to our record and re-tracks it.
    pub async fn update_self(&self, profile: Profile) -> PartyResult<PartyMember> {
        let (channel, meta, member) = {
            let mut state = self.state.lock();
            let Some(me) = state.me.as_mut() else {
                return Err(PartyError::Validation("not in the party".into()));
            };
            me.member.apply_profile(profile);
            me.member.last_seen = now_ms();
            let me = me.clone();
            state.members.insert(me.id().clone(), me.clone());
            self.publish(&state.members);
            (state.channel.clone(), me.to_meta(), me.member)
        };

        if let Some(channel) = channel {
            with_timeout(
                "presence track",
                self.config.subscribe_timeout(),
                channel.track(meta),
            )
            .await?;
        }
        Ok(member)
    }

    /// Announces that we left, then unsubscribes. Local state is cleared even
    /// when the remote side cannot be reached.
    pub async fn cleanup(&self) -> PartyResult<()> {
        self.session.lock().cancel();
        let _lifecycle = self.lifecycle.lock().await;
        let _gate = self.gate.lock().await;

        let (channel, me) = {
            let mut state = self.state.lock();
            let channel = state.channel.take();
            let me = state.me.take();
            state.members.clear();
            state.voices.clear();
            state.observed.clear();
            self.publish(&state.members);
            (channel, me)
        };
        self.link_tx.send_replace(PresenceLink::Offline);

        let Some(channel) = channel else {
            return Ok(());
        };
        let timeout = self.config.subscribe_timeout();

        if let Some(mut me) = me {
            me.status = PresenceStatus::Left;
            me.member.last_seen = now_ms();
            if let Err(e) = with_timeout("presence track", timeout, channel.track(me.to_meta())).await
            {
                debug!("[{}] could not announce leave: {}", self.topic, e);
            }
            info!("[{}] {} left presence", self.topic, me.id());
        }
        if let Err(e) = with_timeout("presence untrack", timeout, channel.untrack()).await {
            debug!("[{}] untrack failed: {}", self.topic, e);
        }
        if let Err(e) = with_timeout("presence unsubscribe", timeout, channel.unsubscribe()).await {
            debug!("[{}] unsubscribe failed: {}", self.topic, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        protocol::VoiceStatus,
        realtime::{LocalHub, RealtimeConnection},
    };

    const TOPIC: &str = "presence:party";

    fn member(id: &str) -> PartyMember {
        PartyMember::new(MemberId::from(id), Profile::new(id, "", "").unwrap())
    }

    fn directory(hub: &LocalHub) -> (Arc<PresenceDirectory>, Arc<RealtimeConnection>) {
        let conn = hub.connect(Duration::from_secs(5));
        let dir = PresenceDirectory::new(conn.clone(), TOPIC, PresenceConfig::default());
        (dir, conn)
    }

    async fn wait_for_ids(dir: &PresenceDirectory, expected: &[&str]) {
        let mut rx = dir.members();
        rx.wait_for(|members| {
            let mut ids: Vec<&str> = members.iter().map(|m| m.id().0.as_str()).collect();
            ids.sort();
            ids == expected
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn members_see_each_other_and_departures() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        let (bob, _c2) = directory(&hub);

        ann.initialize(member("ann")).await.unwrap();
        bob.initialize(member("bob")).await.unwrap();
        wait_for_ids(&ann, &["ann", "bob"]).await;
        wait_for_ids(&bob, &["ann", "bob"]).await;

        bob.cleanup().await.unwrap();
        assert!(bob.snapshot().is_empty());
        assert!(!bob.is_connected());
        wait_for_ids(&ann, &["ann"]).await;
    }

    #[tokio::test]
    async fn concurrent_initialize_subscribes_once() {
        let hub = LocalHub::new();
        hub.set_subscribe_delay(Some(Duration::from_millis(50)));
        let (dir, _conn) = directory(&hub);

        let (a, b) = tokio::join!(dir.initialize(member("ann")), dir.initialize(member("ann")));
        assert_eq!(a, Ok(()));
        assert_eq!(b, Ok(()));
        assert_eq!(hub.subscribe_count(TOPIC), 1);

        dir.initialize(member("ann")).await.unwrap();
        assert_eq!(hub.subscribe_count(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_retries_then_gives_up() {
        let hub = LocalHub::new();
        hub.reject_subscribes(TOPIC, 100);
        let (dir, _conn) = directory(&hub);

        let err = dir.initialize(member("ann")).await.unwrap_err();
        assert!(matches!(err, PartyError::Exhausted { attempts: 5, .. }));
        assert_eq!(hub.subscribe_count(TOPIC), 5);
        assert!(dir.self_entry().is_none());

        hub.reject_subscribes(TOPIC, 0);
        dir.initialize(member("ann")).await.unwrap();
        assert!(dir.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_survives_transient_rejections() {
        let hub = LocalHub::new();
        hub.reject_subscribes(TOPIC, 2);
        let (dir, _conn) = directory(&hub);

        dir.initialize(member("ann")).await.unwrap();
        assert_eq!(hub.subscribe_count(TOPIC), 3);
        wait_for_ids(&dir, &["ann"]).await;
    }

    #[tokio::test]
    async fn dropped_connection_disappears() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        let (bob, bob_conn) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        bob.initialize(member("bob")).await.unwrap();
        wait_for_ids(&ann, &["ann", "bob"]).await;

        bob_conn.close();
        wait_for_ids(&ann, &["ann"]).await;
    }

    #[tokio::test]
    async fn sweep_keeps_live_members_whatever_their_clock_says() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();

        // Bob's clock runs three minutes behind ours.
        let bob_conn = hub.connect(Duration::from_secs(5));
        let bob_channel = bob_conn
            .subscribe(TOPIC, ChannelConfig::presence("bob"))
            .await
            .unwrap();
        let mut bob = PresenceEntry::new(member("bob"), VoiceState::default());
        bob.member.last_seen = now_ms() - 180_000;
        bob_channel.track(bob.to_meta()).await.unwrap();
        wait_for_ids(&ann, &["ann", "bob"]).await;

        let report = ann.sweep_stale(Instant::now() + Duration::from_secs(600));
        assert!(report.removed.is_empty());
        assert!(ann.get(&MemberId::from("bob")).is_some());
    }

    #[tokio::test]
    async fn sweep_drops_members_missing_from_presence() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        wait_for_ids(&ann, &["ann"]).await;

        // An entry kept around by a leave that did not say `left`.
        let bob = PresenceEntry::new(member("bob"), VoiceState::default());
        ann.state.lock().members.insert(bob.id().clone(), bob);

        let start = Instant::now();
        assert!(ann.sweep_stale(start + Duration::from_secs(60)).removed.is_empty());
        assert!(ann.get(&MemberId::from("bob")).is_some());

        let report = ann.sweep_stale(start + Duration::from_secs(181));
        assert_eq!(report.removed, vec![MemberId::from("bob")]);
        assert!(!report.self_missing);
        wait_for_ids(&ann, &["ann"]).await;
    }

    #[tokio::test]
    async fn sweep_never_removes_self_and_spots_a_lost_record() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        wait_for_ids(&ann, &["ann"]).await;

        let far_future = Instant::now() + Duration::from_secs(600);
        let channel = ann.state.lock().channel.clone().unwrap();
        channel.untrack().await.unwrap();
        let mut rx = ann.members();
        // Wait for the untrack to land in the snapshot.
        while snapshot_contains(&channel.presence_state(), &MemberId::from("ann")) {
            tokio::time::timeout(Duration::from_millis(50), rx.changed()).await.ok();
        }

        let report = ann.sweep_stale(far_future);
        assert!(report.removed.is_empty());
        assert!(report.self_missing);
        assert!(ann.get(&MemberId::from("ann")).is_some());

        ann.retrack().await.unwrap();
        while !snapshot_contains(&channel.presence_state(), &MemberId::from("ann")) {
            tokio::time::timeout(Duration::from_millis(50), rx.changed()).await.ok();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_the_topic_is_reset() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        let (bob, _c2) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        bob.initialize(member("bob")).await.unwrap();
        wait_for_ids(&bob, &["ann", "bob"]).await;

        hub.kick(TOPIC);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.registry().subscriber_count(TOPIC), 0);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        wait_for_ids(&bob, &["ann", "bob"]).await;
        wait_for_ids(&ann, &["ann", "bob"]).await;
        assert!(ann.is_connected());
        assert_eq!(hub.registry().subscriber_count(TOPIC), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_presence_resets_and_can_start_over() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        let mut link = ann.link();
        assert_eq!(*link.borrow(), PresenceLink::Online);

        hub.reject_subscribes(TOPIC, 1_000);
        hub.kick(TOPIC);
        link.wait_for(|l| matches!(l, PresenceLink::Lost(PartyError::Exhausted { .. })))
            .await
            .unwrap();
        assert!(ann.self_entry().is_none());
        assert!(ann.snapshot().is_empty());
        assert!(!ann.is_connected());

        hub.reject_subscribes(TOPIC, 0);
        let before = hub.subscribe_count(TOPIC);
        ann.initialize(member("ann")).await.unwrap();
        assert_eq!(hub.subscribe_count(TOPIC), before + 1);
        assert!(ann.is_connected());
        assert_eq!(*link.borrow(), PresenceLink::Online);
        wait_for_ids(&ann, &["ann"]).await;
    }

    #[tokio::test]
    async fn voice_updates_outlive_older_presence_records() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        let (bob, _c2) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        bob.initialize(member("bob")).await.unwrap();
        wait_for_ids(&ann, &["ann", "bob"]).await;

        let speaking = VoiceState {
            voice_status: VoiceStatus::Speaking,
            level: 0.8,
            timestamp: now_ms() + 60_000,
            ..VoiceState::default()
        };
        ann.apply_voice(&MemberId::from("bob"), speaking.clone());

        // Bob's heartbeat carries an older voice state.
        bob.retrack().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ann.get(&MemberId::from("bob")).unwrap().voice, speaking);
    }

    #[tokio::test]
    async fn profile_edits_reach_peers() {
        let hub = LocalHub::new();
        let (ann, _c1) = directory(&hub);
        let (bob, _c2) = directory(&hub);
        ann.initialize(member("ann")).await.unwrap();
        bob.initialize(member("bob")).await.unwrap();

        let updated = ann
            .update_self(Profile::new("Ann", "b.png", "AFK").unwrap())
            .await
            .unwrap();
        assert_eq!(updated.status_text, "AFK");

        let mut rx = bob.members();
        rx.wait_for(|members| {
            members
                .iter()
                .any(|m| m.id() == &MemberId::from("ann") && m.member.status_text == "AFK")
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cleanup_without_initialize_is_fine() {
        let hub = LocalHub::new();
        let (dir, _conn) = directory(&hub);
        assert_eq!(dir.cleanup().await, Ok(()));
        assert!(dir.update_self(Profile::new("x", "", "").unwrap()).await.is_err());
    }
}
