use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{state::PartyState, storage::SessionStorage};
use crate::{
    common::{
        errors::{PartyError, PartyResult},
        types::{MemberId, now_ms},
    },
    configs::Config,
    presence::{PresenceDirectory, PresenceLink},
    protocol::{PartyMember, PresenceEntry, Profile, StoredSession, VoiceUpdate},
    realtime::RealtimeClient,
    voice::{VoiceBroadcaster, VoiceDeps, VoiceSession, VoiceSessionState},
};

/// External services the coordinator talks to.
#[derive(Clone)]
pub struct PartyDeps {
    pub realtime: Arc<dyn RealtimeClient>,
    pub voice: VoiceDeps,
    pub storage: Arc<dyn SessionStorage>,
}

/// Components alive while joined. Filled in step by step during `join` so a
/// rollback can tear down whatever got started.
#[derive(Default)]
struct Active {
    voice: Option<Arc<VoiceSession>>,
    broadcaster: Option<Arc<VoiceBroadcaster>>,
    tasks: Option<CancellationToken>,
}

/// Top-level facade: joins and leaves the party by driving the presence
/// directory, the voice broadcaster and the voice session in order.
///
/// `join`, `leave`, `toggle_mute`, `toggle_deafen` and `edit_profile` are
/// serialized. `leave` first trips the abort token, so it overtakes a join
/// that is still connecting.
pub struct PartyCoordinator {
    config: Config,
    deps: PartyDeps,
    directory: Arc<PresenceDirectory>,
    op_lock: tokio::sync::Mutex<()>,
    abort: Mutex<CancellationToken>,
    active: Mutex<Active>,
    member_tx: watch::Sender<Option<PartyMember>>,
    party_tx: watch::Sender<PartyState>,
    levels_tx: watch::Sender<HashMap<MemberId, f32>>,
    voice_tx: watch::Sender<VoiceSessionState>,
}

impl PartyCoordinator {
    pub fn new(config: Config, deps: PartyDeps) -> Arc<Self> {
        let directory = PresenceDirectory::new(
            deps.realtime.clone(),
            config.party.presence_topic(),
            config.presence.clone(),
        );
        Arc::new(Self {
            config,
            deps,
            directory,
            op_lock: tokio::sync::Mutex::new(()),
            abort: Mutex::new(CancellationToken::new()),
            active: Mutex::new(Active::default()),
            member_tx: watch::channel(None).0,
            party_tx: watch::channel(PartyState::Idle).0,
            levels_tx: watch::channel(HashMap::new()).0,
            voice_tx: watch::channel(VoiceSessionState::Idle).0,
        })
    }

    pub fn directory(&self) -> &Arc<PresenceDirectory> {
        &self.directory
    }

    pub fn current_member(&self) -> watch::Receiver<Option<PartyMember>> {
        self.member_tx.subscribe()
    }

    pub fn members(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.directory.members()
    }

    pub fn party_state(&self) -> watch::Receiver<PartyState> {
        self.party_tx.subscribe()
    }

    pub fn volume_levels(&self) -> watch::Receiver<HashMap<MemberId, f32>> {
        self.levels_tx.subscribe()
    }

    pub fn voice_state(&self) -> watch::Receiver<VoiceSessionState> {
        self.voice_tx.subscribe()
    }

    pub fn state(&self) -> PartyState {
        *self.party_tx.borrow()
    }

    fn set_state(&self, next: PartyState) {
        let previous = self.party_tx.send_replace(next);
        if previous != next {
            debug!("[{}] party {} -> {}", self.config.party.room, previous, next);
        }
    }

    /// Joins as a new member.
    pub async fn join(self: &Arc<Self>, name: &str, avatar: &str, status: &str) -> PartyResult<()> {
        let profile = Profile::new(name, avatar, status)?;
        self.join_as(PartyMember::new(MemberId::generate(), profile))
            .await
    }

    /// Rejoins with the stored session record, if there is a usable one.
    /// A malformed record is discarded. Returns whether a session was
    /// restored.
    pub async fn restore(self: &Arc<Self>) -> PartyResult<bool> {
        let stored = match self.deps.storage.load() {
            Ok(Some(stored)) => stored,
            Ok(None) => return Ok(false),
            Err(PartyError::Validation(reason)) => {
                warn!("discarding stored session: {}", reason);
                self.forget_session();
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let mut member = match stored.into_member() {
            Ok(member) => member,
            Err(e) => {
                warn!("discarding stored session: {}", e);
                self.forget_session();
                return Ok(false);
            }
        };
        member.last_seen = now_ms();
        info!("[{}] restoring session of {}", self.config.party.room, member.id);
        self.join_as(member).await?;
        Ok(true)
    }

    async fn join_as(self: &Arc<Self>, member: PartyMember) -> PartyResult<()> {
        let abort = self.abort.lock().clone();
        let _op = self.op_lock.lock().await;
        if abort.is_cancelled() {
            return Err(PartyError::Cancelled);
        }
        if self.state().is_joined() {
            return Ok(());
        }

        self.set_state(PartyState::Joining);
        self.member_tx.send_replace(Some(member.clone()));

        let result = tokio::select! {
            _ = abort.cancelled() => Err(PartyError::Cancelled),
            result = self.join_steps(&member) => result,
        };

        match result {
            Ok(()) => {
                self.persist(&member);
                self.set_state(PartyState::Joined);
                info!("[{}] {} joined the party", self.config.party.room, member.id);
                Ok(())
            }
            Err(err) => {
                warn!("[{}] join failed, rolling back: {}", self.config.party.room, err);
                let voice_state = self
                    .active
                    .lock()
                    .voice
                    .as_ref()
                    .map(|voice| voice.state())
                    .unwrap_or_default();

                self.teardown().await;
                self.member_tx.send_replace(None);
                // Keep permission and exhausted-retry outcomes visible.
                if !matches!(err, PartyError::Cancelled) {
                    self.voice_tx.send_replace(voice_state);
                }
                self.set_state(PartyState::Idle);
                Err(err)
            }
        }
    }

    async fn join_steps(self: &Arc<Self>, member: &PartyMember) -> PartyResult<()> {
        let tasks = CancellationToken::new();
        let (updates_tx, updates_rx) = flume::unbounded();
        self.active.lock().tasks = Some(tasks.clone());
        tokio::spawn(self.clone().pump_updates(updates_rx, tasks.clone()));

        self.directory.initialize(member.clone()).await?;
        tokio::spawn(self.clone().watch_presence(self.directory.link(), tasks.clone()));
        tokio::spawn(self.clone().prune_departed(self.directory.members(), tasks.clone()));

        let broadcaster = VoiceBroadcaster::start(
            self.deps.realtime.clone(),
            self.config.party.voice_topic(),
            member.id.clone(),
            self.config.voice.debounce(),
            self.config.presence.backoff.policy(),
            updates_tx.clone(),
        )
        .await?;
        self.active.lock().broadcaster = Some(broadcaster.clone());

        let voice = VoiceSession::new(
            member.id.clone(),
            self.config.party.room.clone(),
            self.config.voice.clone(),
            self.config.credentials.clone(),
            self.deps.voice.clone(),
            updates_tx,
        );
        voice.attach_broadcaster(Some(broadcaster));
        self.active.lock().voice = Some(voice.clone());
        tokio::spawn(self.clone().mirror_voice(voice.subscribe_state(), tasks));

        voice.connect().await?;
        self.voice_tx.send_replace(voice.state());
        Ok(())
    }

    /// Feeds voice updates into the directory and the level map.
    async fn pump_updates(self: Arc<Self>, updates: flume::Receiver<VoiceUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => return,
                update = updates.recv_async() => match update {
                    Ok(update) => update,
                    Err(_) => return,
                },
            };
            let level = if update.state.muted { 0.0 } else { update.state.level };
            // A late update from someone who already left must not bring
            // their level back.
            let present = self.directory.get(&update.id).is_some();
            self.levels_tx.send_if_modified(|levels| {
                if present {
                    levels.insert(update.id.clone(), level);
                    true
                } else {
                    levels.remove(&update.id).is_some()
                }
            });
            self.directory.apply_voice(&update.id, update.state);
        }
    }

    /// Drops levels and broadcast bookkeeping of members that left.
    async fn prune_departed(
        self: Arc<Self>,
        mut members: watch::Receiver<Vec<PresenceEntry>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = members.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let present: HashSet<MemberId> = members
                .borrow_and_update()
                .iter()
                .map(|entry| entry.id().clone())
                .collect();
            self.levels_tx.send_if_modified(|levels| {
                let before = levels.len();
                levels.retain(|id, _| present.contains(id));
                levels.len() != before
            });
            let broadcaster = self.active.lock().broadcaster.clone();
            if let Some(broadcaster) = broadcaster {
                broadcaster.retain_members(&present);
            }
        }
    }

    /// Ends the membership when presence recovery gives up, leaving the
    /// stored session in place so the user can retry.
    async fn watch_presence(
        self: Arc<Self>,
        mut link: watch::Receiver<PresenceLink>,
        cancel: CancellationToken,
    ) {
        let err = loop {
            if let PresenceLink::Lost(err) = &*link.borrow_and_update() {
                break err.clone();
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = link.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        };

        let _op = tokio::select! {
            _ = cancel.cancelled() => return,
            op = self.op_lock.lock() => op,
        };
        if cancel.is_cancelled() {
            return;
        }
        warn!("[{}] presence lost, leaving voice: {}", self.config.party.room, err);
        self.teardown().await;
        self.voice_tx
            .send_replace(VoiceSessionState::Disconnected { error: Some(err) });
        self.set_state(PartyState::Disconnected);
    }

    async fn mirror_voice(
        self: Arc<Self>,
        mut states: watch::Receiver<VoiceSessionState>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                changed = states.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let state = states.borrow_and_update().clone();
            self.voice_tx.send_replace(state);
        }
    }

    /// Stops everything `join` started, in reverse order. Safe to call at
    /// any point of a join and more than once.
    async fn teardown(&self) {
        let active = std::mem::take(&mut *self.active.lock());
        if let Some(tasks) = &active.tasks {
            tasks.cancel();
        }
        if let Some(voice) = &active.voice {
            voice.disconnect().await;
            voice.attach_broadcaster(None);
        }
        if let Some(broadcaster) = &active.broadcaster {
            broadcaster.shutdown().await;
        }
        if let Err(e) = self.directory.cleanup().await {
            warn!("[{}] presence cleanup failed: {}", self.config.party.room, e);
        }
        self.levels_tx.send_replace(HashMap::new());
        self.voice_tx.send_replace(VoiceSessionState::Idle);
    }

    /// Leaves the party, aborting a join still in progress. Always ends in
    /// `Idle` with no stored session.
    pub async fn leave(&self) -> PartyResult<()> {
        self.abort.lock().cancel();
        let _op = self.op_lock.lock().await;
        *self.abort.lock() = CancellationToken::new();

        let was_joined = self.state().is_joined();
        self.set_state(PartyState::Leaving);
        self.teardown().await;
        self.forget_session();
        self.member_tx.send_replace(None);
        self.set_state(PartyState::Idle);
        if was_joined {
            info!("[{}] left the party", self.config.party.room);
        }
        Ok(())
    }

    fn voice(&self) -> PartyResult<Arc<VoiceSession>> {
        if !self.state().is_joined() {
            return Err(PartyError::Validation("not in the party".into()));
        }
        self.active
            .lock()
            .voice
            .clone()
            .ok_or_else(|| PartyError::Validation("not in the party".into()))
    }

    /// Flips mute, or reconnects voice when it is down. Returns the new mute
    /// flag.
    pub async fn toggle_mute(&self) -> PartyResult<bool> {
        let abort = self.abort.lock().clone();
        let _op = self.op_lock.lock().await;
        let voice = self.voice()?;
        let result = tokio::select! {
            _ = abort.cancelled() => Err(PartyError::Cancelled),
            result = voice.toggle_mute() => result,
        };
        self.voice_tx.send_replace(voice.state());
        result
    }

    /// Returns the new deafen flag.
    pub async fn toggle_deafen(&self) -> PartyResult<bool> {
        let _op = self.op_lock.lock().await;
        let voice = self.voice()?;
        let deafened = !voice.is_deafened();
        voice.set_deafened(deafened).await?;
        Ok(deafened)
    }

    pub async fn edit_profile(&self, name: &str, avatar: &str, status: &str) -> PartyResult<()> {
        let profile = Profile::new(name, avatar, status)?;
        let _op = self.op_lock.lock().await;
        if !self.state().is_joined() {
            return Err(PartyError::Validation("not in the party".into()));
        }

        let member = self.directory.update_self(profile).await?;
        self.persist(&member);
        self.member_tx.send_replace(Some(member));
        Ok(())
    }

    fn persist(&self, member: &PartyMember) {
        if let Err(e) = self.deps.storage.save(&StoredSession::from(member)) {
            warn!("[{}] could not store session: {}", self.config.party.room, e);
        }
    }

    fn forget_session(&self) {
        if let Err(e) = self.deps.storage.clear() {
            warn!("[{}] could not clear stored session: {}", self.config.party.room, e);
        }
    }
}
