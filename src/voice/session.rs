use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    broadcaster::VoiceBroadcaster,
    detector::{DetectorConfig, SpeakingDetector},
    state::VoiceSessionState,
};
use crate::{
    backoff::BackoffController,
    common::{
        errors::{PartyError, PartyResult, with_timeout},
        types::{MemberId, TransportUid, now_ms},
    },
    configs::{CredentialsConfig, VoiceConfig},
    credentials::{TokenRefresher, TokenSource, refresher::ApplyToken},
    media::{
        AudioCaptureConfig, AudioTransport, ConnectionState, LocalAudioTrack, PermissionProvider,
        TransportEvent,
    },
    protocol::{VoiceState, VoiceStatus, VoiceUpdate},
};

/// Collaborators a [`VoiceSession`] drives.
#[derive(Clone)]
pub struct VoiceDeps {
    pub transport: Arc<dyn AudioTransport>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub tokens: Arc<dyn TokenSource>,
}

#[derive(Default)]
struct Media {
    track: Option<Arc<dyn LocalAudioTrack>>,
    joined: bool,
    uid: Option<TransportUid>,
    refresher: Option<Arc<TokenRefresher>>,
    /// Cancels the sampler, monitor and renewal timer of the live session.
    live: Option<CancellationToken>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    muted: bool,
    deafened: bool,
    muted_before_deafen: bool,
}

impl Flags {
    fn capture_enabled(&self) -> bool {
        !self.muted && !self.deafened
    }
}

struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the local audio transport session and its microphone capture.
///
/// `connect`, `disconnect`, `toggle_mute` and `set_deafened` are serialized
/// through one async lock. `disconnect` first trips the abort token so an
/// in-flight connect or recovery gives the lock up quickly.
pub struct VoiceSession {
    member_id: MemberId,
    channel_name: String,
    config: VoiceConfig,
    credentials: CredentialsConfig,
    deps: VoiceDeps,
    broadcaster: RwLock<Option<Arc<VoiceBroadcaster>>>,
    updates: flume::Sender<VoiceUpdate>,
    op_lock: tokio::sync::Mutex<()>,
    connecting: AtomicBool,
    has_permission: AtomicBool,
    abort: Mutex<CancellationToken>,
    media: Mutex<Media>,
    flags: Mutex<Flags>,
    state_tx: watch::Sender<VoiceSessionState>,
    voice_tx: watch::Sender<VoiceState>,
}

impl VoiceSession {
    pub fn new(
        member_id: MemberId,
        channel_name: impl Into<String>,
        config: VoiceConfig,
        credentials: CredentialsConfig,
        deps: VoiceDeps,
        updates: flume::Sender<VoiceUpdate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            member_id,
            channel_name: channel_name.into(),
            config,
            credentials,
            deps,
            broadcaster: RwLock::new(None),
            updates,
            op_lock: tokio::sync::Mutex::new(()),
            connecting: AtomicBool::new(false),
            has_permission: AtomicBool::new(false),
            abort: Mutex::new(CancellationToken::new()),
            media: Mutex::new(Media::default()),
            flags: Mutex::new(Flags::default()),
            state_tx: watch::channel(VoiceSessionState::Idle).0,
            voice_tx: watch::channel(VoiceState::default()).0,
        })
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn attach_broadcaster(&self, broadcaster: Option<Arc<VoiceBroadcaster>>) {
        *self.broadcaster.write() = broadcaster;
    }

    pub fn state(&self) -> VoiceSessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<VoiceSessionState> {
        self.state_tx.subscribe()
    }

    pub fn voice_state(&self) -> VoiceState {
        self.voice_tx.borrow().clone()
    }

    pub fn subscribe_voice(&self) -> watch::Receiver<VoiceState> {
        self.voice_tx.subscribe()
    }

    pub fn is_muted(&self) -> bool {
        self.flags.lock().muted
    }

    pub fn is_deafened(&self) -> bool {
        self.flags.lock().deafened
    }

    pub fn transport_uid(&self) -> Option<TransportUid> {
        self.media.lock().uid
    }

    fn set_state(&self, next: VoiceSessionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            debug!("[{}] voice {} -> {}", self.member_id, previous, next);
        }
    }

    /// Publishes a new local voice state to watchers, peers and the update
    /// queue. `urgent` skips the broadcast debounce.
    fn announce(&self, state: VoiceState, urgent: bool) {
        self.voice_tx.send_replace(state.clone());
        let broadcaster = self.broadcaster.read().clone();
        if let Some(broadcaster) = broadcaster {
            if urgent {
                broadcaster.publish_immediate(state.clone());
            } else {
                broadcaster.publish(state.clone());
            }
        }
        let _ = self.updates.send(VoiceUpdate {
            id: self.member_id.clone(),
            state,
            local: true,
        });
    }

    fn announce_status(&self, status: VoiceStatus) {
        let flags = *self.flags.lock();
        let mut state = self.voice_state();
        state.voice_status = status;
        state.muted = flags.muted;
        state.is_deafened = flags.deafened;
        state.level = 0.0;
        state.timestamp = now_ms();
        self.announce(state, true);
    }

    /// Asks for microphone access.
    pub async fn request_permission(&self) -> PartyResult<()> {
        let _op = self.op_lock.lock().await;
        self.request_permission_locked().await
    }

    async fn request_permission_locked(&self) -> PartyResult<()> {
        self.set_state(VoiceSessionState::RequestingPermissions);
        let result = with_timeout(
            "microphone permission",
            self.config.operation_timeout(),
            self.deps.permissions.request_microphone(),
        )
        .await;

        match result {
            Ok(()) => {
                self.has_permission.store(true, Ordering::SeqCst);
                self.set_state(VoiceSessionState::Idle);
                Ok(())
            }
            Err(err) => {
                self.has_permission.store(false, Ordering::SeqCst);
                warn!("[{}] microphone permission: {}", self.member_id, err);
                self.set_state(VoiceSessionState::PermissionDenied);
                self.announce_status(VoiceStatus::Error);
                Err(match err {
                    PartyError::Permission(_) => err,
                    other => PartyError::Permission(other.to_string()),
                })
            }
        }
    }

    /// Joins the audio session. A no-op when already connected;
    /// `PartyError::Busy` when another connect is in flight.
    pub async fn connect(self: &Arc<Self>) -> PartyResult<()> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            return Err(PartyError::Busy("voice connect"));
        }
        let _connecting = ConnectingGuard(&self.connecting);
        let _op = self.op_lock.lock().await;
        let abort = self.abort.lock().clone();
        self.connect_locked(abort).await
    }

    async fn connect_locked(self: &Arc<Self>, abort: CancellationToken) -> PartyResult<()> {
        if self.state().is_connected() {
            return Ok(());
        }
        if abort.is_cancelled() {
            return Err(PartyError::Cancelled);
        }
        if !self.has_permission.load(Ordering::SeqCst) {
            self.request_permission_locked().await?;
        }

        let ctl = BackoffController::new(
            format!("{} media", self.member_id),
            self.config.backoff.policy(),
            abort,
        );
        let result = ctl
            .attempt(
                |attempt| {
                    let this = self.clone();
                    async move {
                        this.set_state(VoiceSessionState::Connecting { attempt });
                        this.connect_once().await
                    }
                },
                |e| error!("[{}] could not join audio: {}", self.member_id, e),
            )
            .await;

        match result {
            Ok(uid) => {
                self.go_live(uid);
                Ok(())
            }
            Err(err) => {
                self.teardown_media().await;
                self.settle_failure(&err);
                Err(err)
            }
        }
    }

    /// One connect attempt. Leaves nothing behind on failure.
    async fn connect_once(&self) -> PartyResult<TransportUid> {
        let timeout = self.config.operation_timeout();

        // Only one capture handle may exist at a time.
        self.teardown_media().await;

        let track = with_timeout(
            "audio capture",
            timeout,
            self.deps
                .transport
                .create_local_audio_capture(AudioCaptureConfig::default()),
        )
        .await?;
        self.media.lock().track = Some(track.clone());

        let result = self.join_and_publish(track).await;
        if result.is_err() {
            self.teardown_media().await;
        }
        result
    }

    async fn join_and_publish(&self, track: Arc<dyn LocalAudioTrack>) -> PartyResult<TransportUid> {
        let timeout = self.config.operation_timeout();
        let uid = TransportUid::generate();

        let refresher = Arc::new(TokenRefresher::new(
            self.deps.tokens.clone(),
            self.channel_name.clone(),
            uid,
            self.credentials.timeout(),
            self.credentials.renew_before(),
        ));
        let grant = refresher.fetch().await?;
        self.media.lock().refresher = Some(refresher);

        let joined = with_timeout(
            "transport join",
            timeout,
            self.deps
                .transport
                .join(&self.config.app_id, &self.channel_name, &grant.token, uid),
        )
        .await?;
        {
            let mut media = self.media.lock();
            media.joined = true;
            media.uid = Some(joined);
        }

        let flags = *self.flags.lock();
        track.set_enabled(flags.capture_enabled());
        self.deps.transport.set_remote_audio_enabled(!flags.deafened);

        with_timeout("publish", timeout, self.deps.transport.publish(track)).await?;
        Ok(joined)
    }

    fn go_live(self: &Arc<Self>, uid: TransportUid) {
        let live = CancellationToken::new();
        let (track, refresher) = {
            let mut media = self.media.lock();
            media.live = Some(live.clone());
            (media.track.clone(), media.refresher.clone())
        };

        // Events from failed attempts must not trigger a recovery.
        let events = self.deps.transport.events();
        events.drain().for_each(drop);

        self.set_state(VoiceSessionState::Connected { uid });
        let flags = *self.flags.lock();
        self.announce(VoiceState::connected(uid, flags.muted, flags.deafened), true);
        info!("[{}] joined audio as uid {}", self.member_id, uid);

        if let Some(track) = track {
            tokio::spawn(self.clone().sample_loop(live.clone(), track));
        }
        if let Some(refresher) = refresher {
            refresher.schedule(self.apply_token());
        }
        tokio::spawn(self.clone().monitor(live, events));
    }

    fn apply_token(&self) -> ApplyToken {
        let transport = self.deps.transport.clone();
        Arc::new(move |token: String| {
            let transport = transport.clone();
            Box::pin(async move { transport.renew_token(&token).await })
        })
    }

    fn settle_failure(&self, err: &PartyError) {
        match err.root() {
            PartyError::Permission(_) => {
                self.has_permission.store(false, Ordering::SeqCst);
                self.set_state(VoiceSessionState::PermissionDenied);
                self.announce_status(VoiceStatus::Error);
            }
            PartyError::Cancelled => {
                self.set_state(VoiceSessionState::Idle);
            }
            _ => {
                self.set_state(VoiceSessionState::Disconnected {
                    error: Some(err.clone()),
                });
                self.announce_status(VoiceStatus::Error);
            }
        }
    }

    /// Stops sampling and renewal, closes the capture and leaves the
    /// transport. Safe to call repeatedly.
    async fn teardown_media(&self) {
        let timeout = self.config.operation_timeout();
        let (track, joined, refresher, live) = {
            let mut media = self.media.lock();
            (
                media.track.take(),
                std::mem::take(&mut media.joined),
                media.refresher.take(),
                media.live.take(),
            )
        };

        if let Some(live) = live {
            live.cancel();
        }
        if let Some(refresher) = refresher {
            refresher.cancel();
        }
        if let Some(track) = track {
            if joined {
                if let Err(e) =
                    with_timeout("unpublish", timeout, self.deps.transport.unpublish(track.clone()))
                        .await
                {
                    debug!("[{}] unpublish failed: {}", self.member_id, e);
                }
            }
            track.close();
        }
        if joined || self.deps.transport.connection_state() != ConnectionState::Disconnected {
            if let Err(e) = with_timeout("transport leave", timeout, self.deps.transport.leave()).await
            {
                warn!("[{}] leave failed: {}", self.member_id, e);
            }
        }
    }

    async fn sample_loop(self: Arc<Self>, live: CancellationToken, track: Arc<dyn LocalAudioTrack>) {
        let mut detector = SpeakingDetector::new(DetectorConfig::from(&self.config));
        let mut interval = tokio::time::interval(self.config.sample_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = live.cancelled() => break,
                _ = interval.tick() => {}
            }

            let flags = *self.flags.lock();
            let raw = track.volume_level();
            let Some(reading) = detector.sample(raw, !flags.capture_enabled()) else {
                continue;
            };

            let mut state = self.voice_state();
            state.voice_status = reading.status;
            state.level = reading.level;
            state.muted = flags.muted;
            state.is_deafened = flags.deafened;
            state.timestamp = now_ms();
            self.announce(state, false);
        }
    }

    async fn monitor(self: Arc<Self>, live: CancellationToken, events: flume::Receiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = live.cancelled() => return,
                event = events.recv_async() => match event {
                    Ok(event) => event,
                    Err(_) => return,
                },
            };

            if event.is_unexpected_drop() {
                warn!("[{}] audio transport dropped: {:?}", self.member_id, event);
                if live.is_cancelled() {
                    return;
                }
                // Nothing may treat the session as connected until recovery
                // has run.
                self.set_state(VoiceSessionState::Connecting { attempt: 1 });
                tokio::spawn(self.clone().recover(live));
                return;
            }

            match event {
                TransportEvent::TokenPrivilegeWillExpire => {
                    let refresher = self.media.lock().refresher.clone();
                    if let Some(refresher) = refresher {
                        if let Err(e) = refresher.renew_now(&self.apply_token()).await {
                            warn!("[{}] early token renewal failed: {}", self.member_id, e);
                        }
                    }
                }
                TransportEvent::UserPublished { uid } => {
                    debug!("[{}] remote uid {} published audio", self.member_id, uid);
                }
                TransportEvent::UserUnpublished { uid } => {
                    debug!("[{}] remote uid {} unpublished audio", self.member_id, uid);
                }
                TransportEvent::ConnectionStateChange { current, previous, .. } => {
                    debug!("[{}] transport {:?} -> {:?}", self.member_id, previous, current);
                }
            }
        }
    }

    /// Reconnects after an unexpected drop: waits 2s, 4s, 8s (capped) before
    /// each of at most `max_attempts` tries, then settles in
    /// `Disconnected(error)`.
    async fn recover(self: Arc<Self>, dropped: CancellationToken) {
        let _op = self.op_lock.lock().await;
        // Superseded by a disconnect or another recovery while waiting.
        if dropped.is_cancelled() {
            return;
        }
        let abort = self.abort.lock().clone();

        self.teardown_media().await;
        self.set_state(VoiceSessionState::Connecting { attempt: 1 });
        self.announce_status(VoiceStatus::Disconnected);

        let ctl = BackoffController::new(
            format!("{} media", self.member_id),
            self.config.backoff.policy(),
            abort,
        );
        let result = ctl
            .reattempt(
                |attempt| {
                    let this = self.clone();
                    async move {
                        this.set_state(VoiceSessionState::Connecting { attempt });
                        this.connect_once().await
                    }
                },
                |e| error!("[{}] audio reconnect gave up: {}", self.member_id, e),
            )
            .await;

        match result {
            Ok(uid) => self.go_live(uid),
            Err(err) => {
                self.teardown_media().await;
                self.settle_failure(&err);
            }
        }
    }

    /// Leaves the audio session and resets mute, deafen and level. Safe to
    /// call repeatedly and from error paths.
    pub async fn disconnect(&self) {
        self.abort.lock().cancel();
        let _op = self.op_lock.lock().await;
        *self.abort.lock() = CancellationToken::new();

        self.teardown_media().await;
        *self.flags.lock() = Flags::default();
        self.media.lock().uid = None;

        let was_idle = matches!(self.state(), VoiceSessionState::Idle);
        self.set_state(VoiceSessionState::Idle);
        if !was_idle || self.voice_state() != VoiceState::default() {
            let mut state = VoiceState::default();
            state.timestamp = now_ms();
            self.announce(state, true);
        }
    }

    /// Flips mute while connected and broadcasts it at once. While not
    /// connected this starts a connect instead. Returns the new mute flag.
    pub async fn toggle_mute(self: &Arc<Self>) -> PartyResult<bool> {
        let op = self.op_lock.lock().await;
        if !self.state().is_connected() {
            drop(op);
            self.connect().await?;
            return Ok(self.is_muted());
        }

        let flags = {
            let mut flags = self.flags.lock();
            if flags.deafened {
                // Unmuting while deafened undeafens too.
                flags.deafened = false;
                flags.muted = false;
                self.deps.transport.set_remote_audio_enabled(true);
            } else {
                flags.muted = !flags.muted;
            }
            *flags
        };
        self.apply_flags(flags);
        info!("[{}] muted={}", self.member_id, flags.muted);
        Ok(flags.muted)
    }

    /// Deafening silences remote audio and the microphone; undeafening
    /// restores the mute flag from before. Stored for the next connect when
    /// not connected.
    pub async fn set_deafened(&self, deafened: bool) -> PartyResult<()> {
        let _op = self.op_lock.lock().await;

        let flags = {
            let mut flags = self.flags.lock();
            if flags.deafened == deafened {
                return Ok(());
            }
            if deafened {
                flags.muted_before_deafen = flags.muted;
                flags.muted = true;
            } else {
                flags.muted = flags.muted_before_deafen;
            }
            flags.deafened = deafened;
            *flags
        };

        if !self.state().is_connected() {
            return Ok(());
        }
        self.deps.transport.set_remote_audio_enabled(!deafened);
        self.apply_flags(flags);
        info!("[{}] deafened={}", self.member_id, deafened);
        Ok(())
    }

    fn apply_flags(&self, flags: Flags) {
        let track = self.media.lock().track.clone();
        if let Some(track) = track {
            track.set_enabled(flags.capture_enabled());
        }

        let mut state = self.voice_state();
        state.muted = flags.muted;
        state.is_deafened = flags.deafened;
        if flags.capture_enabled() {
            state.voice_status = VoiceStatus::Silent;
        } else {
            state.voice_status = VoiceStatus::Muted;
        }
        state.level = 0.0;
        state.timestamp = now_ms();
        self.announce(state, true);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::AtomicU32, time::Duration};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::{
        credentials::{TokenGrant, TokenMinter},
        media::{DisconnectReason, SimulatedPermissions, SimulatedTransport},
    };

    struct CountingTokens {
        minter: TokenMinter,
        fetches: AtomicU32,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn fetch(&self, channel: &str, uid: TransportUid) -> PartyResult<TokenGrant> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.minter.mint(channel, uid)
        }
    }

    struct Harness {
        session: Arc<VoiceSession>,
        transport: Arc<SimulatedTransport>,
        permissions: Arc<SimulatedPermissions>,
        tokens: Arc<CountingTokens>,
        updates: flume::Receiver<VoiceUpdate>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(SimulatedTransport::new());
        let permissions = Arc::new(SimulatedPermissions::new(true));
        let tokens = Arc::new(CountingTokens {
            minter: TokenMinter::new("partyline-dev", "secret", Duration::from_secs(3600)),
            fetches: AtomicU32::new(0),
        });
        let (tx, rx) = flume::unbounded();
        let session = VoiceSession::new(
            MemberId::from("ann"),
            "party",
            VoiceConfig::default(),
            CredentialsConfig::default(),
            VoiceDeps {
                transport: transport.clone(),
                permissions: permissions.clone(),
                tokens: tokens.clone(),
            },
            tx,
        );
        Harness {
            session,
            transport,
            permissions,
            tokens,
            updates: rx,
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<VoiceSessionState>,
        pred: impl Fn(&VoiceSessionState) -> bool,
    ) -> VoiceSessionState {
        rx.wait_for(|s| pred(s)).await.unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_joins_publishes_and_announces_silent() {
        let h = harness();
        h.session.connect().await.unwrap();

        assert!(h.session.state().is_connected());
        assert!(h.transport.is_joined());
        assert!(h.transport.is_published());
        assert_eq!(h.transport.open_captures(), 1);
        assert_eq!(h.session.transport_uid(), h.transport.current_uid());

        let first = h.updates.try_recv().unwrap();
        assert!(first.local);
        assert_eq!(first.state.voice_status, VoiceStatus::Silent);

        // Already connected: no second join.
        h.session.connect().await.unwrap();
        assert_eq!(h.transport.join_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_terminal_and_distinct() {
        let h = harness();
        h.permissions.set_granted(false);

        let err = h.session.connect().await.unwrap_err();
        assert!(matches!(err, PartyError::Permission(_)));
        assert_eq!(h.session.state(), VoiceSessionState::PermissionDenied);
        assert_eq!(h.transport.join_count(), 0);
        assert_eq!(h.transport.open_captures(), 0);

        h.permissions.set_granted(true);
        h.session.connect().await.unwrap();
        assert_eq!(h.permissions.requests(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_joins_retry_then_leave_nothing_behind() {
        let h = harness();
        h.transport.fail_next_joins(10);
        let started = Instant::now();

        let err = h.session.connect().await.unwrap_err();
        assert!(matches!(err, PartyError::Exhausted { attempts: 3, .. }));
        assert!(matches!(
            h.session.state(),
            VoiceSessionState::Disconnected { error: Some(_) }
        ));
        assert_eq!(h.transport.join_count(), 3);
        assert_eq!(h.transport.open_captures(), 0);
        assert!(!h.transport.is_joined());
        // Waits of 2s and 4s between the three attempts.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn second_connect_in_flight_is_rejected() {
        let h = harness();
        h.transport.set_join_delay(Some(Duration::from_millis(500)));

        let first = tokio::spawn({
            let session = h.session.clone();
            async move { session.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(h.session.connect().await, Err(PartyError::Busy("voice connect")));
        first.await.unwrap().unwrap();
        assert_eq!(h.transport.join_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_aborts_an_in_flight_connect() {
        let h = harness();
        h.transport.set_join_delay(Some(Duration::from_secs(3)));

        let connecting = tokio::spawn({
            let session = h.session.clone();
            async move { session.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.session.disconnect().await;

        assert_eq!(connecting.await.unwrap(), Err(PartyError::Cancelled));
        assert_eq!(h.session.state(), VoiceSessionState::Idle);
        assert_eq!(h.transport.open_captures(), 0);
        assert!(!h.transport.is_joined());
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mute_connects_when_disconnected() {
        let h = harness();
        assert_eq!(h.session.toggle_mute().await, Ok(false));
        assert!(h.session.state().is_connected());

        assert_eq!(h.session.toggle_mute().await, Ok(true));
        assert_eq!(h.session.voice_state().voice_status, VoiceStatus::Muted);

        let last = h.updates.try_iter().last().unwrap();
        assert!(last.state.muted);
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_reports_speaking() {
        let h = harness();
        h.session.connect().await.unwrap();
        h.transport.push_levels(&[0.2, 0.5, 0.5, 0.3, 0.3]);

        let mut voice = h.session.subscribe_voice();
        voice
            .wait_for(|v| v.voice_status == VoiceStatus::Speaking)
            .await
            .unwrap();
        voice
            .wait_for(|v| v.voice_status == VoiceStatus::Silent)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_drop_reconnects() {
        let h = harness();
        h.session.connect().await.unwrap();
        let mut states = h.session.subscribe_state();
        let mut voice = h.session.subscribe_voice();

        h.transport.drop_connection(DisconnectReason::NetworkError);
        wait_for(&mut states, |s| !s.is_connected()).await;
        voice
            .wait_for(|v| v.voice_status == VoiceStatus::Disconnected)
            .await
            .unwrap();
        wait_for(&mut states, VoiceSessionState::is_connected).await;

        assert_eq!(h.transport.join_count(), 2);
        assert_eq!(h.transport.open_captures(), 1);
        assert_eq!(h.session.transport_uid(), h.transport.current_uid());
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_mute_right_after_a_drop_reconnects_instead() {
        let h = harness();
        h.session.connect().await.unwrap();
        let mut states = h.session.subscribe_state();

        h.transport.drop_connection(DisconnectReason::NetworkError);
        wait_for(&mut states, |s| !s.is_connected()).await;

        assert_eq!(h.session.toggle_mute().await, Ok(false));
        assert!(h.session.state().is_connected());
        assert!(!h.session.is_muted());
        assert_eq!(h.transport.join_count(), 2);
        assert_eq!(h.transport.open_captures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_gives_up_after_three_attempts() {
        let h = harness();
        h.session.connect().await.unwrap();
        let mut states = h.session.subscribe_state();

        h.transport.fail_next_joins(10);
        let dropped_at = Instant::now();
        h.transport.drop_connection(DisconnectReason::NetworkError);

        let settled = wait_for(&mut states, |s| matches!(s, VoiceSessionState::Disconnected { .. })).await;
        assert!(matches!(
            settled,
            VoiceSessionState::Disconnected { error: Some(PartyError::Exhausted { attempts: 3, .. }) }
        ));
        assert_eq!(h.transport.join_count(), 1 + 3);
        assert!(dropped_at.elapsed() >= Duration::from_secs(2 + 4 + 8));
        assert_eq!(h.transport.open_captures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deafen_silences_remote_audio_and_restores_mute() {
        let h = harness();
        h.session.connect().await.unwrap();

        h.session.set_deafened(true).await.unwrap();
        assert!(!h.transport.remote_audio_enabled());
        assert!(h.session.voice_state().is_deafened);
        assert!(h.session.is_muted());

        h.session.set_deafened(false).await.unwrap();
        assert!(h.transport.remote_audio_enabled());
        assert!(!h.session.is_muted());
    }

    #[tokio::test(start_paused = true)]
    async fn token_expiry_warning_renews_in_place() {
        let h = harness();
        h.session.connect().await.unwrap();
        assert_eq!(h.tokens.fetches.load(Ordering::SeqCst), 1);

        h.transport.warn_token_expiry();
        while h.tokens.fetches.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(h.transport.current_token().is_some());
        assert_eq!(h.transport.join_count(), 1);
        assert!(h.session.state().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let h = harness();
        h.session.connect().await.unwrap();
        h.session.disconnect().await;
        h.session.disconnect().await;

        assert_eq!(h.session.state(), VoiceSessionState::Idle);
        assert_eq!(h.session.voice_state().voice_status, VoiceStatus::Disconnected);
        assert_eq!(h.transport.open_captures(), 0);
        assert!(!h.session.is_muted());
    }
}
