use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    AudioCaptureConfig, AudioTransport, ConnectionState, DisconnectReason, LocalAudioTrack,
    PermissionProvider, TransportEvent,
};
use crate::common::{
    errors::{PartyError, PartyResult},
    types::TransportUid,
};

/// Scripted microphone input shared by every capture of one transport.
#[derive(Default)]
struct LevelScript {
    queued: VecDeque<f32>,
    steady: f32,
}

struct SimulatedTrack {
    enabled: AtomicBool,
    closed: AtomicBool,
    levels: Arc<Mutex<LevelScript>>,
    open_captures: Arc<AtomicUsize>,
}

impl LocalAudioTrack for SimulatedTrack {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn volume_level(&self) -> f32 {
        let mut levels = self.levels.lock();
        // Scripted samples are consumed even while muted, like a live mic.
        let level = levels.queued.pop_front().unwrap_or(levels.steady);
        if self.is_closed() || !self.is_enabled() {
            0.0
        } else {
            level.clamp(0.0, 1.0)
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_captures.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct SimState {
    connection: Option<ConnectionState>,
    uid: Option<TransportUid>,
    channel: Option<String>,
    token: Option<String>,
    published: bool,
    remote_audio: bool,
    fail_joins: u32,
    join_delay: Option<Duration>,
    capture_error: Option<PartyError>,
}

/// In-process audio transport with failure injection. Stands in for a media
/// SDK in tests and in the local demo.
pub struct SimulatedTransport {
    state: Mutex<SimState>,
    levels: Arc<Mutex<LevelScript>>,
    open_captures: Arc<AtomicUsize>,
    joins: AtomicU32,
    events_tx: flume::Sender<TransportEvent>,
    events_rx: flume::Receiver<TransportEvent>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = flume::unbounded();
        Self {
            state: Mutex::new(SimState {
                remote_audio: true,
                ..SimState::default()
            }),
            levels: Arc::new(Mutex::new(LevelScript::default())),
            open_captures: Arc::new(AtomicUsize::new(0)),
            joins: AtomicU32::new(0),
            events_tx,
            events_rx,
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn transition(&self, current: ConnectionState, reason: Option<DisconnectReason>) {
        let previous = {
            let mut state = self.state.lock();
            let previous = state.connection.unwrap_or(ConnectionState::Disconnected);
            state.connection = Some(current);
            previous
        };
        if previous != current {
            self.emit(TransportEvent::ConnectionStateChange {
                current,
                previous,
                reason,
            });
        }
    }

    /// Fails the next `times` joins with a transport error.
    pub fn fail_next_joins(&self, times: u32) {
        self.state.lock().fail_joins = times;
    }

    pub fn set_join_delay(&self, delay: Option<Duration>) {
        self.state.lock().join_delay = delay;
    }

    /// Makes every capture request fail with `err` until cleared.
    pub fn fail_capture(&self, err: Option<PartyError>) {
        self.state.lock().capture_error = err;
    }

    /// Queues samples returned by the next `volume_level` calls.
    pub fn push_levels(&self, levels: &[f32]) {
        self.levels.lock().queued.extend(levels.iter().copied());
    }

    /// Level reported once the queued samples run out.
    pub fn set_level(&self, level: f32) {
        self.levels.lock().steady = level;
    }

    /// Simulates the network dropping the session.
    pub fn drop_connection(&self, reason: DisconnectReason) {
        {
            let mut state = self.state.lock();
            if state.connection != Some(ConnectionState::Connected) {
                return;
            }
            state.published = false;
            state.channel = None;
        }
        debug!("simulated transport dropped: {:?}", reason);
        self.transition(ConnectionState::Disconnected, Some(reason));
    }

    pub fn warn_token_expiry(&self) {
        self.emit(TransportEvent::TokenPrivilegeWillExpire);
    }

    /// Announces a remote user publishing audio.
    pub fn remote_published(&self, uid: TransportUid) {
        self.emit(TransportEvent::UserPublished { uid });
    }

    pub fn open_captures(&self) -> usize {
        self.open_captures.load(Ordering::SeqCst)
    }

    pub fn join_count(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self) -> bool {
        self.state.lock().channel.is_some()
    }

    pub fn is_published(&self) -> bool {
        self.state.lock().published
    }

    pub fn current_token(&self) -> Option<String> {
        self.state.lock().token.clone()
    }

    pub fn current_uid(&self) -> Option<TransportUid> {
        self.state.lock().uid
    }

    pub fn remote_audio_enabled(&self) -> bool {
        self.state.lock().remote_audio
    }
}

#[async_trait]
impl AudioTransport for SimulatedTransport {
    async fn join(
        &self,
        _app_id: &str,
        channel: &str,
        token: &str,
        uid: TransportUid,
    ) -> PartyResult<TransportUid> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        if self.is_joined() {
            return Err(PartyError::Transport("already joined".into()));
        }
        if token.is_empty() {
            return Err(PartyError::Credential("empty token".into()));
        }

        self.transition(ConnectionState::Connecting, None);

        let delay = self.state.lock().join_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failed = {
            let mut state = self.state.lock();
            if state.fail_joins > 0 {
                state.fail_joins -= 1;
                true
            } else {
                state.uid = Some(uid);
                state.channel = Some(channel.to_string());
                state.token = Some(token.to_string());
                false
            }
        };

        if failed {
            self.transition(ConnectionState::Disconnected, Some(DisconnectReason::NetworkError));
            return Err(PartyError::Transport("join failed".into()));
        }

        self.transition(ConnectionState::Connected, None);
        Ok(uid)
    }

    async fn leave(&self) -> PartyResult<()> {
        let was_joined = {
            let mut state = self.state.lock();
            state.published = false;
            state.token = None;
            state.channel.take().is_some()
        };
        if was_joined {
            self.transition(ConnectionState::Disconnecting, Some(DisconnectReason::Leave));
        }
        self.transition(ConnectionState::Disconnected, Some(DisconnectReason::Leave));
        Ok(())
    }

    async fn create_local_audio_capture(
        &self,
        _config: AudioCaptureConfig,
    ) -> PartyResult<Arc<dyn LocalAudioTrack>> {
        if let Some(err) = self.state.lock().capture_error.clone() {
            return Err(err);
        }
        self.open_captures.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedTrack {
            enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            levels: self.levels.clone(),
            open_captures: self.open_captures.clone(),
        }))
    }

    async fn publish(&self, track: Arc<dyn LocalAudioTrack>) -> PartyResult<()> {
        if track.is_closed() {
            return Err(PartyError::Transport("cannot publish a closed track".into()));
        }
        let mut state = self.state.lock();
        if state.channel.is_none() {
            return Err(PartyError::Transport("publish before join".into()));
        }
        state.published = true;
        Ok(())
    }

    async fn unpublish(&self, _track: Arc<dyn LocalAudioTrack>) -> PartyResult<()> {
        self.state.lock().published = false;
        Ok(())
    }

    async fn renew_token(&self, token: &str) -> PartyResult<()> {
        let mut state = self.state.lock();
        if state.channel.is_none() {
            return Err(PartyError::Transport("renew before join".into()));
        }
        state.token = Some(token.to_string());
        Ok(())
    }

    fn set_remote_audio_enabled(&self, enabled: bool) {
        self.state.lock().remote_audio = enabled;
    }

    fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .connection
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn events(&self) -> flume::Receiver<TransportEvent> {
        self.events_rx.clone()
    }
}

/// Microphone permission that is granted or refused on demand.
pub struct SimulatedPermissions {
    granted: AtomicBool,
    requests: AtomicU32,
}

impl SimulatedPermissions {
    pub fn new(granted: bool) -> Self {
        Self {
            granted: AtomicBool::new(granted),
            requests: AtomicU32::new(0),
        }
    }

    pub fn set_granted(&self, granted: bool) {
        self.granted.store(granted, Ordering::SeqCst);
    }

    pub fn requests(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PermissionProvider for SimulatedPermissions {
    async fn request_microphone(&self) -> PartyResult<()> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.granted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PartyError::Permission("microphone access refused".into()))
        }
    }
}
