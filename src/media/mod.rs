//! Audio transport contract: the media SDK the voice session drives.
//!
//! Provider callbacks (`connection-state-change`, `user-published`, ...) are
//! delivered as [`TransportEvent`]s on a single queue owned by the transport.

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{errors::PartyResult, types::TransportUid};

pub mod simulated;

pub use simulated::{SimulatedPermissions, SimulatedTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We called `leave`.
    Leave,
    NetworkError,
    TokenExpired,
    ServerKicked,
}

impl DisconnectReason {
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Leave)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChange {
        current: ConnectionState,
        previous: ConnectionState,
        reason: Option<DisconnectReason>,
    },
    UserPublished {
        uid: TransportUid,
    },
    UserUnpublished {
        uid: TransportUid,
    },
    TokenPrivilegeWillExpire,
}

impl TransportEvent {
    /// A drop the session did not ask for.
    pub fn is_unexpected_drop(&self) -> bool {
        match self {
            Self::ConnectionStateChange {
                current: ConnectionState::Disconnected,
                reason,
                ..
            } => !reason.as_ref().is_some_and(DisconnectReason::is_expected),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioCaptureConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// The local microphone capture handle.
pub trait LocalAudioTrack: Send + Sync {
    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;

    /// Instantaneous input level in `[0, 1]`. Zero while disabled.
    fn volume_level(&self) -> f32;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait AudioTransport: Send + Sync {
    /// Joins `channel`; resolves with the uid the session ended up with.
    async fn join(
        &self,
        app_id: &str,
        channel: &str,
        token: &str,
        uid: TransportUid,
    ) -> PartyResult<TransportUid>;

    async fn leave(&self) -> PartyResult<()>;

    async fn create_local_audio_capture(
        &self,
        config: AudioCaptureConfig,
    ) -> PartyResult<Arc<dyn LocalAudioTrack>>;

    async fn publish(&self, track: Arc<dyn LocalAudioTrack>) -> PartyResult<()>;

    async fn unpublish(&self, track: Arc<dyn LocalAudioTrack>) -> PartyResult<()>;

    /// Swaps the credential of a live session without reconnecting.
    async fn renew_token(&self, token: &str) -> PartyResult<()>;

    /// Mutes or unmutes playback of every remote user.
    fn set_remote_audio_enabled(&self, enabled: bool);

    fn connection_state(&self) -> ConnectionState;

    fn events(&self) -> flume::Receiver<TransportEvent>;
}

#[async_trait]
pub trait PermissionProvider: Send + Sync {
    /// Resolves once microphone access is granted; `PartyError::Permission`
    /// when the user refused.
    async fn request_microphone(&self) -> PartyResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unrequested_disconnects_are_drops() {
        let drop = TransportEvent::ConnectionStateChange {
            current: ConnectionState::Disconnected,
            previous: ConnectionState::Connected,
            reason: Some(DisconnectReason::NetworkError),
        };
        assert!(drop.is_unexpected_drop());

        let leave = TransportEvent::ConnectionStateChange {
            current: ConnectionState::Disconnected,
            previous: ConnectionState::Connected,
            reason: Some(DisconnectReason::Leave),
        };
        assert!(!leave.is_unexpected_drop());
        assert!(!TransportEvent::TokenPrivilegeWillExpire.is_unexpected_drop());
    }
}
