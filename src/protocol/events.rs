use serde::{Deserialize, Serialize};

use super::models::{VoiceState, VoiceStatus};
use crate::common::types::{MemberId, TransportUid};

/// Broadcast event name carrying [`VoiceBroadcast`] payloads.
pub const VOICE_STATE_EVENT: &str = "voice_state";

/// Per-member voice update sent on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceBroadcast {
    pub id: MemberId,
    pub level: f32,
    pub voice_status: VoiceStatus,
    pub muted: bool,
    pub is_deafened: bool,
    pub transport_uid: Option<TransportUid>,
    pub timestamp: u64,
}

impl VoiceBroadcast {
    pub fn from_state(id: MemberId, state: &VoiceState) -> Self {
        Self {
            id,
            level: state.level,
            voice_status: state.voice_status,
            muted: state.muted,
            is_deafened: state.is_deafened,
            transport_uid: state.transport_uid,
            timestamp: state.timestamp,
        }
    }

    pub fn state(&self) -> VoiceState {
        VoiceState {
            voice_status: self.voice_status,
            muted: self.muted,
            is_deafened: self.is_deafened,
            level: self.level.clamp(0.0, 1.0),
            transport_uid: self.transport_uid,
            timestamp: self.timestamp,
        }
    }
}

/// Voice update delivered to the coordinator, local or remote.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceUpdate {
    pub id: MemberId,
    pub state: VoiceState,
    pub local: bool,
}
