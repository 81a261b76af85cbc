use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{
    errors::{PartyError, PartyResult},
    types::{MemberId, TransportUid, now_ms},
};

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_STATUS_LEN: usize = 80;
pub const MAX_AVATAR_LEN: usize = 512;

/// Editable part of a member's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub avatar: String,
    pub status_text: String,
}

impl Profile {
    /// Trims and validates user-supplied profile fields.
    pub fn new(name: &str, avatar: &str, status_text: &str) -> PartyResult<Self> {
        let name = name.trim();
        let avatar = avatar.trim();
        let status_text = status_text.trim();

        if name.is_empty() {
            return Err(PartyError::Validation("name must not be empty".into()));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(PartyError::Validation(format!(
                "name is longer than {} characters",
                MAX_NAME_LEN
            )));
        }
        if status_text.chars().count() > MAX_STATUS_LEN {
            return Err(PartyError::Validation(format!(
                "status is longer than {} characters",
                MAX_STATUS_LEN
            )));
        }
        if avatar.len() > MAX_AVATAR_LEN {
            return Err(PartyError::Validation("avatar reference is too long".into()));
        }

        Ok(Self {
            name: name.to_string(),
            avatar: avatar.to_string(),
            status_text: status_text.to_string(),
        })
    }
}

/// Identity and profile of one party member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyMember {
    pub id: MemberId,
    pub name: String,
    pub avatar: String,
    pub status_text: String,
    pub created_at: u64,
    pub last_seen: u64,
}

impl PartyMember {
    pub fn new(id: MemberId, profile: Profile) -> Self {
        let now = now_ms();
        Self {
            id,
            name: profile.name,
            avatar: profile.avatar,
            status_text: profile.status_text,
            created_at: now,
            last_seen: now,
        }
    }

    pub fn profile(&self) -> Profile {
        Profile {
            name: self.name.clone(),
            avatar: self.avatar.clone(),
            status_text: self.status_text.clone(),
        }
    }

    pub fn apply_profile(&mut self, profile: Profile) {
        self.name = profile.name;
        self.avatar = profile.avatar;
        self.status_text = profile.status_text;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceStatus {
    Silent,
    Speaking,
    Muted,
    #[default]
    Disconnected,
    Error,
}

/// Audio state of a member. Written only by its owner; everyone else holds a
/// mirror updated from broadcasts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VoiceState {
    pub voice_status: VoiceStatus,
    pub muted: bool,
    pub is_deafened: bool,
    pub level: f32,
    #[serde(default)]
    pub transport_uid: Option<TransportUid>,
    pub timestamp: u64,
}

impl VoiceState {
    /// Freshly connected, not yet classified.
    pub fn connected(uid: TransportUid, muted: bool, is_deafened: bool) -> Self {
        Self {
            voice_status: if muted { VoiceStatus::Muted } else { VoiceStatus::Silent },
            muted,
            is_deafened,
            level: 0.0,
            transport_uid: Some(uid),
            timestamp: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Left,
}

/// One member as currently known by the local presence directory. This is
/// also the record tracked on the presence channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub member: PartyMember,
    #[serde(default)]
    pub voice: VoiceState,
    #[serde(default)]
    pub status: PresenceStatus,
}

impl PresenceEntry {
    pub fn new(member: PartyMember, voice: VoiceState) -> Self {
        Self {
            member,
            voice,
            status: PresenceStatus::Active,
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.member.id
    }

    pub fn to_meta(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parses a presence meta; malformed metas are ignored by callers.
    pub fn from_meta(meta: &Value) -> Option<Self> {
        serde_json::from_value(meta.clone()).ok()
    }
}
