use serde::{Deserialize, Serialize};

use super::models::PartyMember;
use crate::common::{
    errors::{PartyError, PartyResult},
    types::MemberId,
};

/// Locally persisted session record, read once at startup for silent
/// restoration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub name: String,
    pub avatar: String,
    pub status: String,
    pub created_at: u64,
    pub last_seen: u64,
}

impl StoredSession {
    pub fn validate(&self) -> PartyResult<()> {
        if self.id.trim().is_empty() {
            return Err(PartyError::Validation("stored session has no id".into()));
        }
        if self.name.trim().is_empty() {
            return Err(PartyError::Validation("stored session has no name".into()));
        }
        if self.last_seen < self.created_at {
            return Err(PartyError::Validation(
                "stored session was last seen before it was created".into(),
            ));
        }
        Ok(())
    }

    pub fn into_member(self) -> PartyResult<PartyMember> {
        self.validate()?;
        Ok(PartyMember {
            id: MemberId(self.id),
            name: self.name,
            avatar: self.avatar,
            status_text: self.status,
            created_at: self.created_at,
            last_seen: self.last_seen,
        })
    }
}

impl From<&PartyMember> for StoredSession {
    fn from(member: &PartyMember) -> Self {
        Self {
            id: member.id.0.clone(),
            name: member.name.clone(),
            avatar: member.avatar.clone(),
            status: member.status_text.clone(),
            created_at: member.created_at,
            last_seen: member.last_seen,
        }
    }
}
