use serde::Serialize;

/// Coarse lifecycle of the local member's participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartyState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
    /// Presence could not be recovered. Joining again starts over.
    Disconnected,
}

impl PartyState {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined)
    }
}

impl std::fmt::Display for PartyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
            Self::Disconnected => "disconnected",
        })
    }
}
