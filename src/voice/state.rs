use crate::common::{errors::PartyError, types::TransportUid};

/// Lifecycle of the local audio session.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum VoiceSessionState {
    #[default]
    Idle,
    RequestingPermissions,
    PermissionDenied,
    Connecting {
        attempt: u32,
    },
    Connected {
        uid: TransportUid,
    },
    /// `error` is set when retries ran out; the user has to retry.
    Disconnected {
        error: Option<PartyError>,
    },
}

impl VoiceSessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::RequestingPermissions | Self::Connecting { .. })
    }

    /// States from which `connect` may start.
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::PermissionDenied | Self::Disconnected { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RequestingPermissions => "requesting_permissions",
            Self::PermissionDenied => "permission_denied",
            Self::Connecting { .. } => "connecting",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

impl std::fmt::Display for VoiceSessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting { attempt } => write!(f, "connecting({})", attempt),
            Self::Connected { uid } => write!(f, "connected({})", uid),
            Self::Disconnected { error: Some(e) } => write!(f, "disconnected({})", e),
            other => f.write_str(other.label()),
        }
    }
}
