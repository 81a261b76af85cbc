use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Presence key → metas currently tracked under it (one per connection).
pub type PresenceMap = HashMap<String, Vec<Value>>;

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        topic: String,
        presence_key: String,
        broadcast_self: bool,
        ack: bool,
    },
    Track {
        topic: String,
        payload: Value,
    },
    Untrack {
        topic: String,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
    Unsubscribe {
        topic: String,
    },
    Heartbeat,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    Subscribed {
        topic: String,
    },
    Error {
        topic: String,
        message: String,
    },
    PresenceState {
        topic: String,
        state: PresenceMap,
    },
    PresenceDiff {
        topic: String,
        joins: PresenceMap,
        leaves: PresenceMap,
    },
    Broadcast {
        topic: String,
        event: String,
        payload: Value,
    },
    Ack {
        topic: String,
        event: String,
    },
    Closed {
        topic: String,
    },
    HeartbeatAck,
}

impl ServerFrame {
    pub fn topic(&self) -> Option<&str> {
        match self {
            Self::Subscribed { topic }
            | Self::Error { topic, .. }
            | Self::PresenceState { topic, .. }
            | Self::PresenceDiff { topic, .. }
            | Self::Broadcast { topic, .. }
            | Self::Ack { topic, .. }
            | Self::Closed { topic } => Some(topic),
            Self::HeartbeatAck => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_tagged_by_op() {
        let frame = ClientFrame::Subscribe {
            topic: "presence:party".into(),
            presence_key: "m1".into(),
            broadcast_self: false,
            ack: true,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["presence_key"], "m1");

        let parsed: ServerFrame =
            serde_json::from_str(r#"{"op":"heartbeat_ack"}"#).unwrap();
        assert_eq!(parsed, ServerFrame::HeartbeatAck);
        assert_eq!(parsed.topic(), None);
    }

    #[test]
    fn unknown_ops_are_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"op":"shout","topic":"x"}"#).is_err());
    }
}
