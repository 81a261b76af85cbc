use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PartyConfig {
    /// The single shared room every member joins.
    pub room: String,
    /// File holding the persisted local session record.
    pub session_path: String,
    pub realtime_url: String,
    pub token_endpoint: String,
}

impl PartyConfig {
    pub fn presence_topic(&self) -> String {
        format!("presence:{}", self.room)
    }

    pub fn voice_topic(&self) -> String {
        format!("voice:{}", self.room)
    }
}

impl Default for PartyConfig {
    fn default() -> Self {
        Self {
            room: "party".to_string(),
            session_path: "./data/session.json".to_string(),
            realtime_url: "ws://127.0.0.1:4180/realtime".to_string(),
            token_endpoint: "http://127.0.0.1:4180/token".to_string(),
        }
    }
}
