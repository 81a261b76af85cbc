use serde::{Deserialize, Serialize};

/// Relay and credential endpoint served by the binary.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Optional shared secret expected in the `Authorization` header of
    /// `POST /token`.
    #[serde(default)]
    pub password: Option<String>,
    pub app_id: String,
    pub app_certificate: String,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

fn default_token_ttl() -> u64 {
    3_600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4180,
            password: None,
            app_id: "partyline-dev".to_string(),
            app_certificate: "change-me".to_string(),
            token_ttl_secs: default_token_ttl(),
        }
    }
}
