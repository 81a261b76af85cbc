use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub party: PartyConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        crate::log_println!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        Self::parse(&config_str).map_err(|e| format!("{}: {}", config_path, e).into())
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        if config_str.trim().is_empty() {
            return Err("configuration is empty".into());
        }
        let config: Config = toml::from_str(config_str)?;
        config.voice.validate()?;
        if config.server.token_ttl_secs <= config.credentials.renew_before_secs {
            return Err(format!(
                "server.token_ttl_secs ({}) must exceed credentials.renew_before_secs ({})",
                config.server.token_ttl_secs, config.credentials.renew_before_secs
            )
            .into());
        }
        Ok(config)
    }
}
