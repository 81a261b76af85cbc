use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::BackoffConfig;
use crate::common::types::AnyResult;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct VoiceConfig {
    pub app_id: String,
    pub sample_interval_ms: u64,
    pub debounce_ms: u64,
    pub speak_high: f32,
    pub speak_low: f32,
    /// Consecutive samples below `speak_low` before speaking ends.
    pub release_samples: u32,
    pub rise_factor: f32,
    pub fall_factor: f32,
    pub level_epsilon: f32,
    pub operation_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl VoiceConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> AnyResult<()> {
        if !(self.speak_low < self.speak_high) {
            return Err(format!(
                "voice.speak_low ({}) must be below voice.speak_high ({})",
                self.speak_low, self.speak_high
            )
            .into());
        }
        for (name, value) in [
            ("rise_factor", self.rise_factor),
            ("fall_factor", self.fall_factor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("voice.{} must be within [0, 1], got {}", name, value).into());
            }
        }
        if self.sample_interval_ms == 0 {
            return Err("voice.sample_interval_ms must be positive".into());
        }
        Ok(())
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            app_id: "partyline-dev".to_string(),
            sample_interval_ms: 100,
            debounce_ms: 150,
            speak_high: 0.45,
            speak_low: 0.35,
            release_samples: 2,
            rise_factor: 0.7,
            fall_factor: 0.3,
            level_epsilon: 0.1,
            operation_timeout_ms: 10_000,
            backoff: BackoffConfig {
                base_ms: 2_000,
                cap_ms: 10_000,
                max_attempts: 3,
            },
        }
    }
}
