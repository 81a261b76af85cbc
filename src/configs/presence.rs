use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;

/// Exponential backoff table shared by the presence and voice sections.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PresenceConfig {
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub subscribe_timeout_ms: u64,
    pub backoff: BackoffConfig,
}

impl PresenceConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 120,
            sweep_interval_secs: 60,
            heartbeat_interval_secs: 30,
            subscribe_timeout_ms: 10_000,
            backoff: BackoffConfig {
                base_ms: 1_000,
                cap_ms: 5_000,
                max_attempts: 5,
            },
        }
    }
}
