use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CredentialsConfig {
    pub timeout_ms: u64,
    /// Renew this long before the token expires.
    pub renew_before_secs: u64,
}

impl CredentialsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_secs)
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            renew_before_secs: 30,
        }
    }
}
