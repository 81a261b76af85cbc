//! Short-lived audio transport credentials.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{
    errors::{PartyError, PartyResult},
    http::HttpClient,
    types::{TransportUid, now_secs},
};

pub mod minter;
pub mod refresher;

pub use minter::{TokenClaims, TokenMinter};
pub use refresher::TokenRefresher;

/// A token and the unix time (seconds) at which it stops being accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub expiry: u64,
}

impl TokenGrant {
    pub fn seconds_left(&self) -> u64 {
        self.expiry.saturating_sub(now_secs())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRequest {
    pub channel_name: String,
    pub uid: TransportUid,
}

#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, channel: &str, uid: TransportUid) -> PartyResult<TokenGrant>;
}

/// Fetches tokens from the credential endpoint (`POST /token`).
pub struct HttpTokenSource {
    client: reqwest::Client,
    endpoint: String,
    password: Option<String>,
}

impl HttpTokenSource {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: std::time::Duration,
        password: Option<String>,
    ) -> PartyResult<Self> {
        let client = HttpClient::with_timeout(timeout)
            .map_err(|e| PartyError::Credential(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            password,
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self, channel: &str, uid: TransportUid) -> PartyResult<TokenGrant> {
        debug!("POST {} channel={} uid={}", self.endpoint, channel, uid);

        let mut request = self.client.post(&self.endpoint).json(&TokenRequest {
            channel_name: channel.to_string(),
            uid,
        });
        if let Some(password) = &self.password {
            request = request.header("authorization", password);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PartyError::Credential(format!("token request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PartyError::Credential(format!(
                "token endpoint returned {}",
                status
            )));
        }

        let grant: TokenGrant = response
            .json()
            .await
            .map_err(|e| PartyError::Credential(format!("malformed token response: {}", e)))?;
        if grant.token.is_empty() {
            return Err(PartyError::Credential("token endpoint returned an empty token".into()));
        }
        Ok(grant)
    }
}

#[async_trait]
impl TokenSource for TokenMinter {
    async fn fetch(&self, channel: &str, uid: TransportUid) -> PartyResult<TokenGrant> {
        self.mint(channel, uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_camel_case() {
        let body = serde_json::to_value(TokenRequest {
            channel_name: "voice:party".into(),
            uid: TransportUid(42),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "channelName": "voice:party", "uid": 42 }));
    }

    #[test]
    fn seconds_left_saturates() {
        let grant = TokenGrant {
            token: "t".into(),
            expiry: 1,
        };
        assert_eq!(grant.seconds_left(), 0);
    }
}
