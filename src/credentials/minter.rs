use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::TokenGrant;
use crate::common::{
    errors::{PartyError, PartyResult},
    types::{TransportUid, now_secs},
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub app_id: String,
    pub channel: String,
    pub uid: TransportUid,
    pub expiry: u64,
}

/// Issues `base64url(claims).hex(hmac_sha256(claims))` tokens.
pub struct TokenMinter {
    app_id: String,
    certificate: Vec<u8>,
    ttl: Duration,
}

impl TokenMinter {
    pub fn new(app_id: impl Into<String>, certificate: impl AsRef<[u8]>, ttl: Duration) -> Self {
        Self {
            app_id: app_id.into(),
            certificate: certificate.as_ref().to_vec(),
            ttl,
        }
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    fn mac(&self) -> PartyResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.certificate)
            .map_err(|e| PartyError::Credential(format!("invalid app certificate: {}", e)))
    }

    pub fn mint(&self, channel: &str, uid: TransportUid) -> PartyResult<TokenGrant> {
        self.mint_at(channel, uid, now_secs())
    }

    pub fn mint_at(&self, channel: &str, uid: TransportUid, now: u64) -> PartyResult<TokenGrant> {
        let claims = TokenClaims {
            app_id: self.app_id.clone(),
            channel: channel.to_string(),
            uid,
            expiry: now + self.ttl.as_secs(),
        };
        let claims_json = serde_json::to_vec(&claims)
            .map_err(|e| PartyError::Credential(format!("failed to encode claims: {}", e)))?;
        let payload = URL_SAFE_NO_PAD.encode(claims_json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(TokenGrant {
            token: format!("{}.{}", payload, signature),
            expiry: claims.expiry,
        })
    }

    pub fn verify(&self, token: &str) -> PartyResult<TokenClaims> {
        self.verify_at(token, now_secs())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> PartyResult<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| PartyError::Credential("malformed token".into()))?;
        let signature =
            hex::decode(signature).map_err(|_| PartyError::Credential("malformed signature".into()))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| PartyError::Credential("bad token signature".into()))?;

        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| PartyError::Credential("malformed token payload".into()))?;
        let claims: TokenClaims = serde_json::from_slice(&bytes)
            .map_err(|_| PartyError::Credential("malformed token claims".into()))?;

        if claims.app_id != self.app_id {
            return Err(PartyError::Credential("token issued for another app".into()));
        }
        if claims.expiry <= now {
            return Err(PartyError::Credential("token expired".into()));
        }
        Ok(claims)
    }
}
