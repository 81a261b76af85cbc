use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{TokenGrant, TokenSource};
use crate::{
    backoff::cancellable_sleep,
    common::{
        errors::{PartyResult, with_timeout},
        types::TransportUid,
    },
};

/// Shortest wait between two renewals.
pub const MIN_RENEWAL_WAIT: Duration = Duration::from_secs(5);

/// Hands a renewed token to the live transport session.
pub type ApplyToken = Arc<dyn Fn(String) -> BoxFuture<'static, PartyResult<()>> + Send + Sync>;

/// Fetches a transport credential and keeps it fresh for one session.
///
/// A failed renewal is logged and the current token is left to run out; the
/// session's reconnect path takes over if the transport then drops.
pub struct TokenRefresher {
    source: Arc<dyn TokenSource>,
    channel: String,
    uid: TransportUid,
    timeout: Duration,
    renew_before: Duration,
    current: Arc<Mutex<Option<TokenGrant>>>,
    cancel: CancellationToken,
}

impl TokenRefresher {
    pub fn new(
        source: Arc<dyn TokenSource>,
        channel: impl Into<String>,
        uid: TransportUid,
        timeout: Duration,
        renew_before: Duration,
    ) -> Self {
        Self {
            source,
            channel: channel.into(),
            uid,
            timeout,
            renew_before,
            current: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn current(&self) -> Option<TokenGrant> {
        self.current.lock().clone()
    }

    pub async fn fetch(&self) -> PartyResult<TokenGrant> {
        let grant = fetch_with_timeout(&*self.source, &self.channel, self.uid, self.timeout).await?;
        debug!(
            "[{}] token for uid {} valid for {}s",
            self.channel,
            self.uid,
            grant.seconds_left()
        );
        *self.current.lock() = Some(grant.clone());
        Ok(grant)
    }

    /// Fetches a fresh token and applies it right away, e.g. when the
    /// transport warns that the current one is about to expire.
    pub async fn renew_now(&self, apply: &ApplyToken) -> PartyResult<()> {
        let grant = self.fetch().await?;
        apply(grant.token).await
    }

    /// How long to wait before renewing `grant`.
    pub fn renewal_delay(&self, grant: &TokenGrant) -> Duration {
        renewal_delay(grant, self.renew_before)
    }

    /// Starts the renewal timer. Runs until cancelled or a renewal fails.
    pub fn schedule(&self, apply: ApplyToken) {
        let Some(mut grant) = self.current() else {
            warn!("[{}] no token to renew", self.channel);
            return;
        };

        let source = self.source.clone();
        let channel = self.channel.clone();
        let uid = self.uid;
        let timeout = self.timeout;
        let renew_before = self.renew_before;
        let current = self.current.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let wait = renewal_delay(&grant, renew_before);
                debug!("[{}] renewing token in {:?}", channel, wait);
                if cancellable_sleep(&cancel, wait).await.is_err() {
                    return;
                }

                let renewed = match fetch_with_timeout(&*source, &channel, uid, timeout).await {
                    Ok(renewed) => renewed,
                    Err(e) => {
                        warn!(
                            "[{}] token renewal failed, keeping current token until expiry: {}",
                            channel, e
                        );
                        return;
                    }
                };

                if cancel.is_cancelled() {
                    return;
                }
                if renewed.seconds_left() == 0 {
                    warn!("[{}] renewed token is already expired, giving up renewal", channel);
                    return;
                }
                if let Err(e) = apply(renewed.token.clone()).await {
                    warn!("[{}] transport rejected renewed token: {}", channel, e);
                    return;
                }

                info!("[{}] token renewed", channel);
                *current.lock() = Some(renewed.clone());
                grant = renewed;
            }
        });
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TokenRefresher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `renew_before` ahead of expiry, unless that leaves less than
/// [`MIN_RENEWAL_WAIT`]; short-lived grants then wait half their lifetime.
fn renewal_delay(grant: &TokenGrant, renew_before: Duration) -> Duration {
    let left = Duration::from_secs(grant.seconds_left());
    let wait = left.saturating_sub(renew_before);
    if wait >= MIN_RENEWAL_WAIT {
        wait
    } else {
        (left / 2).max(MIN_RENEWAL_WAIT)
    }
}

async fn fetch_with_timeout(
    source: &dyn TokenSource,
    channel: &str,
    uid: TransportUid,
    timeout: Duration,
) -> PartyResult<TokenGrant> {
    with_timeout("token fetch", timeout, source.fetch(channel, uid)).await
}
