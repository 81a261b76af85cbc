//! Exponential backoff shared by every reconnect path.
//!
//! `delay(attempt) = min(base * 2^(attempt - 1), cap)`, attempts are 1-based.
//! Waits are cancellable so a torn-down session never retries into a
//! disposed context.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::errors::{PartyError, PartyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Presence/broadcast channel recovery.
    pub const CHANNEL: Self = Self {
        base: Duration::from_millis(1_000),
        cap: Duration::from_millis(5_000),
        max_attempts: 5,
    };

    /// Audio transport reconnect.
    pub const MEDIA: Self = Self {
        base: Duration::from_millis(2_000),
        cap: Duration::from_millis(10_000),
        max_attempts: 3,
    };

    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Attempt counter over a policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Advances the counter and returns the delay for the new attempt.
    pub fn next(&mut self) -> Duration {
        self.attempt += 1;
        self.policy.delay(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Sleeps unless `cancel` fires first.
pub async fn cancellable_sleep(cancel: &CancellationToken, delay: Duration) -> PartyResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(PartyError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Retry driver bound to one owner's cancellation token.
#[derive(Debug, Clone)]
pub struct BackoffController {
    label: String,
    policy: BackoffPolicy,
    cancel: CancellationToken,
}

impl BackoffController {
    pub fn new(label: impl Into<String>, policy: BackoffPolicy, cancel: CancellationToken) -> Self {
        Self {
            label: label.into(),
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Runs `op` immediately, then retries after `delay(1)`, `delay(2)`, ...
    /// until it succeeds or `max_attempts` calls have failed, at which point
    /// `on_give_up` sees the last error and `Exhausted` is returned.
    ///
    /// Non-retryable errors (permission, cancellation, validation) stop the
    /// loop at once without calling `on_give_up`.
    pub async fn attempt<T, F, Fut, G>(&self, op: F, on_give_up: G) -> PartyResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PartyResult<T>>,
        G: FnOnce(&PartyError),
    {
        self.run(false, op, on_give_up).await
    }

    /// Like [`attempt`](Self::attempt), but waits `delay(n)` before every
    /// call including the first. Used after an unexpected drop, where an
    /// immediate retry would hit the same failure.
    pub async fn reattempt<T, F, Fut, G>(&self, op: F, on_give_up: G) -> PartyResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PartyResult<T>>,
        G: FnOnce(&PartyError),
    {
        self.run(true, op, on_give_up).await
    }

    async fn run<T, F, Fut, G>(&self, delay_first: bool, mut op: F, on_give_up: G) -> PartyResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = PartyResult<T>>,
        G: FnOnce(&PartyError),
    {
        let mut backoff = Backoff::new(self.policy);

        loop {
            if self.cancel.is_cancelled() {
                return Err(PartyError::Cancelled);
            }

            let delay = backoff.next();
            let attempt = backoff.attempt();
            if delay_first {
                debug!("[{}] attempt {} in {:?}", self.label, attempt, delay);
                cancellable_sleep(&self.cancel, delay).await?;
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(PartyError::Cancelled),
                result = op(attempt) => result,
            };

            let err = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("[{}] succeeded on attempt {}", self.label, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                debug!("[{}] attempt {} failed terminally: {}", self.label, attempt, err);
                return Err(err);
            }

            if backoff.is_exhausted() {
                warn!(
                    "[{}] giving up after {} attempts: {}",
                    self.label, attempt, err
                );
                on_give_up(&err);
                return Err(PartyError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if !delay_first {
                let wait = self.policy.delay(attempt);
                warn!(
                    "[{}] attempt {} failed: {}. Retrying in {:?}",
                    self.label, attempt, err, wait
                );
                cancellable_sleep(&self.cancel, wait).await?;
            } else {
                warn!("[{}] attempt {} failed: {}", self.label, attempt, err);
            }
        }
    }
}
