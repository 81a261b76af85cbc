use std::{future::Future, time::Duration};

use serde::Serialize;

/// Failure taxonomy shared by every party component.
///
/// `Clone` so a single in-flight result can be handed to several waiters.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PartyError {
    /// Microphone access was refused. Terminal until the user retries.
    #[error("microphone permission denied: {0}")]
    Permission(String),
    /// Presence or broadcast channel failure.
    #[error("channel error: {0}")]
    Channel(String),
    /// Audio session join/publish failure.
    #[error("audio transport error: {0}")]
    Transport(String),
    /// Token fetch or renewal failure.
    #[error("credential error: {0}")]
    Credential(String),
    /// Malformed input or stored data.
    #[error("validation error: {0}")]
    Validation(String),
    /// The local session record could not be read or written.
    #[error("session storage error: {0}")]
    Storage(String),
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0} already in progress")]
    Busy(&'static str),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<PartyError> },
}

pub type PartyResult<T> = std::result::Result<T, PartyError>;

impl PartyError {
    /// Whether a backoff loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Channel(_) | Self::Transport(_) | Self::Credential(_) | Self::Timeout { .. }
        )
    }

    /// Errors the caller must surface instead of swallowing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Permission(_) | Self::Exhausted { .. })
    }

    /// The innermost error, looking through `Exhausted`.
    pub fn root(&self) -> &PartyError {
        match self {
            Self::Exhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Runs a network-facing future with a hard deadline.
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> PartyResult<T>
where
    F: Future<Output = PartyResult<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(PartyError::Timeout { operation, after }),
    }
}

/// JSON error body returned by the HTTP routes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    /// HTTP status code.
    pub status: u16,
    /// HTTP status reason phrase (e.g. "Bad Request").
    pub error: String,
    /// Human-readable error message.
    pub message: String,
    /// The request path that caused the error.
    pub path: String,
}

impl ApiError {
    fn new(status: u16, error: &str, message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            timestamp: crate::common::types::now_ms(),
            status,
            error: error.into(),
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(400, "Bad Request", message, path)
    }

    pub fn unauthorized(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(401, "Unauthorized", message, path)
    }

    pub fn internal(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(500, "Internal Server Error", message, path)
    }
}
