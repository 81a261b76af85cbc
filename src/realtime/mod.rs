//! Presence/broadcast channel contract and the runtimes implementing it.
//!
//! Callers only see [`RealtimeClient`] and [`RealtimeChannel`]. Presence and
//! broadcast events arrive as typed [`ChannelEvent`]s on a per-channel queue
//! that is dropped with the handle.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::errors::PartyResult;

pub mod channel;
pub mod connection;
pub mod frames;
pub mod memory;
pub mod room;
pub mod websocket;

pub use channel::ChannelHandle;
pub use connection::RealtimeConnection;
pub use frames::{ClientFrame, PresenceMap, ServerFrame};
pub use memory::LocalHub;
pub use room::RoomRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Key under which this client's tracked record is grouped.
    pub presence_key: String,
    /// Receive our own broadcasts back.
    pub broadcast_self: bool,
    /// Ask the server to acknowledge broadcasts.
    pub ack: bool,
}

impl ChannelConfig {
    pub fn presence(key: impl Into<String>) -> Self {
        Self {
            presence_key: key.into(),
            broadcast_self: false,
            ack: true,
        }
    }

    pub fn broadcast(key: impl Into<String>) -> Self {
        Self {
            presence_key: key.into(),
            broadcast_self: true,
            ack: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribing,
    Subscribed,
    ChannelError(String),
    Closed,
    TimedOut,
}

impl ChannelStatus {
    /// Statuses after which the channel must be re-subscribed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::ChannelError(_) | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The presence snapshot changed; read it with
    /// [`RealtimeChannel::presence_state`].
    Sync,
    Join { key: String, metas: Vec<Value> },
    Leave { key: String, metas: Vec<Value> },
    Broadcast { event: String, payload: Value },
    Status(ChannelStatus),
}

#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    fn topic(&self) -> &str;

    fn status(&self) -> ChannelStatus;

    /// The transport's authoritative presence snapshot.
    fn presence_state(&self) -> PresenceMap;

    /// Event queue of this channel. Every receiver shares one queue, so a
    /// channel is expected to have a single consumer.
    fn events(&self) -> flume::Receiver<ChannelEvent>;

    async fn track(&self, payload: Value) -> PartyResult<()>;

    async fn untrack(&self) -> PartyResult<()>;

    async fn send(&self, event: &str, payload: Value) -> PartyResult<()>;

    async fn unsubscribe(&self) -> PartyResult<()>;
}

#[async_trait]
pub trait RealtimeClient: Send + Sync {
    /// Resolves once the server confirmed the subscription.
    async fn subscribe(
        &self,
        topic: &str,
        config: ChannelConfig,
    ) -> PartyResult<Arc<dyn RealtimeChannel>>;
}
