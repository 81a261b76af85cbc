//! Relay-side presence and broadcast fan-out.
//!
//! Each topic holds its subscribers and, per presence key, the meta tracked by
//! every connection under that key. All operations are synchronous and never
//! block: frames go out through unbounded queues.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::frames::{ClientFrame, PresenceMap, ServerFrame};
use crate::common::types::ConnId;

struct Subscriber {
    sink: flume::Sender<ServerFrame>,
    presence_key: String,
    broadcast_self: bool,
    ack: bool,
}

#[derive(Default)]
struct Room {
    subscribers: HashMap<ConnId, Subscriber>,
    presences: HashMap<String, HashMap<ConnId, Value>>,
}

impl Room {
    fn snapshot(&self) -> PresenceMap {
        self.presences
            .iter()
            .map(|(key, metas)| (key.clone(), metas.values().cloned().collect()))
            .collect()
    }

    fn fan_out(&self, frame: &ServerFrame, skip: Option<ConnId>) {
        for (conn, sub) in &self.subscribers {
            if Some(*conn) == skip {
                continue;
            }
            if sub.sink.send(frame.clone()).is_err() {
                trace!("{} sink closed, dropping frame", conn);
            }
        }
    }

    /// Removes `conn`'s meta and returns the resulting leave diff.
    fn remove_presence(&mut self, conn: ConnId) -> Option<PresenceMap> {
        let key = self.subscribers.get(&conn)?.presence_key.clone();
        let metas = self.presences.get_mut(&key)?;
        let old = metas.remove(&conn)?;
        if metas.is_empty() {
            self.presences.remove(&key);
        }
        Some(HashMap::from([(key, vec![old])]))
    }
}

#[derive(Default)]
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    next_conn: AtomicU64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn handle(&self, conn: ConnId, frame: ClientFrame, sink: &flume::Sender<ServerFrame>) {
        match frame {
            ClientFrame::Subscribe {
                topic,
                presence_key,
                broadcast_self,
                ack,
            } => self.subscribe(conn, topic, presence_key, broadcast_self, ack, sink),
            ClientFrame::Track { topic, payload } => self.track(conn, &topic, payload, sink),
            ClientFrame::Untrack { topic } => self.untrack(conn, &topic),
            ClientFrame::Broadcast {
                topic,
                event,
                payload,
            } => self.broadcast(conn, &topic, event, payload, sink),
            ClientFrame::Unsubscribe { topic } => self.unsubscribe(conn, &topic, sink),
            ClientFrame::Heartbeat => {
                let _ = sink.send(ServerFrame::HeartbeatAck);
            }
        }
    }

    fn subscribe(
        &self,
        conn: ConnId,
        topic: String,
        presence_key: String,
        broadcast_self: bool,
        ack: bool,
        sink: &flume::Sender<ServerFrame>,
    ) {
        if presence_key.is_empty() {
            let _ = sink.send(ServerFrame::Error {
                topic,
                message: "presence_key must not be empty".into(),
            });
            return;
        }

        let mut room = self.rooms.entry(topic.clone()).or_default();

        // Re-subscribing on the same connection replaces the old record.
        if let Some(leaves) = room.remove_presence(conn) {
            room.fan_out(
                &ServerFrame::PresenceDiff {
                    topic: topic.clone(),
                    joins: PresenceMap::new(),
                    leaves,
                },
                Some(conn),
            );
        }

        room.subscribers.insert(
            conn,
            Subscriber {
                sink: sink.clone(),
                presence_key,
                broadcast_self,
                ack,
            },
        );
        debug!(
            "[{}] {} subscribed ({} subscribers)",
            topic,
            conn,
            room.subscribers.len()
        );

        let _ = sink.send(ServerFrame::Subscribed {
            topic: topic.clone(),
        });
        let _ = sink.send(ServerFrame::PresenceState {
            topic,
            state: room.snapshot(),
        });
    }

    fn track(&self, conn: ConnId, topic: &str, payload: Value, sink: &flume::Sender<ServerFrame>) {
        let Some(mut room) = self.rooms.get_mut(topic) else {
            let _ = sink.send(ServerFrame::Error {
                topic: topic.to_string(),
                message: "track before subscribe".into(),
            });
            return;
        };
        let Some(key) = room.subscribers.get(&conn).map(|s| s.presence_key.clone()) else {
            let _ = sink.send(ServerFrame::Error {
                topic: topic.to_string(),
                message: "track before subscribe".into(),
            });
            return;
        };

        let old = room
            .presences
            .entry(key.clone())
            .or_default()
            .insert(conn, payload.clone());

        let mut leaves = PresenceMap::new();
        if let Some(old) = old {
            leaves.insert(key.clone(), vec![old]);
        }
        let joins = HashMap::from([(key, vec![payload])]);

        room.fan_out(
            &ServerFrame::PresenceDiff {
                topic: topic.to_string(),
                joins,
                leaves,
            },
            None,
        );
    }

    fn untrack(&self, conn: ConnId, topic: &str) {
        let Some(mut room) = self.rooms.get_mut(topic) else {
            return;
        };
        if let Some(leaves) = room.remove_presence(conn) {
            room.fan_out(
                &ServerFrame::PresenceDiff {
                    topic: topic.to_string(),
                    joins: PresenceMap::new(),
                    leaves,
                },
                None,
            );
        }
    }

    fn broadcast(
        &self,
        conn: ConnId,
        topic: &str,
        event: String,
        payload: Value,
        sink: &flume::Sender<ServerFrame>,
    ) {
        let Some(room) = self.rooms.get(topic) else {
            warn!("[{}] broadcast from {} to unknown topic", topic, conn);
            return;
        };
        let Some(sender) = room.subscribers.get(&conn) else {
            let _ = sink.send(ServerFrame::Error {
                topic: topic.to_string(),
                message: "broadcast before subscribe".into(),
            });
            return;
        };

        let skip = if sender.broadcast_self { None } else { Some(conn) };
        let wants_ack = sender.ack;
        room.fan_out(
            &ServerFrame::Broadcast {
                topic: topic.to_string(),
                event: event.clone(),
                payload,
            },
            skip,
        );

        if wants_ack {
            let _ = sink.send(ServerFrame::Ack {
                topic: topic.to_string(),
                event,
            });
        }
    }

    fn unsubscribe(&self, conn: ConnId, topic: &str, sink: &flume::Sender<ServerFrame>) {
        self.leave_topic(conn, topic);
        let _ = sink.send(ServerFrame::Closed {
            topic: topic.to_string(),
        });
    }

    fn leave_topic(&self, conn: ConnId, topic: &str) {
        let emptied = {
            let Some(mut room) = self.rooms.get_mut(topic) else {
                return;
            };
            if let Some(leaves) = room.remove_presence(conn) {
                room.fan_out(
                    &ServerFrame::PresenceDiff {
                        topic: topic.to_string(),
                        joins: PresenceMap::new(),
                        leaves,
                    },
                    Some(conn),
                );
            }
            room.subscribers.remove(&conn);
            room.subscribers.is_empty() && room.presences.is_empty()
        };

        if emptied {
            self.rooms
                .remove_if(topic, |_, room| room.subscribers.is_empty() && room.presences.is_empty());
        }
    }

    /// Drops every subscription and presence held by a closed connection.
    pub fn disconnect(&self, conn: ConnId) {
        let topics: Vec<String> = self
            .rooms
            .iter()
            .filter(|room| room.subscribers.contains_key(&conn))
            .map(|room| room.key().clone())
            .collect();
        for topic in topics {
            self.leave_topic(conn, &topic);
        }
        debug!("{} disconnected", conn);
    }

    /// Fails every subscription on `topic`, as a provider-side outage would.
    pub fn kick(&self, topic: &str, message: &str) {
        let conns: Vec<ConnId> = match self.rooms.get(topic) {
            Some(room) => room.subscribers.keys().copied().collect(),
            None => return,
        };
        for conn in conns {
            let sink = self
                .rooms
                .get(topic)
                .and_then(|room| room.subscribers.get(&conn).map(|s| s.sink.clone()));
            self.leave_topic(conn, topic);
            if let Some(sink) = sink {
                let _ = sink.send(ServerFrame::Error {
                    topic: topic.to_string(),
                    message: message.to_string(),
                });
            }
        }
    }

    pub fn presence_state(&self, topic: &str) -> PresenceMap {
        self.rooms
            .get(topic)
            .map(|room| room.snapshot())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.rooms
            .get(topic)
            .map(|room| room.subscribers.len())
            .unwrap_or(0)
    }

    pub fn topic_count(&self) -> usize {
        self.rooms.len()
    }
}
