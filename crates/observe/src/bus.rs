//! In-process publish/subscribe on named topics, plus the registry of open
//! connections between components.
//!
//! Each topic is a `tokio::sync::broadcast` channel, so subscribers see the
//! messages of one topic in publish order. A bounded history per topic lets
//! late readers catch up.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;
const HISTORY_LIMIT: usize = 1000;

/// Topic on which connection changes are announced.
pub const CONNECTIONS_TOPIC: &str = "connections";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub published_at: OffsetDateTime,
}

#[derive(Debug)]
struct Topic {
    sender: broadcast::Sender<Message>,
    history: VecDeque<Message>,
}

impl Topic {
    fn new() -> Self {
        Self { sender: broadcast::channel(CHANNEL_CAPACITY).0, history: VecDeque::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopicStats {
    pub subscriber_count: usize,
    pub message_count: usize,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub total_topics: usize,
    pub total_subscribers: usize,
    pub topics: BTreeMap<String, TopicStats>,
}

#[derive(Debug, Default)]
pub struct CommunicationManager {
    topics: Mutex<HashMap<String, Topic>>,
}

impl CommunicationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `payload` on `topic`. Returns how many subscribers were
    /// listening; publishing to nobody is not an error.
    pub fn publish(&self, topic: &str, payload: Value) -> usize {
        let message = Message { topic: topic.to_string(), payload, published_at: OffsetDateTime::now_utc() };
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        if entry.history.len() == HISTORY_LIMIT {
            entry.history.pop_front();
        }
        entry.history.push_back(message.clone());
        let delivered = entry.sender.send(message).unwrap_or(0);
        tracing::trace!(topic = %topic, delivered, "published message");
        delivered
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Message> {
        self.topics.lock().entry(topic.to_string()).or_insert_with(Topic::new).sender.subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, |t| t.sender.receiver_count())
    }

    /// Up to `limit` most recent messages of `topic`, oldest first.
    pub fn history(&self, topic: &str, limit: usize) -> Vec<Message> {
        let topics = self.topics.lock();
        let Some(topic) = topics.get(topic) else {
            return Vec::new();
        };
        topic.history.iter().skip(topic.history.len().saturating_sub(limit)).cloned().collect()
    }

    pub fn clear_history(&self, topic: Option<&str>) {
        let mut topics = self.topics.lock();
        match topic {
            Some(name) => {
                if let Some(topic) = topics.get_mut(name) {
                    topic.history.clear();
                }
            },
            None => topics.values_mut().for_each(|t| t.history.clear()),
        }
    }

    pub fn stats(&self) -> BusStats {
        let topics = self.topics.lock();
        let mut stats = BusStats { total_topics: topics.len(), ..Default::default() };
        for (name, topic) in topics.iter() {
            let subscriber_count = topic.sender.receiver_count();
            stats.total_subscribers += subscriber_count;
            stats.topics.insert(name.clone(), TopicStats {
                subscriber_count,
                message_count: topic.history.len(),
                last_message: topic.history.back().cloned(),
            });
        }
        stats
    }
}

/// Identity of a connection: `<source>_<target>_<type>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ConnectionId {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub connection_type: String,
}

impl ConnectionId {
    pub fn new(source: impl Into<String>, target: impl Into<String>, connection_type: impl Into<String>) -> Self {
        Self { source: source.into(), target: target.into(), connection_type: connection_type.into() }
    }

    pub fn involves(&self, component: &str) -> bool {
        self.source == component || self.target == component
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.source, self.target, self.connection_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub metadata: Map<String, Value>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
}

/// Open connections, announced on [`CONNECTIONS_TOPIC`] as they change.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: Mutex<BTreeMap<String, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `id`. Returns `false` when a connection with that id is already
    /// active.
    pub fn open(&self, bus: &CommunicationManager, id: ConnectionId, metadata: Map<String, Value>) -> bool {
        let key = id.to_string();
        let now = OffsetDateTime::now_utc();
        {
            let mut connections = self.connections.lock();
            if connections.get(&key).is_some_and(|c| c.is_active) {
                tracing::warn!(connection = %key, "connection already open");
                return false;
            }
            let connection = Connection { id: id.clone(), metadata, is_active: true, created_at: now, last_activity_at: now };
            connections.insert(key.clone(), connection);
        }
        bus.publish(CONNECTIONS_TOPIC, json!({"event": "connection_established", "connection_id": key, "connection": id}));
        true
    }

    pub fn close(&self, bus: &CommunicationManager, key: &str) -> bool {
        let id = {
            let mut connections = self.connections.lock();
            match connections.get_mut(key) {
                Some(connection) if connection.is_active => {
                    connection.is_active = false;
                    connection.id.clone()
                },
                _ => return false,
            }
        };
        bus.publish(CONNECTIONS_TOPIC, json!({"event": "connection_closed", "connection_id": key, "connection": id}));
        true
    }

    pub fn touch(&self, key: &str) -> bool {
        match self.connections.lock().get_mut(key) {
            Some(connection) => {
                connection.last_activity_at = OffsetDateTime::now_utc();
                true
            },
            None => false,
        }
    }

    pub fn get(&self, key: &str) -> Option<Connection> {
        self.connections.lock().get(key).cloned()
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.connections.lock().get(key).is_some_and(|c| c.is_active)
    }

    pub fn active(&self) -> Vec<Connection> {
        self.connections.lock().values().filter(|c| c.is_active).cloned().collect()
    }

    pub fn by_component(&self, component: &str) -> Vec<Connection> {
        self.connections.lock().values().filter(|c| c.id.involves(component)).cloned().collect()
    }
}
