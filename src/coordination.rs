//! Namespaced ephemeral key/value, pub/sub, and timeline store (C4).
//!
//! Modeled against a [`CoordinationBackend`] trait so a real RESP-compatible
//! client can be dropped in later (spec.md §6: "Any RESP-compatible
//! implementation satisfies the contract"). No example in the retrieved
//! corpus wires an actual Redis client, so this crate ships only the
//! in-process [`InMemoryCoordinationBackend`] — DashMap-backed KV with
//! explicit expiry swept lazily on read, `tokio::sync::broadcast` channels
//! for pub/sub, and a per-workflow `VecDeque` timeline. When the backend is
//! unavailable, operations return falsy/`None` and the rest of the system
//! keeps running in degraded mode, per spec.md §4.4.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

const COORD_PREFIX: &str = "coord:";
const SCRATCH_PREFIX: &str = "scratch:";
const NOTIFY_PREFIX: &str = "notify:";
const TIMELINE_PREFIX: &str = "timeline:";
const STATE_PREFIX: &str = "state:";

const DEFAULT_COORD_TTL_SECS: i64 = 3600;
const SCRATCH_TTL_SECS: i64 = 1800;
const DEFAULT_STATE_TTL_SECS: i64 = 7200;
const TIMELINE_TTL_SECS: i64 = 86_400;

/// A single event appended to a workflow's timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Caller-defined event kind (e.g. `"workflow_started"`).
    pub event_type: String,
    /// Free-form event payload.
    pub data: Value,
}

/// Health snapshot returned by [`CoordinationStore::health`].
#[derive(Debug, Clone, Serialize)]
pub struct CoordinationHealth {
    /// Whether the backend responded successfully.
    pub healthy: bool,
    /// Observed round-trip latency.
    pub latency_ms: u64,
    /// Backend-reported version string, if any.
    pub version: Option<String>,
    /// Backend-reported connected client count, if any.
    pub connected_clients: Option<u64>,
    /// Backend-reported memory usage in bytes, if any.
    pub memory_used: Option<u64>,
}

#[derive(Clone)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl_seconds: i64) -> Self {
        Self {
            value,
            expires_at: Utc::now() + Duration::seconds(ttl_seconds),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Backend contract for the coordination store. A real deployment would
/// implement this against Redis or another RESP-compatible store; this
/// crate ships only [`InMemoryCoordinationBackend`].
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Connects / pings the backend; returns whether it is usable.
    async fn initialize(&self) -> bool;
    /// `SETEX key ttl value`.
    async fn set(&self, key: &str, value: Value, ttl_seconds: i64) -> bool;
    /// `GET key`.
    async fn get(&self, key: &str) -> Option<Value>;
    /// `LPUSH key value` with TTL refresh.
    async fn lpush(&self, key: &str, value: Value, ttl_seconds: i64) -> bool;
    /// `LRANGE key 0 limit`, newest-first.
    async fn lrange(&self, key: &str, limit: usize) -> Vec<Value>;
    /// `PUBLISH channel message`; returns subscriber count.
    async fn publish(&self, channel: &str, message: Value) -> usize;
    /// Backend health check (`PING`/`INFO`).
    async fn health(&self) -> CoordinationHealth;
}

/// Default in-process backend: DashMap KV + broadcast pub/sub.
#[derive(Default)]
pub struct InMemoryCoordinationBackend {
    kv: DashMap<String, Expiring<Value>>,
    lists: DashMap<String, Expiring<VecDeque<Value>>>,
    topics: DashMap<String, broadcast::Sender<Value>>,
}

impl InMemoryCoordinationBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.topics
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }

    /// Subscribes to a notification channel; returns a receiver for
    /// published messages.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<Value> {
        self.topic_sender(channel).subscribe()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryCoordinationBackend {
    async fn initialize(&self) -> bool {
        true
    }

    async fn set(&self, key: &str, value: Value, ttl_seconds: i64) -> bool {
        self.kv.insert(key.to_string(), Expiring::new(value, ttl_seconds));
        true
    }

    async fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        match self.kv.get(key) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.kv.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    async fn lpush(&self, key: &str, value: Value, ttl_seconds: i64) -> bool {
        let now = Utc::now();
        let mut entry = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(VecDeque::new(), ttl_seconds));
        if entry.is_expired(now) {
            entry.value.clear();
        }
        entry.value.push_front(value);
        entry.expires_at = now + Duration::seconds(ttl_seconds);
        true
    }

    async fn lrange(&self, key: &str, limit: usize) -> Vec<Value> {
        let now = Utc::now();
        match self.lists.get(key) {
            Some(entry) if entry.is_expired(now) => {
                drop(entry);
                self.lists.remove(key);
                Vec::new()
            }
            Some(entry) => entry.value.iter().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    async fn publish(&self, channel: &str, message: Value) -> usize {
        let tx = self.topic_sender(channel);
        let receivers = tx.receiver_count();
        let _ = tx.send(message);
        receivers
    }

    async fn health(&self) -> CoordinationHealth {
        CoordinationHealth {
            healthy: true,
            latency_ms: 0,
            version: Some("in-memory-0".to_string()),
            connected_clients: Some(self.topics.len() as u64),
            memory_used: None,
        }
    }
}

/// Namespaced coordination facade over a [`CoordinationBackend`].
pub struct CoordinationStore {
    backend: Arc<dyn CoordinationBackend>,
    available: RwLock<bool>,
}

impl CoordinationStore {
    /// Wraps a backend implementation.
    pub fn new(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            backend,
            available: RwLock::new(false),
        }
    }

    /// Convenience constructor using the in-process backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCoordinationBackend::new()))
    }

    /// Connects to the backend; must be called before other operations are
    /// expected to succeed. Returns whether coordination is available.
    pub async fn initialize(&self) -> bool {
        let ok = self.backend.initialize().await;
        *self.available.write() = ok;
        if !ok {
            warn!("coordination backend unavailable; continuing in degraded mode");
        }
        ok
    }

    fn is_available(&self) -> bool {
        *self.available.read()
    }

    /// Sets a value under the `coord:` namespace.
    pub async fn set_coord(&self, key: &str, value: Value, ttl_seconds: Option<i64>) -> bool {
        if !self.is_available() {
            return false;
        }
        let namespaced = format!("{COORD_PREFIX}{key}");
        self.backend
            .set(&namespaced, value, ttl_seconds.unwrap_or(DEFAULT_COORD_TTL_SECS))
            .await
    }

    /// Gets a value under the `coord:` namespace.
    pub async fn get_coord(&self, key: &str) -> Option<Value> {
        if !self.is_available() {
            return None;
        }
        let namespaced = format!("{COORD_PREFIX}{key}");
        self.backend.get(&namespaced).await
    }

    /// Merges `delta` into the existing scratch value for `stream`, under
    /// the `scratch:` namespace with a 1800s TTL.
    pub async fn update_scratch(&self, stream: &str, delta: Value) -> bool {
        if !self.is_available() {
            return false;
        }
        let key = format!("{SCRATCH_PREFIX}{stream}");
        let existing = self.backend.get(&key).await;
        let merged = merge_json(existing.unwrap_or(Value::Object(Default::default())), delta);
        self.backend.set(&key, merged, SCRATCH_TTL_SECS).await
    }

    /// Reads the current merged scratch value for `stream`, if any.
    pub async fn get_scratch(&self, stream: &str) -> Option<Value> {
        if !self.is_available() {
            return None;
        }
        let key = format!("{SCRATCH_PREFIX}{stream}");
        self.backend.get(&key).await
    }

    /// Publishes a message on `notify:{channel}`.
    pub async fn publish(&self, channel: &str, message: Value) -> usize {
        if !self.is_available() {
            return 0;
        }
        let namespaced = format!("{NOTIFY_PREFIX}{channel}");
        self.backend.publish(&namespaced, message).await
    }

    /// Appends an event to `timeline:{workflow_id}`, newest-first, and
    /// refreshes the 24h TTL.
    pub async fn add_timeline(&self, workflow_id: &str, event_type: &str, data: Value) -> bool {
        if !self.is_available() {
            return false;
        }
        let key = format!("{TIMELINE_PREFIX}{workflow_id}");
        let event = TimelineEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data,
        };
        let value = serde_json::to_value(&event).unwrap_or(Value::Null);
        self.backend.lpush(&key, value, TIMELINE_TTL_SECS).await
    }

    /// Returns up to `limit` timeline events, newest-first.
    pub async fn get_timeline(&self, workflow_id: &str, limit: usize) -> Vec<TimelineEvent> {
        if !self.is_available() {
            return Vec::new();
        }
        let key = format!("{TIMELINE_PREFIX}{workflow_id}");
        self.backend
            .lrange(&key, limit)
            .await
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect()
    }

    /// Sets a workflow's state snapshot under `state:`, TTL 7200s by default.
    pub async fn set_state(&self, workflow_id: &str, state: Value, ttl_seconds: Option<i64>) -> bool {
        if !self.is_available() {
            return false;
        }
        let key = format!("{STATE_PREFIX}{workflow_id}");
        self.backend
            .set(&key, state, ttl_seconds.unwrap_or(DEFAULT_STATE_TTL_SECS))
            .await
    }

    /// Gets a workflow's state snapshot.
    pub async fn get_state(&self, workflow_id: &str) -> Option<Value> {
        if !self.is_available() {
            return None;
        }
        let key = format!("{STATE_PREFIX}{workflow_id}");
        self.backend.get(&key).await
    }

    /// Reports backend health.
    pub async fn health(&self) -> CoordinationHealth {
        if !self.is_available() {
            return CoordinationHealth {
                healthy: false,
                latency_ms: 0,
                version: None,
                connected_clients: None,
                memory_used: None,
            };
        }
        let start = std::time::Instant::now();
        let mut health = self.backend.health().await;
        health.latency_ms = start.elapsed().as_millis() as u64;
        health
    }
}

/// Shallow merge: object keys in `delta` overwrite `base`; non-object
/// deltas replace the base entirely.
fn merge_json(base: Value, delta: Value) -> Value {
    match (base, delta) {
        (Value::Object(mut base_map), Value::Object(delta_map)) => {
            let merged: HashMap<String, Value> = delta_map.into_iter().collect();
            for (k, v) in merged {
                base_map.insert(k, v);
            }
            Value::Object(base_map)
        }
        (_, delta) => delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn ready_store() -> CoordinationStore {
        let store = CoordinationStore::in_memory();
        assert!(store.initialize().await);
        store
    }

    #[tokio::test]
    async fn coord_set_and_get_round_trips() {
        let store = ready_store().await;
        assert!(store.set_coord("k", json!({"a": 1}), None).await);
        assert_eq!(store.get_coord("k").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn scratch_merges_deltas() {
        let store = ready_store().await;
        store.update_scratch("stream-a", json!({"x": 1})).await;
        store.update_scratch("stream-a", json!({"y": 2})).await;
        let merged = store.get_scratch("stream-a").await.expect("scratch value present");
        assert_eq!(merged, json!({"x": 1, "y": 2}));
    }

    #[tokio::test]
    async fn timeline_is_newest_first() {
        let store = ready_store().await;
        store.add_timeline("wf-1", "workflow_started", json!({})).await;
        store.add_timeline("wf-1", "workflow_completed", json!({})).await;
        let events = store.get_timeline("wf-1", 10).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "workflow_completed");
        assert_eq!(events[1].event_type, "workflow_started");
    }

    #[tokio::test]
    async fn degraded_mode_returns_falsy_before_initialize() {
        let store = CoordinationStore::in_memory();
        assert!(!store.set_coord("k", json!(1), None).await);
        assert!(store.get_coord("k").await.is_none());
    }
}
