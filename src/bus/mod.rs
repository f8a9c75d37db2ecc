//! In-process notification bus — topic-based publish/subscribe.
//!
//! Topics are opaque strings; a subscription pattern ending in `*` matches
//! any topic with that prefix. Each subscriber owns one bounded delivery
//! channel; `publish` never blocks on a slow reader — a full channel gets
//! the subscriber dropped and removed instead.

use serde_json::Value;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delivery channel capacity per subscriber. A subscriber that falls this
/// far behind is removed rather than back-pressuring publishers.
pub const CHANNEL_CAPACITY: usize = 64;

// ─── Well-known topics ────────────────────────────────────────────────────────

/// Broadcast on every new SSE connection.
pub const TOPIC_CLIENT_CONNECTED: &str = "mcp:client_connected";
/// Broadcast when an SSE connection closes.
pub const TOPIC_CLIENT_DISCONNECTED: &str = "mcp:client_disconnected";
/// Every incoming RPC, with the full envelope and latency.
pub const TOPIC_REQUESTS: &str = "mcp:requests";

/// Per-client delivery queue consumed by that client's SSE stream.
pub fn notifications_topic(client_id: &str) -> String {
    format!("mcp:notifications:{client_id}")
}

// ─── Bus ──────────────────────────────────────────────────────────────────────

/// One event as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

struct Subscription {
    owner: String,
    pattern: String,
    tx: mpsc::Sender<BusEvent>,
}

/// Topic publish/subscribe fabric shared by the whole host.
///
/// The subscriber list sits behind a short-lived mutex; `publish` uses
/// `try_send` only, so the lock is never held across an await.
pub struct NotificationBus {
    subs: Mutex<Vec<Subscription>>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationBus {
    pub fn new() -> Self {
        Self {
            subs: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe `owner` to a single topic pattern.
    pub fn subscribe(&self, pattern: &str, owner: &str) -> mpsc::Receiver<BusEvent> {
        self.subscribe_all(&[pattern], owner)
    }

    /// Subscribe `owner` to several patterns sharing one delivery channel.
    ///
    /// An SSE connection uses this to read its per-client queue and the
    /// broadcast topics off the same receiver.
    pub fn subscribe_all(&self, patterns: &[&str], owner: &str) -> mpsc::Receiver<BusEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut subs = self.subs.lock().expect("bus lock poisoned");
        for pattern in patterns {
            subs.push(Subscription {
                owner: owner.to_string(),
                pattern: pattern.to_string(),
                tx: tx.clone(),
            });
        }
        debug!(owner, patterns = patterns.len(), "bus subscribe");
        rx
    }

    /// Fan a payload out to every subscriber matching `topic`.
    ///
    /// Synchronous: delivery is `try_send`, and a subscriber whose channel
    /// is full or closed is removed with a warning. At most one copy per
    /// owner even when several of its patterns match.
    pub fn publish(&self, topic: &str, payload: Value) {
        let mut subs = self.subs.lock().expect("bus lock poisoned");
        let mut delivered: Vec<&str> = Vec::new();
        let mut dead: Vec<String> = Vec::new();

        for sub in subs.iter() {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            if delivered.iter().any(|o| *o == sub.owner) || dead.contains(&sub.owner) {
                continue;
            }
            let event = BusEvent {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match sub.tx.try_send(event) {
                Ok(()) => delivered.push(sub.owner.as_str()),
                Err(e) => {
                    warn!(owner = %sub.owner, topic, err = %e, "dropping dead bus subscriber");
                    dead.push(sub.owner.clone());
                }
            }
        }

        if !dead.is_empty() {
            subs.retain(|s| !dead.contains(&s.owner));
        }
    }

    /// Remove every subscription owned by `subscriber_id`.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        let mut subs = self.subs.lock().expect("bus lock poisoned");
        let before = subs.len();
        subs.retain(|s| s.owner != subscriber_id);
        if subs.len() != before {
            debug!(owner = subscriber_id, "bus unsubscribe");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.lock().expect("bus lock poisoned").len()
    }
}

/// Trailing-`*` suffix glob: `mcp:client_*` matches `mcp:client_connected`.
/// Any other pattern is an exact match.
fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn glob_matching() {
        assert!(topic_matches("mcp:client_*", "mcp:client_connected"));
        assert!(topic_matches("*", "anything"));
        assert!(topic_matches("mcp:requests", "mcp:requests"));
        assert!(!topic_matches("mcp:requests", "mcp:requests:extra"));
        assert!(!topic_matches("mcp:client_*", "mcp:requests"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe("mcp:notifications:abc", "abc");

        bus.publish("mcp:notifications:abc", json!({"n": 1}));
        bus.publish("mcp:notifications:other", json!({"n": 2}));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.topic, "mcp:notifications:abc");
        assert_eq!(ev.payload["n"], 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn per_topic_fifo_order() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe("t", "sub");
        for i in 0..5 {
            bus.publish("t", json!(i));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload, json!(i));
        }
    }

    #[tokio::test]
    async fn shared_channel_gets_one_copy_per_publish() {
        let bus = NotificationBus::new();
        let mut rx = bus.subscribe_all(&["exact:topic", "exact:*"], "c1");
        bus.publish("exact:topic", json!("x"));
        assert_eq!(rx.recv().await.unwrap().payload, json!("x"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn full_channel_drops_subscriber() {
        let bus = NotificationBus::new();
        let _rx = bus.subscribe("t", "slow");
        // Never read: fill past capacity.
        for i in 0..(CHANNEL_CAPACITY + 1) {
            bus.publish("t", json!(i));
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn closed_receiver_is_pruned_on_next_publish() {
        let bus = NotificationBus::new();
        let rx = bus.subscribe("t", "gone");
        drop(rx);
        bus.publish("t", json!(1));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_all_owned_patterns() {
        let bus = NotificationBus::new();
        let _rx = bus.subscribe_all(&["a", "b", "c"], "multi");
        assert_eq!(bus.subscriber_count(), 3);
        bus.unsubscribe("multi");
        assert_eq!(bus.subscriber_count(), 0);
    }
}
