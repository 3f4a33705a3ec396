//! Bounded, non-blocking event bus.
//!
//! Every publish path in this crate (config updates, adapter
//! connection events, supervisor reconcile events, activity) shares the
//! same shape: a `tokio::sync::mpsc` channel per subscriber, `try_send`
//! only, drop-on-full with a `warn!` log. Never blocks a publisher
//! (spec §4/§5).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

/// Top-level event category (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Activity,
}

/// A single bus event. `payload` carries the typed, category-specific
/// body (spec §6's event payload shapes) as JSON — the bus itself
/// doesn't interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub category: EventCategory,
    pub event_type: String,
    pub server_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    pub fn lifecycle(event_type: impl Into<String>, server_name: impl Into<String>, payload: Value) -> Self {
        Self {
            category: EventCategory::Lifecycle,
            event_type: event_type.into(),
            server_name: Some(server_name.into()),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn activity(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            category: EventCategory::Activity,
            event_type: event_type.into(),
            server_name: None,
            timestamp: Utc::now(),
            payload,
        }
    }
}

struct Subscription {
    id: u64,
    sender: mpsc::Sender<Arc<Event>>,
}

/// A bounded, fan-out, drop-on-full event bus. One instance is shared
/// by the adapter (connection lifecycle events) and the supervisor
/// (reconcile/quarantine events); the buffer size is the caller's
/// choice per spec §4.3/§4.4's differing defaults (adapter: 50-100,
/// supervisor: 200, activity SSE: >=500).
pub struct EventBus {
    buffer: usize,
    subscribers: RwLock<Vec<Subscription>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            subscribers: RwLock::new(Vec::new()),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.write().await.push(Subscription { id, sender: tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.write().await.retain(|s| s.id != id);
    }

    /// Publish to every subscriber. Non-blocking: a full subscriber
    /// channel drops this event for that subscriber only, with a
    /// `warn!` — publishers never wait on slow readers.
    pub async fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let subs = self.subscribers.read().await;
        for sub in subs.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = sub.sender.try_send(event.clone()) {
                tracing::warn!(
                    subscriber_id = sub.id,
                    event_type = %event.event_type,
                    "event bus: subscriber channel full, dropping event"
                );
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_fans_out_to_all_subscribers() {
        let bus = EventBus::new(8);
        let (_id1, mut rx1) = bus.subscribe().await;
        let (_id2, mut rx2) = bus.subscribe().await;

        bus.publish(Event::lifecycle("server.connected", "svc", serde_json::json!({}))).await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn full_channel_drops_without_blocking() {
        let bus = EventBus::new(1);
        let (_id, mut rx) = bus.subscribe().await;

        bus.publish(Event::lifecycle("a", "svc", serde_json::json!({}))).await;
        // second publish should drop silently (channel capacity 1, unread)
        bus.publish(Event::lifecycle("b", "svc", serde_json::json!({}))).await;

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, "a");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let (id, mut rx) = bus.subscribe().await;
        bus.unsubscribe(id).await;
        bus.publish(Event::lifecycle("a", "svc", serde_json::json!({}))).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.subscriber_count().await, 0);
    }
}
