use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use super::event_types;

/// Default per-subscriber buffer depth before the drop policy kicks in.
const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub id: String,
    pub blueprint_id: Option<String>,
    pub seq: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

/// What a subscriber wants to see. Empty `event_types` means everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub event_types: Vec<String>,
    pub blueprint_id: Option<String>,
}

impl SubscriptionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_blueprint(blueprint_id: impl Into<String>) -> Self {
        Self {
            event_types: Vec::new(),
            blueprint_id: Some(blueprint_id.into()),
        }
    }

    pub fn types(event_types: &[&str]) -> Self {
        Self {
            event_types: event_types.iter().map(|t| (*t).to_string()).collect(),
            blueprint_id: None,
        }
    }

    fn matches(&self, event: &SwarmEvent) -> bool {
        if let Some(wanted) = &self.blueprint_id {
            if event.blueprint_id.as_deref() != Some(wanted.as_str()) {
                return false;
            }
        }
        self.event_types.is_empty() || self.event_types.iter().any(|t| t == &event.event_type)
    }
}

struct SubscriberState {
    filter: SubscriptionFilter,
    queue: Mutex<VecDeque<SwarmEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
    capacity: usize,
}

/// Multi-subscriber event bus. Publishing never suspends and never blocks
/// on a slow subscriber: each subscriber owns a bounded buffer, and on
/// overflow the oldest non-critical event in that buffer is discarded with
/// a counter bump. Critical events (see [`event_types::is_critical`]) are
/// always enqueued, letting the buffer exceed its nominal capacity rather
/// than losing them.
pub struct EventBus {
    seq: AtomicI64,
    subscribers: Mutex<Vec<Arc<SubscriberState>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            seq: AtomicI64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Build and publish an event in one call.
    pub fn emit(
        &self,
        event_type: impl Into<String>,
        blueprint_id: Option<String>,
        payload: serde_json::Value,
    ) -> SwarmEvent {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let event = SwarmEvent {
            id: Uuid::new_v4().to_string(),
            blueprint_id,
            seq,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now().to_rfc3339(),
        };
        self.publish(event.clone());
        event
    }

    /// Fan a pre-built event out to matching subscribers.
    pub fn publish(&self, event: SwarmEvent) {
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.retain(|s| !s.closed.load(Ordering::SeqCst));
        for sub in subs.iter() {
            if !sub.filter.matches(&event) {
                continue;
            }
            let mut queue = sub.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= sub.capacity {
                if let Some(pos) = queue.iter().position(|e| !event_types::is_critical(e)) {
                    let _ = queue.remove(pos);
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                } else if !event_types::is_critical(&event) {
                    // Buffer is all-critical; the incoming droppable event
                    // loses instead.
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }
            queue.push_back(event.clone());
            drop(queue);
            sub.notify.notify_one();
        }
    }

    /// Register a subscriber. The subscription deregisters itself on drop.
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let state = Arc::new(SubscriberState {
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            capacity: SUBSCRIBER_CAPACITY,
        });
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push(state.clone());
        Subscription { state }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.retain(|s| !s.closed.load(Ordering::SeqCst));
        subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered subscriber's receive handle.
pub struct Subscription {
    state: Arc<SubscriberState>,
}

impl Subscription {
    /// Next buffered event, suspending until one arrives.
    pub async fn recv(&self) -> SwarmEvent {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.state.notify.notified().await;
        }
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&self) -> Option<SwarmEvent> {
        self.state
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<SwarmEvent> {
        let mut queue = self.state.queue.lock().expect("subscriber queue poisoned");
        queue.drain(..).collect()
    }

    /// How many events this subscriber has lost to backpressure.
    pub fn dropped_count(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}
