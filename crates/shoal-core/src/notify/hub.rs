use crate::session::message::micros_to_rfc3339;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// Per-subscriber queue bound. When a consumer falls this far behind, the
/// oldest queued event is dropped and counted; the publisher never blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    NewMessage,
    SessionUpdated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ChangeHint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// The wire event pushed to subscribers and across the broadcast bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: String,
    pub cause: ChangeCause,
    pub hint: ChangeHint,
}

impl SessionEvent {
    pub fn new_message(session_id: &str, message_id: i64, timestamp_us: i64) -> Self {
        Self {
            event_type: "session_changed".to_string(),
            session_id: session_id.to_string(),
            cause: ChangeCause::NewMessage,
            hint: ChangeHint {
                message_id: Some(message_id),
                timestamp: Some(micros_to_rfc3339(timestamp_us)),
            },
        }
    }

    pub fn session_updated(session_id: &str) -> Self {
        Self {
            event_type: "session_changed".to_string(),
            session_id: session_id.to_string(),
            cause: ChangeCause::SessionUpdated,
            hint: ChangeHint::default(),
        }
    }
}

struct SubscriberState {
    queue: Mutex<VecDeque<SessionEvent>>,
    wake: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberState {
    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<SessionEvent>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock_queue().clear();
        self.wake.notify_waiters();
    }
}

/// In-process fan-out of session change events.
///
/// Delivery is best-effort and non-durable: late subscribers see future
/// events only, and a full subscriber queue sheds its oldest event rather
/// than slowing anyone down. Per subscriber, delivery order is FIFO.
pub struct NotificationHub {
    sessions: DashMap<String, HashMap<u64, Arc<SubscriberState>>>,
    next_subscriber: AtomicU64,
    dropped: AtomicU64,
    capacity: usize,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, session_id: &str) -> Subscription {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        });
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(id, state.clone());

        tracing::debug!(session_id, subscriber = id, "subscribed");

        Subscription {
            session_id: session_id.to_string(),
            state,
        }
    }

    /// Deliver `event` to every subscriber of `session_id`. Called after
    /// the storage transaction commits; never blocks and never fails.
    /// Subscribers whose handles were dropped are pruned here.
    pub fn publish(&self, session_id: &str, event: SessionEvent) {
        let mut emptied = false;
        if let Some(mut subscribers) = self.sessions.get_mut(session_id) {
            subscribers.retain(|_, state| !state.closed.load(Ordering::Acquire));
            for state in subscribers.values() {
                {
                    let mut queue = state.lock_queue();
                    if queue.len() >= self.capacity {
                        queue.pop_front();
                        state.dropped.fetch_add(1, Ordering::Relaxed);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    queue.push_back(event.clone());
                }
                state.wake.notify_one();
            }
            emptied = subscribers.is_empty();
        }
        if emptied {
            self.sessions
                .remove_if(session_id, |_, subscribers| subscribers.is_empty());
        }
    }

    /// Live subscriptions for one session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|subscribers| {
                subscribers
                    .values()
                    .filter(|state| !state.closed.load(Ordering::Acquire))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Total events shed across all subscribers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one `(session_id, subscriber)` pair. Dropping it (or the
/// transport disconnecting) unsubscribes and releases buffered events.
pub struct Subscription {
    session_id: String,
    state: Arc<SubscriberState>,
}

impl Subscription {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Next event, in publish order. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let notified = self.state.wake.notified();
            if let Some(event) = self.state.lock_queue().pop_front() {
                return Some(event);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.state.lock_queue().pop_front()
    }

    /// Events shed from this subscriber's queue.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Explicit unsubscribe; dropping the handle does the same.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.close();
    }
}
