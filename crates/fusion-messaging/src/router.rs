use crate::pattern::{validate_topic, TopicPattern};
use fusion_core::{Event, FusionError, FusionResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

const DEFAULT_HISTORY_LIMIT: usize = 1024;

/// Identifier of a live subscription.
pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    patterns: Vec<TopicPattern>,
    tx: mpsc::UnboundedSender<Event>,
}

struct RouterState {
    next_sequence: u64,
    next_subscription: SubscriptionId,
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
    closed: bool,
}

/// In-process topic router.
///
/// Publishes are serialized under one lock, so every subscriber observes the
/// same global publish order (and therefore per-topic order). Delivery is
/// asynchronous: each subscriber owns an unbounded queue drained by
/// [`Subscription::recv`]. Cloning the router shares the same fabric.
#[derive(Clone)]
pub struct MessageRouter {
    state: Arc<Mutex<RouterState>>,
    history_limit: usize,
}

impl MessageRouter {
    /// Create a router with the default history ring size.
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create a router retaining at most `limit` published events for replay.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(RouterState {
                next_sequence: 1,
                next_subscription: 1,
                subscribers: Vec::new(),
                history: VecDeque::new(),
                closed: false,
            })),
            history_limit: limit,
        }
    }

    /// Subscribe to a single pattern.
    pub fn subscribe(&self, pattern: &str) -> FusionResult<Subscription> {
        self.subscribe_many(&[pattern])
    }

    /// Subscribe to several patterns with one receiver. An event matching more
    /// than one pattern is delivered once.
    pub fn subscribe_many(&self, patterns: &[&str]) -> FusionResult<Subscription> {
        if patterns.is_empty() {
            return Err(FusionError::Router("no patterns given".to_string()));
        }
        let parsed = patterns
            .iter()
            .map(|p| TopicPattern::parse(p))
            .collect::<FusionResult<Vec<_>>>()?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(FusionError::Router("router is closed".to_string()));
        }
        let id = state.next_subscription;
        state.next_subscription += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!(subscription = id, patterns = ?patterns, "Router: subscribed");
        state.subscribers.push(Subscriber {
            id,
            patterns: parsed,
            tx,
        });
        Ok(Subscription { id, rx })
    }

    /// Remove a subscription. Its receiver sees end-of-stream once drained.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        before != state.subscribers.len()
    }

    /// Publish a payload on a topic. Returns the number of subscribers reached.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> FusionResult<usize> {
        self.publish_event(Event::new(topic, payload))
    }

    /// Publish a payload with routing headers.
    pub fn publish_with_headers(
        &self,
        topic: &str,
        payload: serde_json::Value,
        headers: BTreeMap<String, String>,
    ) -> FusionResult<usize> {
        let mut event = Event::new(topic, payload);
        event.headers = headers;
        self.publish_event(event)
    }

    /// Publish a prepared event. The router stamps its sequence number.
    pub fn publish_event(&self, mut event: Event) -> FusionResult<usize> {
        validate_topic(&event.topic)?;

        let mut state = self.state.lock();
        if state.closed {
            return Err(FusionError::Router("router is closed".to_string()));
        }
        event.sequence = state.next_sequence;
        state.next_sequence += 1;

        let mut delivered = 0;
        state.subscribers.retain(|sub| {
            if !sub.patterns.iter().any(|p| p.matches(&event.topic)) {
                return true;
            }
            match sub.tx.send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // Receiver dropped; prune it.
                Err(_) => false,
            }
        });

        tracing::trace!(topic = %event.topic, sequence = event.sequence, delivered, "Router: published");

        if self.history_limit > 0 {
            if state.history.len() == self.history_limit {
                state.history.pop_front();
            }
            state.history.push_back(event);
        }
        Ok(delivered)
    }

    /// Number of live subscriptions whose patterns match `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.lock();
        state
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed() && s.patterns.iter().any(|p| p.matches(topic)))
            .count()
    }

    /// All patterns with at least one live subscriber, deduplicated and sorted.
    pub fn active_patterns(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut patterns: Vec<String> = state
            .subscribers
            .iter()
            .filter(|s| !s.tx.is_closed())
            .flat_map(|s| s.patterns.iter().map(|p| p.as_str().to_string()))
            .collect();
        patterns.sort();
        patterns.dedup();
        patterns
    }

    /// The most recent `limit` events, oldest first.
    pub fn history(&self, limit: usize) -> Vec<Event> {
        let state = self.state.lock();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Retained events whose topic matches `pattern`, oldest first.
    pub fn history_for(&self, pattern: &str) -> FusionResult<Vec<Event>> {
        let pattern = TopicPattern::parse(pattern)?;
        let state = self.state.lock();
        Ok(state
            .history
            .iter()
            .filter(|e| pattern.matches(&e.topic))
            .cloned()
            .collect())
    }

    /// Stop accepting publishes and end every subscription stream.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
        tracing::debug!("Router: closed");
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes lazily.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// This subscription's identifier.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event. `None` once the router is closed or the
    /// subscription removed and the queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain every event queued right now.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
