//! Broadcast event bus shared by the orchestrator and the HTTP layer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    published: Arc<AtomicUsize>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Publish an envelope to all subscribers.
    ///
    /// Returns the number of subscribers that received it; with no
    /// subscribers the envelope is dropped and 0 is returned.
    pub fn publish(&self, envelope: EventEnvelope) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn emit(&self, event: Event) -> usize {
        self.publish(EventEnvelope::new(event))
    }

    /// Publisher that stamps every envelope with a workspace root.
    pub fn scoped(&self, workspace: impl Into<String>) -> ScopedPublisher {
        ScopedPublisher {
            bus: self.clone(),
            workspace: workspace.into(),
        }
    }

    /// Only events published after this call are received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn event_count(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ScopedPublisher {
    bus: EventBus,
    workspace: String,
}

impl ScopedPublisher {
    pub fn emit(&self, event: Event) -> usize {
        self.bus
            .publish(EventEnvelope::new(event).with_workspace(self.workspace.clone()))
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }
}
