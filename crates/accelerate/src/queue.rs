//! In-memory event queue.

use crate::types::{Event, RecordedEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Events waiting for the next flush.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventQueue {
    /// Create a new event queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an event to the queue.
    pub async fn enqueue(&self, event: RecordedEvent) {
        let mut events = self.events.lock().await;
        events.push(event);
    }

    /// Get the number of events in the queue.
    pub async fn len(&self) -> usize {
        let events = self.events.lock().await;
        events.len()
    }

    /// Check if the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Take every queued event, leaving the queue empty.
    pub async fn drain(&self) -> Vec<RecordedEvent> {
        let mut events = self.events.lock().await;
        std::mem::take(&mut *events)
    }
}

/// Fold a snapshot into the `{eventId: event}` map. Later entries win.
pub fn into_event_map(events: Vec<RecordedEvent>) -> BTreeMap<String, Event> {
    events
        .into_iter()
        .fold(BTreeMap::new(), |mut map, recorded| {
            map.insert(recorded.id, recorded.event);
            map
        })
}
