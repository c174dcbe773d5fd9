//! Event bus: pub/sub over a Tokio broadcast channel, with a bounded
//! in-memory history ring for inspection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use super::types::SupervisionEvent;

/// Channel capacity for broadcast.
const CHANNEL_CAPACITY: usize = 256;

/// Default number of events the history ring retains.
const HISTORY_CAPACITY: usize = 500;

/// Shared reference to the event bus.
pub type SharedEventBus = Arc<EventBus>;

/// Bounded ring of recently published events.
#[derive(Debug)]
pub struct EventHistory {
    entries: Mutex<VecDeque<SupervisionEvent>>,
    capacity: usize,
}

impl EventHistory {
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn record(&self, event: &SupervisionEvent) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        entries.push_back(event.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// All retained events, oldest first.
    pub fn entries(&self) -> Vec<SupervisionEvent> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Retained events of one type, oldest first.
    pub fn of_type(&self, event_type: &str) -> Vec<SupervisionEvent> {
        self.entries()
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Retained events for one skill, oldest first.
    pub fn for_skill(&self, skill: &str) -> Vec<SupervisionEvent> {
        self.entries()
            .into_iter()
            .filter(|e| e.skill() == Some(skill))
            .collect()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// Event bus with broadcast fanout and optional history recording.
pub struct EventBus {
    sender: broadcast::Sender<SupervisionEvent>,
    history: Option<Arc<EventHistory>>,
}

impl EventBus {
    /// Create a bus without history.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: None,
        }
    }

    /// Create a bus that records into the given history ring.
    pub fn with_history(history: Arc<EventHistory>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            history: Some(history),
        }
    }

    /// Create a shared reference to this bus.
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. Having no subscribers is fine.
    pub fn publish(&self, event: SupervisionEvent) {
        if let Some(history) = &self.history {
            history.record(&event);
        }
        match self.sender.send(event) {
            Ok(count) => debug!(receivers = count, "event published"),
            Err(broadcast::error::SendError(event)) => {
                debug!(event_type = event.event_type(), "event published (no receivers)");
            }
        }
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.sender.subscribe()
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_event(skill: &str) -> SupervisionEvent {
        SupervisionEvent::SkillSucceeded {
            skill: skill.to_string(),
            duration_ms: 5,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();
        bus.publish(sample_event("audit"));
        let event = receiver.recv().await.unwrap();
        assert_eq!(event.event_type(), "success");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(sample_event("audit"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(sample_event("audit"));
        assert_eq!(rx1.recv().await.unwrap().event_type(), "success");
        assert_eq!(rx2.recv().await.unwrap().event_type(), "success");
    }

    #[test]
    fn test_history_ring_bounded() {
        let history = Arc::new(EventHistory::with_capacity(3));
        let bus = EventBus::with_history(history.clone());
        for i in 0..5 {
            bus.publish(sample_event(&format!("skill-{i}")));
        }
        let entries = history.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].skill(), Some("skill-2"));
    }

    #[test]
    fn test_history_filters() {
        let history = Arc::new(EventHistory::new());
        let bus = EventBus::with_history(history.clone());
        bus.publish(sample_event("audit"));
        bus.publish(SupervisionEvent::RouteMissed {
            message_preview: "hm".to_string(),
            timestamp: Utc::now(),
        });

        assert_eq!(history.of_type("no-match").len(), 1);
        assert_eq!(history.for_skill("audit").len(), 1);
    }
}
