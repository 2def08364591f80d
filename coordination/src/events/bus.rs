//! Event bus for orchestration coordination.
//!
//! Pub/sub over a Tokio broadcast channel. Checkpointing is the
//! coordinator's job, not the bus's — subscribers that need durability
//! persist what they receive themselves.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::OrchestratorEvent;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("failed to send event: {0}")]
    SendFailed(String),

    #[error("channel closed")]
    ChannelClosed,
}

pub type EventBusResult<T> = Result<T, EventBusError>;

pub type SharedEventBus = Arc<EventBus>;

/// Broadcast wrapper publishers use to fan events out to every subscriber.
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers. A missing-receivers condition
    /// is not an error — nobody is listening yet.
    pub fn publish(&self, event: OrchestratorEvent) -> EventBusResult<()> {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(count) => {
                debug!(event_type, receivers = count, "event published");
                Ok(())
            }
            Err(_) => {
                debug!(event_type, "event published (no receivers)");
                Ok(())
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Selective subscription filter.
#[derive(Default)]
pub struct EventFilter {
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub event_types: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(mut self, project_id: &str) -> Self {
        self.project_id = Some(project_id.to_string());
        self
    }

    pub fn task(mut self, task_id: &str) -> Self {
        self.task_id = Some(task_id.to_string());
        self
    }

    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, event: &OrchestratorEvent) -> bool {
        if let Some(ref pid) = self.project_id {
            if let Some(event_pid) = event.project_id() {
                if event_pid != pid {
                    return false;
                }
            }
        }

        if let Some(ref tid) = self.task_id {
            if let Some(event_tid) = event.task_id() {
                if event_tid != tid {
                    return false;
                }
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        true
    }
}

/// Filtered event receiver that only yields matching events.
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<OrchestratorEvent>,
    filter: EventFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<OrchestratorEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<OrchestratorEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

pub trait EventBusExt {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver;
}

impl EventBusExt for EventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

impl EventBusExt for SharedEventBus {
    fn subscribe_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_started(project_id: &str, task_id: &str) -> OrchestratorEvent {
        OrchestratorEvent::TaskStarted {
            project_id: project_id.to_string(),
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(task_started("p1", "t1")).unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "task:started");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::new().shared();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(task_started("p1", "t1")).unwrap();

        let e1 = rx1.recv().await.unwrap();
        let e2 = rx2.recv().await.unwrap();

        assert_eq!(e1.event_type(), e2.event_type());
    }

    #[test]
    fn filter_matches_project_and_type() {
        let filter = EventFilter::new()
            .project("p1")
            .types(vec!["task:started", "task:completed"]);

        let matching = task_started("p1", "t1");
        let wrong_project = task_started("p2", "t2");
        let wrong_type = OrchestratorEvent::AgentIdle {
            agent_id: "a1".into(),
            idle_since: Utc::now(),
        };

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&wrong_project));
        assert!(!filter.matches(&wrong_type));
    }

    #[tokio::test]
    async fn filtered_receiver_skips_non_matching() {
        let bus = EventBus::new();
        let filter = EventFilter::new().task("target-task");
        let mut filtered = bus.subscribe_filtered(filter);

        let bus_clone = bus;
        tokio::spawn(async move {
            bus_clone.publish(task_started("p1", "other-task")).unwrap();
            bus_clone.publish(task_started("p1", "target-task")).unwrap();
        });

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.task_id(), Some("target-task"));
    }
}
