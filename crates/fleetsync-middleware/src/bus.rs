//! Outward notification bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! observer receives every notification without any single observer blocking
//! the engine.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::Lifecycle`] | `ready`, `socket_connected`, `socket_disconnected`, `cleanedUp`, `error` |
//! | [`Topic::Context`] | One `ContextUpdated` per processed telemetry message |

use fleetsync_types::{Event, EventPayload, FleetError, LifecycleEvent};
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the notification bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Engine lifecycle transitions and errors.
    Lifecycle,
    /// Canonical context changes.
    Context,
}

/// Shared notification bus. Clone it cheaply – all clones share the same
/// underlying broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    lifecycle: broadcast::Sender<Event>,
    context: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(capacity);
        let (context, _) = broadcast::channel(capacity);
        Self { lifecycle, context }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event, or
    /// [`FleetError::Channel`] when nobody is listening on the topic.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, FleetError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| FleetError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Fire-and-forget variant of [`publish_to`](Self::publish_to): an absent
    /// audience is normal for status notifications and only logged.
    pub fn notify(&self, topic: Topic, source: &str, payload: EventPayload) -> usize {
        match self.publish_to(topic, Event::new(source, payload)) {
            Ok(n) => n,
            Err(e) => {
                debug!(?topic, error = %e, "notification dropped");
                0
            }
        }
    }

    /// Shorthand for a lifecycle notification.
    pub fn lifecycle(&self, source: &str, event: LifecycleEvent) -> usize {
        self.notify(Topic::Lifecycle, source, EventPayload::Lifecycle(event))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live observers on `topic`.
    pub fn observer_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Lifecycle => &self.lifecycle,
            Topic::Context => &self.context,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// An async receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`]. Dropping it unregisters the
/// observer.
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns `Err(RecvError::Lagged(n))` when the observer fell behind and
    /// `n` notifications were dropped, `Err(RecvError::Closed)` once the bus
    /// is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking poll, mostly useful in tests.
    pub fn try_recv(&mut self) -> Result<Event, broadcast::error::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_types::StreamCategory;

    fn context_event(key: &str) -> Event {
        Event::new(
            "fleetsync-middleware::test",
            EventPayload::ContextUpdated {
                category: StreamCategory::FleetState,
                key: key.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn topic_multiple_subscribers_receive_same_event() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut first = bus.subscribe_to(Topic::Context);
        let mut second = bus.subscribe_to(Topic::Context);

        let event = context_event("fleetA");
        bus.publish_to(Topic::Context, event.clone())?;

        assert_eq!(first.recv().await?.id, event.id);
        assert_eq!(second.recv().await?.id, event.id);
        Ok(())
    }

    #[tokio::test]
    async fn lifecycle_subscriber_does_not_receive_context_events() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut lifecycle = bus.subscribe_to(Topic::Lifecycle);
        let _context = bus.subscribe_to(Topic::Context);

        bus.publish_to(Topic::Context, context_event("fleetA"))?;

        let result = tokio::time::timeout(std::time::Duration::from_millis(50), lifecycle.recv()).await;
        assert!(result.is_err(), "lifecycle observer must not see context events");
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_an_error() {
        let bus = EventBus::default();
        assert!(bus.publish_to(Topic::Lifecycle, context_event("x")).is_err());
    }

    #[test]
    fn notify_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.lifecycle("test", LifecycleEvent::Ready), 0);
    }

    #[tokio::test]
    async fn lifecycle_shorthand_delivers_named_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Lifecycle);
        assert_eq!(bus.lifecycle("test", LifecycleEvent::SocketConnected), 1);

        let event = rx.recv().await.expect("event");
        match event.payload {
            EventPayload::Lifecycle(ev) => assert_eq!(ev.name(), "socket_connected"),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn dropping_receiver_unregisters_observer() {
        let bus = EventBus::default();
        let rx = bus.subscribe_to(Topic::Context);
        assert_eq!(bus.observer_count(Topic::Context), 1);
        drop(rx);
        assert_eq!(bus.observer_count(Topic::Context), 0);
    }

    #[tokio::test]
    async fn slow_observer_lags_instead_of_blocking() {
        let bus = EventBus::new(8);
        let mut slow = bus.subscribe_to(Topic::Context);
        for i in 0..100 {
            let _ = bus.publish_to(Topic::Context, context_event(&i.to_string()));
        }
        let result = slow.recv().await;
        assert!(
            matches!(result, Err(broadcast::error::RecvError::Lagged(_))),
            "expected Lagged error, got: {result:?}"
        );
    }
}
