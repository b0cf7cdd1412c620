//! Change-Data-Capture Event Pipeline
//!
//! Mutations must not wait on the broker. The node pushes every SET
//! and DEL into an in-process bounded queue and returns; a single
//! consumer task drains the queue and hands events to an [`EventSink`]
//! (the AMQP publisher in production, a recording sink in tests).
//!
//! When the queue is full the configured [`EnqueuePolicy`] decides:
//! `DropOldest` evicts the head and counts the loss, `Block` makes the
//! producer wait for space up to a bound and fails with
//! [`PublishError::Full`] when the bound expires. Delivery is
//! at-least-once from enqueue to the sink's publish call; consumers
//! downstream resolve redeliveries by treating the latest write per
//! key as the truth.

pub mod amqp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Default queue capacity, sized for a burst of writes while the
/// broker hiccups.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Kind of mutation an event describes. Serialized as a bare integer
/// (0 = SET, 1 = DEL) to keep message bodies small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventKind {
    Set,
    Del,
}

impl From<EventKind> for u8 {
    fn from(kind: EventKind) -> u8 {
        match kind {
            EventKind::Set => 0,
            EventKind::Del => 1,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(EventKind::Set),
            1 => Ok(EventKind::Del),
            other => Err(format!("unknown event type tag {other}")),
        }
    }
}

/// One mutation, as published to CDC consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Event {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Set,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Del,
            key: key.into(),
            value: None,
        }
    }
}

/// What `publish` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnqueuePolicy {
    /// Evict the oldest queued event and count the loss. `publish`
    /// never waits.
    #[default]
    DropOldest,
    /// Wait for the consumer to free a slot, but no longer than the
    /// given bound; past it, `publish` fails with
    /// [`PublishError::Full`]. At-least-once at the cost of
    /// backpressure on the write path. Keep the bound below the RPC
    /// deadlines so a wedged broker fails the write before the
    /// caller times out.
    Block(Duration),
}

/// Destination for drained events. Production uses
/// [`amqp::AmqpPublisher`]; tests substitute a recording sink.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &Event) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event bus is closed")]
    Closed,

    /// The queue stayed full for the whole `Block` wait bound.
    #[error("event queue full")]
    Full,
}

#[derive(Debug)]
struct BusState {
    queue: VecDeque<Event>,
    closed: bool,
}

enum Pop {
    Item(Event),
    Empty,
    Done,
}

/// Bounded in-process event queue with one consumer.
#[derive(Debug)]
pub struct EventBus {
    state: Mutex<BusState>,
    data_ready: Notify,
    space_ready: Notify,
    capacity: usize,
    policy: EnqueuePolicy,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize, policy: EnqueuePolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                queue: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            capacity,
            policy,
            dropped: AtomicU64::new(0),
        })
    }

    /// Enqueues an event. Under `DropOldest` this never awaits; under
    /// `Block` it waits for space up to the policy's bound and fails
    /// with [`PublishError::Full`] past it.
    pub async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let deadline = match self.policy {
            EnqueuePolicy::Block(wait) => Some(tokio::time::Instant::now() + wait),
            EnqueuePolicy::DropOldest => None,
        };

        loop {
            let space = self.space_ready.notified();
            {
                let mut state = self.state.lock().unwrap();
                if state.closed {
                    return Err(PublishError::Closed);
                }
                if state.queue.len() < self.capacity {
                    state.queue.push_back(event);
                    self.data_ready.notify_one();
                    return Ok(());
                }
                match self.policy {
                    EnqueuePolicy::DropOldest => {
                        state.queue.pop_front();
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if total.is_power_of_two() {
                            warn!(dropped = total, "event queue full, dropping oldest");
                        }
                        state.queue.push_back(event);
                        self.data_ready.notify_one();
                        return Ok(());
                    }
                    EnqueuePolicy::Block(_) => {}
                }
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, space).await.is_err() {
                        return Err(PublishError::Full);
                    }
                }
                // DropOldest always returns inside the lock block.
                None => space.await,
            }
        }
    }

    fn try_pop(&self) -> Pop {
        let mut state = self.state.lock().unwrap();
        if let Some(event) = state.queue.pop_front() {
            self.space_ready.notify_one();
            Pop::Item(event)
        } else if state.closed {
            Pop::Done
        } else {
            Pop::Empty
        }
    }

    /// Stops accepting events. The consumer drains what is queued and
    /// exits; blocked producers fail with [`PublishError::Closed`].
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.data_ready.notify_waiters();
        self.space_ready.notify_waiters();
    }

    /// Events evicted by the `DropOldest` policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumer loop: drains the queue into `sink` until the bus is
    /// closed and empty. Broker failures are logged and the event is
    /// abandoned; nothing here may wedge the queue.
    ///
    /// Spawn this on its own task and await the handle (with a
    /// deadline) during shutdown to drain.
    pub async fn run_publisher(self: Arc<Self>, sink: Arc<dyn EventSink>) {
        loop {
            let ready = self.data_ready.notified();
            match self.try_pop() {
                Pop::Item(event) => {
                    if let Err(e) = sink.publish(&event).await {
                        warn!(key = %event.key, error = %e, "broker publish failed");
                    }
                }
                Pop::Done => break,
                Pop::Empty => ready.await,
            }
        }
        info!("event publisher drained and stopped");
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use std::time::Duration;

    #[test]
    fn event_json_uses_integer_tag() {
        let set = serde_json::to_value(Event::set("k", "v")).unwrap();
        assert_eq!(set["type"], 0);
        assert_eq!(set["key"], "k");
        assert_eq!(set["value"], "v");

        let del = serde_json::to_value(Event::del("k")).unwrap();
        assert_eq!(del["type"], 1);
        // DEL events carry no value field at all.
        assert!(del.get("value").is_none());
    }

    #[test]
    fn event_json_round_trips() {
        let event = Event::set("user:1", "alice");
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(serde_json::from_str::<Event>(&json).unwrap(), event);

        let bad: Result<Event, _> = serde_json::from_str(r#"{"type":7,"key":"k"}"#);
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn consumer_receives_events_in_order() {
        let bus = EventBus::new(16, EnqueuePolicy::DropOldest);
        let sink = Arc::new(RecordingSink::default());
        let handle = tokio::spawn(Arc::clone(&bus).run_publisher(sink.clone()));

        bus.publish(Event::set("a", "1")).await.unwrap();
        bus.publish(Event::del("a")).await.unwrap();
        bus.publish(Event::set("b", "2")).await.unwrap();

        bus.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let events = sink.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![Event::set("a", "1"), Event::del("a"), Event::set("b", "2")]
        );
    }

    #[tokio::test]
    async fn drop_oldest_evicts_head_and_counts() {
        let bus = EventBus::new(2, EnqueuePolicy::DropOldest);

        bus.publish(Event::set("a", "1")).await.unwrap();
        bus.publish(Event::set("b", "2")).await.unwrap();
        bus.publish(Event::set("c", "3")).await.unwrap();

        assert_eq!(bus.dropped(), 1);
        assert_eq!(bus.len(), 2);

        // The survivor set is the two newest.
        let sink = Arc::new(RecordingSink::default());
        let handle = tokio::spawn(Arc::clone(&bus).run_publisher(sink.clone()));
        bus.close();
        handle.await.unwrap();

        let keys: Vec<_> = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.key.clone())
            .collect();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn block_policy_waits_for_space() {
        let bus = EventBus::new(1, EnqueuePolicy::Block(Duration::from_secs(5)));
        bus.publish(Event::set("a", "1")).await.unwrap();

        let blocked = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish(Event::set("b", "2")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // Draining one event unblocks the producer.
        let sink = Arc::new(RecordingSink::default());
        let consumer = tokio::spawn(Arc::clone(&bus).run_publisher(sink.clone()));

        blocked.await.unwrap().unwrap();
        bus.close();
        consumer.await.unwrap();
        assert_eq!(bus.dropped(), 0);
        assert_eq!(sink.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn block_policy_fails_when_the_wait_expires() {
        let bus = EventBus::new(1, EnqueuePolicy::Block(Duration::from_millis(50)));
        bus.publish(Event::set("a", "1")).await.unwrap();

        // No consumer is draining, so the queue stays full past the
        // bound and the publish fails instead of wedging the writer.
        assert_eq!(
            bus.publish(Event::set("b", "2")).await,
            Err(PublishError::Full)
        );
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.dropped(), 0);
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let bus = EventBus::new(4, EnqueuePolicy::DropOldest);
        bus.close();
        assert_eq!(
            bus.publish(Event::set("a", "1")).await,
            Err(PublishError::Closed)
        );
    }

    #[tokio::test]
    async fn sink_failure_does_not_wedge_the_queue() {
        let bus = EventBus::new(8, EnqueuePolicy::DropOldest);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let handle = tokio::spawn(Arc::clone(&bus).run_publisher(sink));

        bus.publish(Event::set("a", "1")).await.unwrap();
        bus.publish(Event::set("b", "2")).await.unwrap();
        bus.close();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(bus.is_empty());
    }
}
