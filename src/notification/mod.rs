//! Notification bus
//!
//! Each project owns one [`EventStream`]: an append-only sequence of
//! [`NotificationEvent`]s fanned out to live subscribers over a
//! `tokio::sync::broadcast` channel. The controller owns one more stream for
//! compute-host events.
//!
//! Guarantees:
//! - `sequence` is strictly increasing per stream, assigned under the stream
//!   lock together with the send, so delivery order is commit order
//! - events published with no subscriber are discarded; late subscribers
//!   start from a snapshot, not a replay
//! - a subscriber that falls behind, or resumes after a gap, receives an
//!   explicit [`StreamItem::Missed`] range instead of a silent resync

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::trace;
use uuid::Uuid;

/// Default broadcast buffer per stream
pub const DEFAULT_CAPACITY: usize = 1024;

/// Kind of state change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "compute.created")]
    ComputeCreated,
    #[serde(rename = "compute.updated")]
    ComputeUpdated,
    #[serde(rename = "compute.deleted")]
    ComputeDeleted,
    #[serde(rename = "project.opened")]
    ProjectOpened,
    #[serde(rename = "project.closed")]
    ProjectClosed,
    #[serde(rename = "node.created")]
    NodeCreated,
    #[serde(rename = "node.updated")]
    NodeUpdated,
    #[serde(rename = "node.deleted")]
    NodeDeleted,
    #[serde(rename = "link.created")]
    LinkCreated,
    #[serde(rename = "link.updated")]
    LinkUpdated,
    #[serde(rename = "link.deleted")]
    LinkDeleted,
    #[serde(rename = "capture.started")]
    CaptureStarted,
    #[serde(rename = "capture.stopped")]
    CaptureStopped,
    #[serde(rename = "drawing.created")]
    DrawingCreated,
    #[serde(rename = "drawing.updated")]
    DrawingUpdated,
    #[serde(rename = "drawing.deleted")]
    DrawingDeleted,
}

/// Immutable record of one committed state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "projectId", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,

    pub sequence: u64,

    pub kind: EventKind,

    pub payload: Value,

    pub timestamp: DateTime<Utc>,
}

/// Marker telling a subscriber that a range of events was not delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedEvents {
    /// Always "events.missed"
    pub kind: String,
    pub from: u64,
    pub to: u64,
}

impl MissedEvents {
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            kind: "events.missed".to_string(),
            from,
            to,
        }
    }
}

/// One item of a subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamItem {
    Event(NotificationEvent),
    Missed(MissedEvents),
}

struct StreamInner {
    sequence: u64,
    sender: Option<broadcast::Sender<NotificationEvent>>,
}

/// Single-writer, multi-reader ordered event stream
pub struct EventStream {
    scope: Option<Uuid>,
    inner: Mutex<StreamInner>,
}

impl EventStream {
    /// Create a stream scoped to a project (`Some`) or to the controller (`None`)
    pub fn new(scope: Option<Uuid>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            scope,
            inner: Mutex::new(StreamInner {
                sequence: 0,
                sender: Some(sender),
            }),
        }
    }

    /// Append an event and fan it out to current subscribers
    ///
    /// Returns `None` once the stream has been closed.
    pub fn publish(&self, kind: EventKind, payload: impl Serialize) -> Option<NotificationEvent> {
        let payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = inner.sender.clone()?;

        inner.sequence += 1;
        let event = NotificationEvent {
            project_id: self.scope,
            sequence: inner.sequence,
            kind,
            payload,
            timestamp: Utc::now(),
        };

        // No receivers: the event is dropped, state remains the source of truth
        let delivered = sender.send(event.clone()).unwrap_or(0);
        trace!(
            "Published {:?} #{} to {} subscriber(s)",
            kind,
            event.sequence,
            delivered
        );
        Some(event)
    }

    /// Sequence number of the last published event
    pub fn sequence(&self) -> u64 {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sequence
    }

    /// Subscribe to events published from now on
    ///
    /// `resume_from` is the last sequence number a reconnecting client saw.
    /// If later events were already discarded, the subscription starts with
    /// a [`StreamItem::Missed`] covering them.
    pub fn subscribe(&self, resume_from: Option<u64>) -> Option<Subscription> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let receiver = inner.sender.as_ref()?.subscribe();
        let current = inner.sequence;

        let pending = match resume_from {
            Some(seen) if seen < current => Some(StreamItem::Missed(MissedEvents::new(
                seen + 1,
                current,
            ))),
            // Client is ahead of us: the stream was recreated since it last read
            Some(seen) if seen > current && current > 0 => {
                Some(StreamItem::Missed(MissedEvents::new(1, current)))
            }
            _ => None,
        };

        Some(Subscription {
            receiver,
            last_sequence: current,
            pending,
        })
    }

    /// Publish a final event and end every subscription
    pub fn close(&self, kind: EventKind, payload: impl Serialize) -> Option<NotificationEvent> {
        let event = self.publish(kind, payload);
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.sender = None;
        event
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sender
            .as_ref()
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(None, DEFAULT_CAPACITY)
    }
}

/// A live subscription to one event stream
pub struct Subscription {
    receiver: broadcast::Receiver<NotificationEvent>,
    last_sequence: u64,
    pending: Option<StreamItem>,
}

impl Subscription {
    /// Sequence number of the last item handed out (or the subscribe point)
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    /// Next item in sequence order; `None` once the stream is closed
    pub async fn next(&mut self) -> Option<StreamItem> {
        if let Some(item) = self.pending.take() {
            return Some(item);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) if event.sequence <= self.last_sequence => continue,
                Ok(event) if event.sequence > self.last_sequence + 1 => {
                    let missed = MissedEvents::new(self.last_sequence + 1, event.sequence - 1);
                    self.last_sequence = event.sequence;
                    self.pending = Some(StreamItem::Event(event));
                    return Some(StreamItem::Missed(missed));
                }
                Ok(event) => {
                    self.last_sequence = event.sequence;
                    return Some(StreamItem::Event(event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    let from = self.last_sequence + 1;
                    self.last_sequence += skipped;
                    return Some(StreamItem::Missed(MissedEvents::new(
                        from,
                        self.last_sequence,
                    )));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Adapt into a `Stream` for HTTP/websocket delivery
    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next().await.map(|item| (item, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sequence_of(item: StreamItem) -> u64 {
        match item {
            StreamItem::Event(e) => e.sequence,
            StreamItem::Missed(m) => panic!("unexpected missed range {:?}", m),
        }
    }

    #[tokio::test]
    async fn test_sequence_strictly_increasing() {
        let stream = EventStream::new(Some(Uuid::new_v4()), 16);
        let mut sub = stream.subscribe(None).unwrap();

        for i in 0..5 {
            stream.publish(EventKind::NodeUpdated, json!({ "i": i }));
        }

        let mut last = 0;
        for _ in 0..5 {
            let seq = sequence_of(sub.next().await.unwrap());
            assert_eq!(seq, last + 1);
            last = seq;
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_still_advances() {
        let stream = EventStream::new(None, 16);
        stream.publish(EventKind::ComputeCreated, json!({}));
        stream.publish(EventKind::ComputeUpdated, json!({}));
        assert_eq!(stream.sequence(), 2);

        // Late subscriber starts after the discarded events
        let mut sub = stream.subscribe(None).unwrap();
        stream.publish(EventKind::ComputeDeleted, json!({}));
        assert_eq!(sequence_of(sub.next().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_resume_reports_missed_range() {
        let stream = EventStream::new(None, 16);
        for _ in 0..4 {
            stream.publish(EventKind::NodeCreated, json!({}));
        }

        let mut sub = stream.subscribe(Some(1)).unwrap();
        assert_eq!(
            sub.next().await,
            Some(StreamItem::Missed(MissedEvents::new(2, 4)))
        );

        let mut up_to_date = stream.subscribe(Some(4)).unwrap();
        stream.publish(EventKind::NodeCreated, json!({}));
        assert_eq!(sequence_of(up_to_date.next().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_told_about_gap() {
        let stream = EventStream::new(None, 2);
        let mut sub = stream.subscribe(None).unwrap();

        for _ in 0..5 {
            stream.publish(EventKind::NodeUpdated, json!({}));
        }

        match sub.next().await.unwrap() {
            StreamItem::Missed(m) => {
                assert_eq!(m.from, 1);
                assert_eq!(m.to, 3);
            }
            other => panic!("expected missed range, got {:?}", other),
        }
        assert_eq!(sequence_of(sub.next().await.unwrap()), 4);
        assert_eq!(sequence_of(sub.next().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let stream = EventStream::new(Some(Uuid::new_v4()), 8);
        let mut sub = stream.subscribe(None).unwrap();

        let last = stream.close(EventKind::ProjectClosed, json!({}));
        assert!(last.is_some());
        assert!(stream.is_closed());

        match sub.next().await {
            Some(StreamItem::Event(e)) => assert_eq!(e.kind, EventKind::ProjectClosed),
            other => panic!("expected close event, got {:?}", other),
        }
        assert_eq!(sub.next().await, None);
        assert!(stream.subscribe(None).is_none());
        assert!(stream.publish(EventKind::NodeUpdated, json!({})).is_none());
    }

    #[test]
    fn test_idle_subscription_wakes_on_publish() {
        let stream = EventStream::new(None, 4);
        let mut sub = stream.subscribe(None).unwrap();

        let mut next = tokio_test::task::spawn(sub.next());
        tokio_test::assert_pending!(next.poll());

        stream.publish(EventKind::NodeCreated, json!({}));
        assert!(next.is_woken());
        match tokio_test::assert_ready!(next.poll()) {
            Some(StreamItem::Event(e)) => assert_eq!(e.sequence, 1),
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::CaptureStopped).unwrap();
        assert_eq!(json, "\"capture.stopped\"");

        let missed = serde_json::to_value(StreamItem::Missed(MissedEvents::new(3, 7))).unwrap();
        assert_eq!(missed["kind"], "events.missed");
        assert_eq!(missed["to"], 7);
    }
}
